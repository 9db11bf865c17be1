//! Export, import and delay-import directory extraction
//!
//! Thunk values are widened to u64 no matter the source image width, so the
//! resolver does not need to care whether they came from a PE32 or PE32+
//! image.

use crate::common::LddError;
use crate::graph::{ExportEntry, ImportEntry};
use crate::pe::{PeImage, DIR_DELAY_IMPORT, DIR_EXPORT, DIR_IMPORT};
use std::collections::HashMap;

/// Import slots of one module, grouped under the imported module's name
#[derive(Debug, Clone)]
pub struct ImportedModule {
    pub dll: String,
    pub entries: Vec<ImportEntry>,
}

const ORDINAL_FLAG32: u32 = 0x8000_0000;
const ORDINAL_FLAG64: u64 = 1 << 63;

// guards against descriptor tables that run off into garbage
const MAX_DESCRIPTORS: usize = 4096;
const MAX_THUNKS: usize = 0x10000;

/// Read the export directory into one entry per export ordinal, in file order
///
/// An export whose address falls inside the export directory's own range is a
/// forwarder; its target string is recorded and resolved later.
pub fn extract_exports(image: &PeImage) -> Result<Vec<ExportEntry>, LddError> {
    let dir = match image.data_dir(DIR_EXPORT) {
        Some(dir) => dir,
        None => return Ok(Vec::new()),
    };
    let base = image
        .rva_to_offset(dir.rva)
        .ok_or_else(|| LddError::BadFormat("export directory outside any section".to_owned()))?;

    let ordinal_base = image.u32_at(base + 16)?;
    let function_count = image.u32_at(base + 20)? as usize;
    let name_count = image.u32_at(base + 24)? as usize;
    let functions_rva = image.u32_at(base + 28)?;
    let names_rva = image.u32_at(base + 32)?;
    let name_ordinals_rva = image.u32_at(base + 36)?;

    if function_count > MAX_THUNKS || name_count > MAX_THUNKS {
        return Err(LddError::BadFormat("oversized export directory".to_owned()));
    }

    // the name pointer table is sorted by name, not by ordinal; the parallel
    // ordinal table maps each name back to its address table slot
    let mut names: HashMap<usize, String> = HashMap::new();
    for i in 0..name_count {
        let name_rva = image.u32_at_rva(names_rva + (i * 4) as u32)?;
        let slot = image.u16_at_rva(name_ordinals_rva + (i * 2) as u32)? as usize;
        names.insert(slot, image.cstr_at_rva(name_rva)?);
    }

    let mut exports = Vec::with_capacity(function_count);
    for i in 0..function_count {
        let rva = image.u32_at_rva(functions_rva + (i * 4) as u32)?;
        if rva == 0 {
            // empty address table slot
            continue;
        }
        let forward = if dir.contains(rva) {
            Some(image.cstr_at_rva(rva)?)
        } else {
            None
        };
        exports.push(ExportEntry {
            rva,
            address: image.image_base + rva as u64,
            name: names.get(&i).cloned(),
            ordinal: ordinal_base + i as u32,
            forward,
            forward_to: None,
            section: image.section_of_rva(rva),
        });
    }
    Ok(exports)
}

/// Read the ordinary and delay-load import directories
///
/// Groups come back in directory order, ordinary imports first. Every entry of
/// a delay descriptor is flagged `delayed`.
pub fn extract_imports(image: &PeImage) -> Result<Vec<ImportedModule>, LddError> {
    let mut modules = Vec::new();

    if let Some(dir) = image.data_dir(DIR_IMPORT) {
        for i in 0..MAX_DESCRIPTORS {
            let desc = dir.rva + (i * 20) as u32;
            let name_rva = image.u32_at_rva(desc + 12)?;
            if name_rva == 0 {
                break;
            }
            let original_first_thunk = image.u32_at_rva(desc)?;
            let first_thunk = image.u32_at_rva(desc + 16)?;
            // an unbound image may leave the INT out entirely
            let int_rva = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };
            modules.push(ImportedModule {
                dll: image.cstr_at_rva(name_rva)?,
                entries: read_thunks(image, int_rva, first_thunk, false)?,
            });
        }
    }

    if let Some(dir) = image.data_dir(DIR_DELAY_IMPORT) {
        for i in 0..MAX_DESCRIPTORS {
            let desc = dir.rva + (i * 32) as u32;
            let attributes = image.u32_at_rva(desc)?;
            let mut name_field = image.u32_at_rva(desc + 4)?;
            let mut iat_field = image.u32_at_rva(desc + 12)?;
            let mut int_field = image.u32_at_rva(desc + 16)?;
            if name_field == 0 {
                break;
            }
            if attributes & 1 == 0 {
                // legacy descriptor shape: fields hold virtual addresses
                // instead of RVAs and must be rebased manually
                name_field = rebase_va(image, name_field as u64)?;
                iat_field = rebase_va(image, iat_field as u64)?;
                int_field = rebase_va(image, int_field as u64)?;
            }
            modules.push(ImportedModule {
                dll: image.cstr_at_rva(name_field)?,
                entries: read_thunks(image, int_field, iat_field, true)?,
            });
        }
    }

    Ok(modules)
}

fn rebase_va(image: &PeImage, va: u64) -> Result<u32, LddError> {
    va.checked_sub(image.image_base)
        .and_then(|rva| u32::try_from(rva).ok())
        .ok_or_else(|| {
            LddError::BadFormat("legacy delay descriptor points below image base".to_owned())
        })
}

/// Walk one import name table, pairing each slot with its address table value
fn read_thunks(
    image: &PeImage,
    int_rva: u32,
    iat_rva: u32,
    delayed: bool,
) -> Result<Vec<ImportEntry>, LddError> {
    let thunk_size = if image.pe32_plus { 8 } else { 4 };
    let mut entries = Vec::new();
    for i in 0..MAX_THUNKS {
        let offset = (i * thunk_size) as u32;
        let orig_thunk = read_thunk(image, int_rva + offset)?;
        if orig_thunk == 0 {
            break;
        }
        // the IAT may be absent, shorter or unmapped; the original value
        // stands in then (RVA 0 would read header bytes, not a thunk)
        let thunk = if iat_rva == 0 {
            orig_thunk
        } else {
            read_thunk(image, iat_rva + offset).unwrap_or(orig_thunk)
        };

        let by_ordinal = if image.pe32_plus {
            orig_thunk & ORDINAL_FLAG64 != 0
        } else {
            orig_thunk as u32 & ORDINAL_FLAG32 != 0
        };
        let (name, ordinal) = if by_ordinal {
            (None, Some((orig_thunk & 0xffff) as u16))
        } else {
            // hint/name entry: u16 hint followed by the symbol name
            let hint_rva = (orig_thunk as u32) & !ORDINAL_FLAG32;
            (Some(image.cstr_at_rva(hint_rva + 2)?), None)
        };
        entries.push(ImportEntry {
            orig_thunk,
            thunk,
            name,
            ordinal,
            dll: None,
            symbol: None,
            delayed,
        });
    }
    Ok(entries)
}

fn read_thunk(image: &PeImage, rva: u32) -> Result<u64, LddError> {
    if image.pe32_plus {
        image.u64_at_rva(rva)
    } else {
        Ok(image.u32_at_rva(rva)? as u64)
    }
}
