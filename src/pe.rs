//! Low-level access to the PE/COFF on-disk format
//!
//! Only the parts of the format needed for dependency walking are read: the
//! legacy stub header, the NT headers in their 32- and 64-bit optional-header
//! shapes, the data directories and the section table. Everything is read
//! straight from the file bytes; nothing is mapped or relocated.

use crate::common::LddError;
use std::path::{Path, PathBuf};

/// Data directory indices used by the dependency walker
pub const DIR_EXPORT: usize = 0;
pub const DIR_IMPORT: usize = 1;
pub const DIR_DELAY_IMPORT: usize = 13;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPT_MAGIC_PE32: u16 = 0x010b;
const OPT_MAGIC_PE32_PLUS: u16 = 0x020b;

/// One entry of the optional header's data directory
#[derive(Debug, Clone, Copy)]
pub struct DataDir {
    pub rva: u32,
    pub size: u32,
}

impl DataDir {
    /// Whether an RVA falls within this directory's address range
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && rva < self.rva.wrapping_add(self.size)
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub raw_size: u32,
}

impl Section {
    fn span(&self) -> u32 {
        self.virtual_size.max(self.raw_size)
    }
}

/// A validated PE image, read into memory
pub struct PeImage {
    path: PathBuf,
    bytes: Vec<u8>,
    pub machine: u16,
    pub pe32_plus: bool,
    pub image_base: u64,
    data_dirs: Vec<DataDir>,
    pub sections: Vec<Section>,
}

impl PeImage {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self, LddError> {
        let bytes = fs_err::read(path.as_ref())?;
        Self::from_bytes(path.as_ref().to_path_buf(), bytes)
    }

    pub fn from_bytes(path: PathBuf, bytes: Vec<u8>) -> Result<Self, LddError> {
        let mut image = Self {
            path,
            bytes,
            machine: 0,
            pe32_plus: false,
            image_base: 0,
            data_dirs: Vec::new(),
            sections: Vec::new(),
        };
        image.read_headers()?;
        Ok(image)
    }

    fn bad(&self, what: &str) -> LddError {
        LddError::BadFormat(format!("{}: {}", self.path.display(), what))
    }

    fn read_headers(&mut self) -> Result<(), LddError> {
        if self.u16_at(0)? != DOS_MAGIC {
            return Err(self.bad("missing MZ stub header"));
        }
        let nt_offset = self.u32_at(0x3c)? as usize;
        if self.u32_at(nt_offset)? != PE_SIGNATURE {
            return Err(self.bad("missing PE signature"));
        }

        // COFF file header
        let coff = nt_offset + 4;
        self.machine = self.u16_at(coff)?;
        let section_count = self.u16_at(coff + 2)? as usize;
        let opt_size = self.u16_at(coff + 16)? as usize;

        // optional header, in one of its two shapes
        let opt = coff + 20;
        let (dirs_offset, count_offset) = match self.u16_at(opt)? {
            OPT_MAGIC_PE32 => {
                self.pe32_plus = false;
                self.image_base = self.u32_at(opt + 28)? as u64;
                (opt + 96, opt + 92)
            }
            OPT_MAGIC_PE32_PLUS => {
                self.pe32_plus = true;
                self.image_base = self.u64_at(opt + 24)?;
                (opt + 112, opt + 108)
            }
            _ => return Err(self.bad("unknown optional header magic")),
        };

        let dir_count = (self.u32_at(count_offset)? as usize).min(16);
        for i in 0..dir_count {
            self.data_dirs.push(DataDir {
                rva: self.u32_at(dirs_offset + i * 8)?,
                size: self.u32_at(dirs_offset + i * 8 + 4)?,
            });
        }

        let mut header = opt + opt_size;
        for _ in 0..section_count {
            let name_bytes = self.slice_at(header, 8)?;
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_owned();
            self.sections.push(Section {
                name,
                virtual_size: self.u32_at(header + 8)?,
                virtual_address: self.u32_at(header + 12)?,
                raw_size: self.u32_at(header + 16)?,
                raw_offset: self.u32_at(header + 20)?,
            });
            header += 40;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory entry at the given index, if present and non-empty
    pub fn data_dir(&self, index: usize) -> Option<DataDir> {
        self.data_dirs
            .get(index)
            .copied()
            .filter(|d| d.rva != 0 && d.size != 0)
    }

    /// Index of the section containing the RVA
    pub fn section_of_rva(&self, rva: u32) -> Option<usize> {
        self.sections.iter().position(|s| {
            rva >= s.virtual_address && (rva - s.virtual_address) < s.span()
        })
    }

    /// Translate an RVA to a file offset through the section table
    ///
    /// RVAs below the first section fall in the header region, which is mapped
    /// one-to-one from the start of the file.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if let Some(i) = self.section_of_rva(rva) {
            let s = &self.sections[i];
            let offset = s.raw_offset as usize + (rva - s.virtual_address) as usize;
            return (offset < self.bytes.len()).then_some(offset);
        }
        let first = self.sections.iter().map(|s| s.virtual_address).min()?;
        (rva < first && (rva as usize) < self.bytes.len()).then_some(rva as usize)
    }

    fn slice_at(&self, offset: usize, len: usize) -> Result<&[u8], LddError> {
        self.bytes
            .get(offset..offset + len)
            .ok_or_else(|| self.bad("read past end of file"))
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16, LddError> {
        Ok(u16::from_le_bytes(self.slice_at(offset, 2)?.try_into().unwrap()))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32, LddError> {
        Ok(u32::from_le_bytes(self.slice_at(offset, 4)?.try_into().unwrap()))
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64, LddError> {
        Ok(u64::from_le_bytes(self.slice_at(offset, 8)?.try_into().unwrap()))
    }

    pub fn u16_at_rva(&self, rva: u32) -> Result<u16, LddError> {
        let offset = self
            .rva_to_offset(rva)
            .ok_or_else(|| self.bad("RVA outside any section"))?;
        self.u16_at(offset)
    }

    pub fn u32_at_rva(&self, rva: u32) -> Result<u32, LddError> {
        let offset = self
            .rva_to_offset(rva)
            .ok_or_else(|| self.bad("RVA outside any section"))?;
        self.u32_at(offset)
    }

    pub fn u64_at_rva(&self, rva: u32) -> Result<u64, LddError> {
        let offset = self
            .rva_to_offset(rva)
            .ok_or_else(|| self.bad("RVA outside any section"))?;
        self.u64_at(offset)
    }

    /// NUL-terminated string at the given RVA
    pub fn cstr_at_rva(&self, rva: u32) -> Result<String, LddError> {
        let start = self
            .rva_to_offset(rva)
            .ok_or_else(|| self.bad("string RVA outside any section"))?;
        let rest = &self.bytes[start..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.bad("unterminated string"))?;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}
