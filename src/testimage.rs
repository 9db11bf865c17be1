//! Builders for tiny synthetic PE32/PE32+ images, used by the tests
//!
//! The generated files carry one section at RVA 0x1000 holding whatever
//! export/import/delay-import directories the test asked for. They are valid
//! enough for the parser and the tree builder, not for the Windows loader.

use std::path::{Path, PathBuf};

use crate::pe::{IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};

const PE_OFFSET: usize = 0x80;
const HEADER_SIZE: usize = 0x400;
const SECTION_RVA: u32 = 0x1000;
// free slot inside the section but outside any directory range
const CODE_RVA_BASE: u32 = SECTION_RVA + 0xe00;

enum Thunk {
    ByName(String),
    ByOrdinal(u16),
}

struct ImportGroup {
    dll: String,
    thunks: Vec<Thunk>,
    delayed: bool,
}

pub struct TestImage {
    machine: u16,
    pe32_plus: bool,
    image_base: u64,
    ordinal_base: u32,
    legacy_delay: bool,
    omit_iat: bool,
    exports: Vec<(Option<String>, Option<String>)>,
    imports: Vec<ImportGroup>,
}

impl TestImage {
    pub fn new32() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_I386,
            pe32_plus: false,
            image_base: 0x0040_0000,
            ordinal_base: 1,
            legacy_delay: false,
            omit_iat: false,
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn new64() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_AMD64,
            pe32_plus: true,
            image_base: 0x1_8000_0000,
            ..Self::new32()
        }
    }

    pub fn ordinal_base(mut self, base: u32) -> Self {
        self.ordinal_base = base;
        self
    }

    /// Add a named export; a forward target makes it a forwarder
    pub fn export(mut self, name: &str, forward: Option<&str>) -> Self {
        self.exports
            .push((Some(name.to_owned()), forward.map(str::to_owned)));
        self
    }

    /// Add an export reachable only through its ordinal
    pub fn export_unnamed(mut self) -> Self {
        self.exports.push((None, None));
        self
    }

    pub fn import(mut self, dll: &str, names: &[&str]) -> Self {
        self.imports.push(ImportGroup {
            dll: dll.to_owned(),
            thunks: names.iter().map(|n| Thunk::ByName((*n).to_owned())).collect(),
            delayed: false,
        });
        self
    }

    pub fn import_ordinal(mut self, dll: &str, ordinal: u16) -> Self {
        self.imports.push(ImportGroup {
            dll: dll.to_owned(),
            thunks: vec![Thunk::ByOrdinal(ordinal)],
            delayed: false,
        });
        self
    }

    pub fn delay_import(mut self, dll: &str, names: &[&str]) -> Self {
        self.imports.push(ImportGroup {
            dll: dll.to_owned(),
            thunks: names.iter().map(|n| Thunk::ByName((*n).to_owned())).collect(),
            delayed: true,
        });
        self
    }

    /// Emit delay descriptors in the legacy, VA-based shape
    pub fn legacy_delay(mut self) -> Self {
        self.legacy_delay = true;
        self
    }

    /// Write ordinary import descriptors without an address table
    pub fn omit_iat(mut self) -> Self {
        self.omit_iat = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut sec = Section::new();
        sec.pad(16);

        let export_dir = self.build_exports(&mut sec);
        let (import_dir, delay_dir) = self.build_imports(&mut sec);

        let mut out = vec![0u8; HEADER_SIZE];
        out[0] = b'M';
        out[1] = b'Z';
        put_u32(&mut out, 0x3c, PE_OFFSET as u32);
        out[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        // COFF file header
        let coff = PE_OFFSET + 4;
        let opt_size: u16 = if self.pe32_plus { 240 } else { 224 };
        put_u16(&mut out, coff, self.machine);
        put_u16(&mut out, coff + 2, 1); // one section
        put_u16(&mut out, coff + 16, opt_size);
        put_u16(&mut out, coff + 18, 0x2102);

        // optional header
        let opt = coff + 20;
        let dirs = if self.pe32_plus {
            put_u16(&mut out, opt, 0x020b);
            put_u64(&mut out, opt + 24, self.image_base);
            put_u32(&mut out, opt + 108, 16);
            opt + 112
        } else {
            put_u16(&mut out, opt, 0x010b);
            put_u32(&mut out, opt + 28, self.image_base as u32);
            put_u32(&mut out, opt + 92, 16);
            opt + 96
        };
        put_u32(&mut out, opt + 32, 0x1000); // section alignment
        put_u32(&mut out, opt + 36, 0x200); // file alignment
        put_u32(&mut out, opt + 56, 0x10000); // size of image
        put_u32(&mut out, opt + 60, HEADER_SIZE as u32); // size of headers
        put_u16(&mut out, opt + 68, 3); // console subsystem

        for (index, dir) in [
            (0usize, export_dir),
            (1, import_dir),
            (13, delay_dir),
        ] {
            if let Some((rva, size)) = dir {
                put_u32(&mut out, dirs + index * 8, rva);
                put_u32(&mut out, dirs + index * 8 + 4, size);
            }
        }

        // section header
        let header = opt + opt_size as usize;
        out[header..header + 6].copy_from_slice(b".rdata");
        put_u32(&mut out, header + 8, 0x1000); // virtual size
        put_u32(&mut out, header + 12, SECTION_RVA);
        put_u32(&mut out, header + 16, sec.data.len() as u32);
        put_u32(&mut out, header + 20, HEADER_SIZE as u32);

        out.extend_from_slice(&sec.data);
        out
    }

    pub fn write(&self, dir: &Path, filename: &str) -> PathBuf {
        fs_err::create_dir_all(dir).unwrap();
        let path = dir.join(filename);
        fs_err::write(&path, self.build()).unwrap();
        path
    }

    fn build_exports(&self, sec: &mut Section) -> Option<(u32, u32)> {
        if self.exports.is_empty() {
            return None;
        }
        let count = self.exports.len();
        let start = sec.reserve(40); // IMAGE_EXPORT_DIRECTORY
        let functions = sec.reserve(count * 4);
        let named: Vec<(usize, &str)> = self
            .exports
            .iter()
            .enumerate()
            .filter_map(|(i, (n, _))| n.as_deref().map(|n| (i, n)))
            .collect();
        let names = sec.reserve(named.len() * 4);
        let ordinals = sec.reserve(named.len() * 2);
        let module_name = sec.cstr("TESTMOD.dll");

        for (i, (_, forward)) in self.exports.iter().enumerate() {
            let target = match forward {
                Some(f) => sec.cstr(f), // inside the directory range
                None => CODE_RVA_BASE + (i as u32) * 4,
            };
            sec.put_u32(functions + (i * 4) as u32 - SECTION_RVA, target);
        }
        for (j, (slot, name)) in named.iter().enumerate() {
            let name_rva = sec.cstr(name);
            sec.put_u32(names + (j * 4) as u32 - SECTION_RVA, name_rva);
            sec.put_u16(ordinals + (j * 2) as u32 - SECTION_RVA, *slot as u16);
        }

        let dir_off = start - SECTION_RVA;
        sec.put_u32(dir_off + 12, module_name);
        sec.put_u32(dir_off + 16, self.ordinal_base);
        sec.put_u32(dir_off + 20, count as u32);
        sec.put_u32(dir_off + 24, named.len() as u32);
        sec.put_u32(dir_off + 28, functions);
        sec.put_u32(dir_off + 32, names);
        sec.put_u32(dir_off + 36, ordinals);

        let size = sec.rva() - start;
        Some((start, size))
    }

    fn build_imports(&self, sec: &mut Section) -> (Option<(u32, u32)>, Option<(u32, u32)>) {
        // per group: (dll name rva, INT rva, IAT rva)
        let mut placed: Vec<(u32, u32, u32)> = Vec::new();
        for group in &self.imports {
            let dll = sec.cstr(&group.dll);
            let values: Vec<u64> = group
                .thunks
                .iter()
                .map(|t| match t {
                    Thunk::ByName(name) => {
                        sec.align(2);
                        let entry = sec.rva();
                        sec.raw_u16(0); // hint
                        sec.raw_cstr(name);
                        entry as u64
                    }
                    Thunk::ByOrdinal(ordinal) => {
                        if self.pe32_plus {
                            (1u64 << 63) | *ordinal as u64
                        } else {
                            0x8000_0000u64 | *ordinal as u64
                        }
                    }
                })
                .collect();
            let int = sec.thunk_table(&values, self.pe32_plus);
            let iat = sec.thunk_table(&values, self.pe32_plus);
            placed.push((dll, int, iat));
        }

        let ordinary: Vec<usize> = (0..self.imports.len())
            .filter(|&i| !self.imports[i].delayed)
            .collect();
        let delayed: Vec<usize> = (0..self.imports.len())
            .filter(|&i| self.imports[i].delayed)
            .collect();

        let import_dir = (!ordinary.is_empty()).then(|| {
            sec.align(4);
            let start = sec.rva();
            for &i in &ordinary {
                let (dll, int, iat) = placed[i];
                sec.raw_u32(int);
                sec.raw_u32(0);
                sec.raw_u32(0);
                sec.raw_u32(dll);
                sec.raw_u32(if self.omit_iat { 0 } else { iat });
            }
            sec.pad(20); // terminator
            (start, ((ordinary.len() + 1) * 20) as u32)
        });

        let delay_dir = (!delayed.is_empty()).then(|| {
            sec.align(4);
            let start = sec.rva();
            for &i in &delayed {
                let (dll, int, iat) = placed[i];
                let rebase = |rva: u32| -> u32 {
                    if self.legacy_delay {
                        (self.image_base + rva as u64) as u32
                    } else {
                        rva
                    }
                };
                sec.raw_u32(if self.legacy_delay { 0 } else { 1 }); // attributes
                sec.raw_u32(rebase(dll));
                sec.raw_u32(0); // module handle
                sec.raw_u32(rebase(iat));
                sec.raw_u32(rebase(int));
                sec.raw_u32(0);
                sec.raw_u32(0);
                sec.raw_u32(0);
            }
            sec.pad(32); // terminator
            (start, ((delayed.len() + 1) * 32) as u32)
        });

        (import_dir, delay_dir)
    }
}

/// Growing buffer for the single section, addressed by RVA
struct Section {
    data: Vec<u8>,
}

impl Section {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    fn rva(&self) -> u32 {
        SECTION_RVA + self.data.len() as u32
    }

    fn pad(&mut self, n: usize) {
        self.data.resize(self.data.len() + n, 0);
    }

    fn align(&mut self, to: usize) {
        while self.data.len() % to != 0 {
            self.data.push(0);
        }
    }

    /// Reserve zeroed space, returning its RVA
    fn reserve(&mut self, n: usize) -> u32 {
        self.align(4);
        let rva = self.rva();
        self.pad(n);
        rva
    }

    /// Append a NUL-terminated string, returning its RVA
    fn cstr(&mut self, s: &str) -> u32 {
        let rva = self.rva();
        self.raw_cstr(s);
        rva
    }

    fn raw_cstr(&mut self, s: &str) {
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
    }

    fn raw_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn raw_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn raw_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u16(&mut self, offset: u32, v: u16) {
        let o = offset as usize;
        self.data[o..o + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, offset: u32, v: u32) {
        let o = offset as usize;
        self.data[o..o + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// NUL-terminated thunk table, returning its RVA
    fn thunk_table(&mut self, values: &[u64], wide: bool) -> u32 {
        self.align(if wide { 8 } else { 4 });
        let rva = self.rva();
        for &v in values {
            if wide {
                self.raw_u64(v);
            } else {
                self.raw_u32(v as u32);
            }
        }
        if wide {
            self.raw_u64(0);
        } else {
            self.raw_u32(0);
        }
        rva
    }
}

fn put_u16(out: &mut [u8], offset: usize, v: u16) {
    out[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut [u8], offset: usize, v: u32) {
    out[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut [u8], offset: usize, v: u64) {
    out[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

/// Fresh per-test directory under the system temp dir
pub fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("winldd-test-{}-{}", std::process::id(), test));
    let _ = std::fs::remove_dir_all(&dir);
    fs_err::create_dir_all(&dir).unwrap();
    dir
}
