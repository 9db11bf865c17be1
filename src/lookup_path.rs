//! Module lookup along the Windows standard search order
//!
//! A bare module name is probed, in order, against: the directory of the
//! importing file, the user-supplied search directories in the order they
//! were given, the system directory (the WOW64 one when resolving for a
//! 32-bit image on a 64-bit host), the Windows directory, the working
//! directory and the `PATH` entries. User directories come before the system
//! fallbacks so a scan can be pointed at the DLLs actually shipped next to
//! the binary.

use crate::common::LddError;
use crate::system;
use std::path::{Path, PathBuf};

/// Ordered set of directories consulted when resolving a bare module name
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    system_dir: Option<PathBuf>,
    wow64_dir: Option<PathBuf>,
    windows_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    path_dirs: Vec<PathBuf>,
    /// `-D` entries and per-file directories, in the order given
    user_dirs: Vec<PathBuf>,
}

impl SearchPaths {
    /// Deduce the fixed part of the search order from the host
    pub fn from_environment() -> Self {
        let path_dirs = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).filter(|d| d.is_dir()).collect())
            .unwrap_or_default();
        Self {
            system_dir: system::system_directory(),
            wow64_dir: system::wow64_directory(),
            windows_dir: system::windows_directory(),
            working_dir: std::env::current_dir().ok(),
            path_dirs,
            user_dirs: Vec::new(),
        }
    }

    pub fn add_user_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        self.user_dirs.push(dir.into());
    }

    /// Parse one `-D` argument: semicolon-separated, optionally quoted
    pub fn add_search_dir_arg(&mut self, arg: &str) {
        let trimmed = arg.trim_matches('"');
        for dir in trimmed.split(';').filter(|s| !s.is_empty()) {
            self.add_user_dir(dir);
        }
    }

    pub fn user_dirs(&self) -> &[PathBuf] {
        &self.user_dirs
    }

    /// Find the file for a module name; `wow64` selects the 32-bit system
    /// directory where the host has one
    pub fn resolve(
        &self,
        module: &str,
        importer_dir: Option<&Path>,
        wow64: bool,
    ) -> Result<PathBuf, LddError> {
        let system_dir = if wow64 && self.wow64_dir.is_some() {
            self.wow64_dir.as_deref()
        } else {
            self.system_dir.as_deref()
        };
        let candidates = importer_dir
            .into_iter()
            .chain(self.user_dirs.iter().map(PathBuf::as_path))
            .chain(system_dir)
            .chain(self.windows_dir.as_deref())
            .chain(self.working_dir.as_deref())
            .chain(self.path_dirs.iter().map(PathBuf::as_path));
        for dir in candidates {
            if let Some(found) = probe(dir, module) {
                return Ok(found);
            }
        }
        Err(LddError::NotFound(module.to_owned()))
    }
}

/// Check for the module in one directory
///
/// The exact name is tried first; a case-insensitive directory scan covers
/// hosts with case-sensitive filesystems, where import table casing rarely
/// matches the file on disk.
fn probe(dir: &Path, module: &str) -> Option<PathBuf> {
    let exact = dir.join(module);
    if exact.is_file() {
        return Some(exact);
    }
    let lower = module.to_lowercase();
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.metadata().map(|m| m.is_file()).unwrap_or(false))
        .find(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.to_lowercase() == lower)
                .unwrap_or(false)
        })
        .map(|e| e.path())
}
