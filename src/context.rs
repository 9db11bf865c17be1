//! Per-run configuration and shared state of one dependency scan

use crate::graph::UnresolvedCause;
use crate::lookup_path::SearchPaths;
use std::path::{Path, PathBuf};

/// Everything one invocation of the tree builder carries along
#[derive(Debug, Default)]
pub struct BuildContext {
    /// Accepted for command-line compatibility; intentionally unimplemented
    pub data_relocs: bool,
    /// Accepted for command-line compatibility; intentionally unimplemented
    pub function_relocs: bool,
    /// Controls only whether the print pass re-expands visited nodes;
    /// dependency parsing is always fully recursive
    pub recursive: bool,

    /// Machine type of the run, locked by the first successfully parsed image
    pub machine: Option<u16>,
    /// Address width of the run, locked together with the machine type
    pub pe32_plus: Option<bool>,

    /// Resolved paths currently being descended into, for cycle detection
    pub in_progress: Vec<PathBuf>,

    pub search_paths: SearchPaths,
}

impl BuildContext {
    pub fn new(search_paths: SearchPaths) -> Self {
        Self {
            search_paths,
            ..Self::default()
        }
    }

    /// Validate an image's architecture against the run's locked one
    ///
    /// The first image establishes the target architecture; any later image
    /// must match both machine type and optional-header width.
    pub fn check_arch(&mut self, machine: u16, pe32_plus: bool) -> Result<(), UnresolvedCause> {
        match (self.machine, self.pe32_plus) {
            (None, _) | (_, None) => {
                self.machine = Some(machine);
                self.pe32_plus = Some(pe32_plus);
                Ok(())
            }
            (Some(expected), Some(expected_wide)) => {
                if expected == machine && expected_wide == pe32_plus {
                    Ok(())
                } else {
                    Err(UnresolvedCause::ArchMismatch {
                        expected,
                        found: machine,
                    })
                }
            }
        }
    }

    /// Whether lookups should use the 32-bit system directory
    pub fn wants_wow64(&self) -> bool {
        self.pe32_plus == Some(false)
    }

    pub fn descending_into(&self, path: &Path) -> bool {
        self.in_progress.iter().any(|p| p == path)
    }
}
