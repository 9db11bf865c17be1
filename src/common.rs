use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LddError {
    #[error("not a valid PE image: {0}")]
    BadFormat(String),

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("dependency scan error: {0}")]
    ScanError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Get a string representation of the path, or an error message placeholder
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_str().unwrap_or("<invalid path>").to_owned()
}

/// Strip the verbatim prefix (\\?\C:\...) that canonicalization adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.replacen(r"\\?\", "", 1)
}

/// Canonical path, made printable again
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LddError> {
    Ok(decanonicalize(
        fs_err::canonicalize(p.as_ref())?
            .to_str()
            .ok_or_else(|| LddError::ScanError(format!("invalid path {:?}", p.as_ref())))?,
    ))
}
