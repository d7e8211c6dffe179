use thiserror::Error;

use crate::pe::PeError;
use fs_err as fs;
use std::path::Path;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("PE file parse error: {0}")]
    PEError(#[from] PeError),

    #[error("Could not scan: {0}")]
    ScanError(String),

    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Manifest parse error: {0}")]
    XmlError(#[from] roxmltree::Error),

    #[error("Invalid known DLL list: {0}")]
    InvalidKnownDllList(String),
}

/// Lossy conversion of a path to a String
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

/// Remove the verbatim prefix Windows adds to canonicalized paths
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

/// Canonicalize a path and render it the way a user would type it
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    let canonical = fs::canonicalize(p.as_ref())?;
    Ok(decanonicalize(&path_to_string(canonical)))
}
