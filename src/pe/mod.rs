//! Low-level PE file format access
//!
//! Everything in here works on borrowed file bytes and reports structural
//! problems as [`PeError`] values; nothing in this module touches the
//! dependency graph.

pub mod error;
pub mod exports;
pub mod header;
pub mod imports;
pub mod locate;
pub mod raw;

#[cfg(test)]
pub(crate) mod testing;

use fs_err as fs;
use serde::Serialize;
use std::path::Path;

pub use error::PeError;
pub use exports::{read_exports, Export, ExportName, ExportTable, ExportTarget};
pub use header::{DataDirectory, PeImage, SectionHeader};
pub use imports::{read_imports, ImportTable, ImportedDll, ImportedSymbol};
pub use locate::find_object;

/// Immutable bytes of an analysed file
///
/// Files are memory-mapped; empty files, which cannot be mapped, and
/// in-memory buffers are held as owned bytes.
pub enum ByteRegion {
    /// A mapping may extend past the end of the file up to a page boundary;
    /// only the first `len` bytes belong to the file.
    Mapped { map: pelite::FileMap, len: usize },
    Owned(Vec<u8>),
}

impl ByteRegion {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let len = fs::metadata(path.as_ref())?.len();
        if len == 0 {
            return Ok(Self::Owned(Vec::new()));
        }
        let len = usize::try_from(len)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "file too large"))?;
        let map = pelite::FileMap::open(path.as_ref())?;
        Ok(Self::Mapped { map, len })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped { map, len } => {
                let mapped = map.as_ref();
                &mapped[..(*len).min(mapped.len())]
            }
            Self::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ByteRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Mapped { .. } => "Mapped",
            Self::Owned(_) => "Owned",
        };
        f.debug_struct("ByteRegion")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Outcome of a best-effort parse step: the value, if any could be salvaged,
/// and every failure met on the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed<T> {
    pub value: Option<T>,
    pub errors: Vec<PeError>,
}

impl<T> Parsed<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            errors: Vec::new(),
        }
    }

    pub fn failed(error: PeError) -> Self {
        Self {
            value: None,
            errors: vec![error],
        }
    }
}

/// Human-readable report of a parse failure, attached to the module it occurred in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub module: String,
    /// RVA the failure refers to, when known
    pub offset: Option<u64>,
    pub reason: String,
}

impl Diagnostic {
    pub fn from_pe_error(module: &str, error: &PeError) -> Self {
        Self {
            module: module.to_owned(),
            offset: error.rva().map(u64::from),
            reason: error.to_string(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{} @ {:#x}: {}", self.module, offset, self.reason),
            None => write!(f, "{}: {}", self.module, self.reason),
        }
    }
}

/// Get a humanly-readable version of a decorated MSVC symbol
pub fn demangle_symbol(symbol: &str) -> Option<String> {
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags).ok()
}
