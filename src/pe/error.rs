/// Structural failures found while decoding a PE file
///
/// Every variant is local to the table or entry being decoded; the caller
/// decides how far the failure propagates.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PeError {
    /// The file is shorter than the structure being read.
    #[error("File too short: {needed} bytes needed, {actual} available")]
    FileTooShort { needed: usize, actual: usize },

    /// Missing MZ signature.
    #[error("Invalid DOS magic")]
    InvalidDosMagic,

    /// The new header offset points outside the file.
    #[error("New header offset {offset:#x} points outside the file")]
    InvalidNewHeaderOffset { offset: usize },

    /// Missing PE signature.
    #[error("Invalid PE magic {found:#010x}")]
    InvalidPeMagic { found: u32 },

    /// Neither PE32 nor PE32+.
    #[error("Invalid PE optional header magic {found:#06x}")]
    InvalidOptionalHeaderMagic { found: u16 },

    /// The declared optional header size cannot hold its fixed fields.
    #[error("Invalid PE optional header size {size}")]
    InvalidOptionalHeaderSize { size: u16 },

    /// The data directory count does not fit the declared optional header.
    #[error("Invalid PE number of RVA and sizes: {count}")]
    InvalidDataDirectoryCount { count: u32 },

    /// The section table does not fit in the file.
    #[error("Section table of {count} entries does not fit in the file")]
    InvalidSectionTable { count: u16 },

    /// No section contains the address.
    #[error("RVA {rva:#x} not found in any section")]
    ObjectNotFound { rva: u32 },

    /// The object starts inside a section but runs past its raw data.
    #[error("Object at RVA {rva:#x} of {size} bytes does not fit in the section raw data")]
    ObjectOutOfBounds { rva: u32, size: u32 },

    /// An RVA expected in the same section as its owning table lies elsewhere.
    #[error("RVA {rva:#x} is not in the same section as its table")]
    NotInSection { rva: u32 },

    /// A sentinel-terminated table ran into its cap without a terminator.
    #[error("Could not find the end of the {what}")]
    MissingSentinel { what: &'static str },

    /// Unterminated, empty or non-ASCII string.
    #[error("Invalid string at RVA {rva:#x}: {reason}")]
    InvalidString { rva: u32, reason: &'static str },

    /// Lookup entry with reserved bits set.
    #[error("Invalid import lookup entry {value:#x}")]
    InvalidLookupEntry { value: u64 },

    /// Malformed export directory.
    #[error("Invalid export table: {0}")]
    InvalidExportTable(String),
}

impl PeError {
    /// The address the failure refers to, when there is one
    pub fn rva(&self) -> Option<u32> {
        match self {
            Self::ObjectNotFound { rva }
            | Self::ObjectOutOfBounds { rva, .. }
            | Self::NotInSection { rva }
            | Self::InvalidString { rva, .. } => Some(*rva),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeError>;
