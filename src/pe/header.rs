//! Validation and decoding of the DOS, COFF and optional headers

use serde::Serialize;

use crate::pe::error::{PeError, Result};
use crate::pe::raw::{self, CoffHeader, RawDataDirectory, RawSectionHeader};

/// Location and size of one of the tables listed in the optional header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_empty(&self) -> bool {
        self.virtual_address == 0 || self.size == 0
    }

    /// Whether the RVA lies within the directory
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && (rva as u64) < self.virtual_address as u64 + self.size as u64
    }
}

impl From<RawDataDirectory> for DataDirectory {
    fn from(raw: RawDataDirectory) -> Self {
        Self {
            virtual_address: raw.virtual_address,
            size: raw.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_ptr: u32,
    /// Clamped so that `raw_ptr + raw_size` never exceeds the file size
    pub raw_size: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// One past the last raw byte of the section
    pub fn raw_end(&self) -> usize {
        self.raw_ptr as usize + self.raw_size as usize
    }
}

/// Decoded headers of a PE file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeImage {
    pub is_64bit: bool,
    pub machine: u16,
    pub characteristics: u16,
    pub timestamp: u32,
    pub image_base: u64,
    pub subsystem: u16,
    pub data_directories: Vec<DataDirectory>,
    pub sections: Vec<SectionHeader>,
}

const IMAGE_FILE_DLL: u16 = 0x2000;

impl PeImage {
    /// Validate the signatures and decode the headers of a PE file
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let file_size = bytes.len();
        if file_size < raw::MZ_MAGIC.len() {
            return Err(PeError::FileTooShort {
                needed: raw::MZ_MAGIC.len(),
                actual: file_size,
            });
        }
        if bytes[..2] != raw::MZ_MAGIC {
            return Err(PeError::InvalidDosMagic);
        }
        if file_size < raw::DOS_HEADER_SIZE {
            return Err(PeError::FileTooShort {
                needed: raw::DOS_HEADER_SIZE,
                actual: file_size,
            });
        }

        let pe_offset = raw::read::<u16>(bytes, raw::NEW_HEADER_OFFSET_FIELD)
            .ok_or(PeError::InvalidDosMagic)? as usize;
        let signature = raw::read::<u32>(bytes, pe_offset)
            .ok_or(PeError::InvalidNewHeaderOffset { offset: pe_offset })?;
        if signature != raw::PE_MAGIC {
            return Err(PeError::InvalidPeMagic { found: signature });
        }

        let coff_offset = pe_offset + raw::PE_SIGNATURE_SIZE;
        let coff: CoffHeader = raw::read(bytes, coff_offset).ok_or(PeError::FileTooShort {
            needed: coff_offset + std::mem::size_of::<CoffHeader>(),
            actual: file_size,
        })?;

        let optional_offset = coff_offset + std::mem::size_of::<CoffHeader>();
        let magic = raw::read::<u16>(bytes, optional_offset).ok_or(PeError::FileTooShort {
            needed: optional_offset + 2,
            actual: file_size,
        })?;
        let (is_64bit, fixed_size) = match magic {
            raw::OPTIONAL_MAGIC_PE32 => (false, raw::OPTIONAL_FIXED_SIZE_PE32),
            raw::OPTIONAL_MAGIC_PE32_PLUS => (true, raw::OPTIONAL_FIXED_SIZE_PE32_PLUS),
            found => return Err(PeError::InvalidOptionalHeaderMagic { found }),
        };
        let declared_size = coff.size_of_optional_header as usize;
        if declared_size < fixed_size {
            return Err(PeError::InvalidOptionalHeaderSize {
                size: coff.size_of_optional_header,
            });
        }
        if optional_offset + declared_size > file_size {
            return Err(PeError::FileTooShort {
                needed: optional_offset + declared_size,
                actual: file_size,
            });
        }

        let short = || PeError::FileTooShort {
            needed: optional_offset + fixed_size,
            actual: file_size,
        };
        let image_base = if is_64bit {
            raw::read::<u64>(bytes, optional_offset + 24).ok_or_else(short)?
        } else {
            raw::read::<u32>(bytes, optional_offset + 28).ok_or_else(short)? as u64
        };
        let subsystem = raw::read::<u16>(bytes, optional_offset + 68).ok_or_else(short)?;

        // NumberOfRvaAndSizes is the last fixed field in both layouts
        let count = raw::read::<u32>(bytes, optional_offset + fixed_size - 4).ok_or_else(short)?;
        let room = (declared_size - fixed_size) / std::mem::size_of::<RawDataDirectory>();
        if count as usize > room {
            return Err(PeError::InvalidDataDirectoryCount { count });
        }
        let directories_offset = optional_offset + fixed_size;
        let data_directories = (0..count as usize)
            .map(|i| {
                raw::read::<RawDataDirectory>(
                    bytes,
                    directories_offset + i * std::mem::size_of::<RawDataDirectory>(),
                )
                .map(DataDirectory::from)
                .ok_or(PeError::InvalidDataDirectoryCount { count })
            })
            .collect::<Result<Vec<_>>>()?;

        let sections_offset = optional_offset + declared_size;
        let sections = (0..coff.number_of_sections as usize)
            .map(|i| {
                raw::read::<RawSectionHeader>(
                    bytes,
                    sections_offset + i * std::mem::size_of::<RawSectionHeader>(),
                )
                .map(|s| section_from_raw(&s, file_size))
                .ok_or(PeError::InvalidSectionTable {
                    count: coff.number_of_sections,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            is_64bit,
            machine: coff.machine,
            characteristics: coff.characteristics,
            timestamp: coff.time_date_stamp,
            image_base,
            subsystem,
            data_directories,
            sections,
        })
    }

    /// The data directory at the given index, if declared and non-empty
    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        self.data_directories
            .get(index)
            .copied()
            .filter(|d| !d.is_empty())
    }

    pub fn is_dll(&self) -> bool {
        self.characteristics & IMAGE_FILE_DLL != 0
    }

    /// Size in bytes of the entries of the import lookup tables
    pub fn lookup_entry_size(&self) -> usize {
        if self.is_64bit {
            8
        } else {
            4
        }
    }
}

fn section_from_raw(raw: &RawSectionHeader, file_size: usize) -> SectionHeader {
    let name_len = raw.name.iter().position(|&b| b == 0).unwrap_or(raw.name.len());
    let name = String::from_utf8_lossy(&raw.name[..name_len]).into_owned();

    let raw_ptr = raw.pointer_to_raw_data as usize;
    let available = file_size.saturating_sub(raw_ptr);
    let raw_size = (raw.size_of_raw_data as usize).min(available);
    if raw_size != raw.size_of_raw_data as usize {
        tracing::warn!(
            section = %name,
            declared = raw.size_of_raw_data,
            available = raw_size,
            "section raw data runs past the end of the file, truncating"
        );
    }

    SectionHeader {
        name,
        virtual_address: raw.virtual_address,
        virtual_size: raw.virtual_size,
        raw_ptr: raw
            .pointer_to_raw_data
            .min(u32::try_from(file_size).unwrap_or(u32::MAX)),
        raw_size: raw_size as u32,
        characteristics: raw.characteristics,
    }
}
