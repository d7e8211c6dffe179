//! On-disk records of the PE/COFF format
//!
//! All records are plain-old-data read through `dataview`, which performs the
//! bounds check; a short read yields `None` instead of touching memory past the
//! end of the file. Fields are little-endian, as on every host Windows runs on.

use dataview::{DataView, Pod};

pub const MZ_MAGIC: [u8; 2] = *b"MZ";
pub const DOS_HEADER_SIZE: usize = 64;
pub const NEW_HEADER_OFFSET_FIELD: usize = 60;
pub const PE_MAGIC: u32 = 0x0000_4550;
pub const PE_SIGNATURE_SIZE: usize = 4;

pub const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;

/// Size of the optional header before the data directories
pub const OPTIONAL_FIXED_SIZE_PE32: usize = 96;
pub const OPTIONAL_FIXED_SIZE_PE32_PLUS: usize = 112;

pub const DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const DIRECTORY_ENTRY_DELAY_IMPORT: usize = 13;

/// Bit 0 of the delay-load attributes: the descriptor holds RVAs rather than VAs
pub const DELAY_ATTRIBUTE_RVA_BASED: u32 = 1;

pub const IMPORT_ORDINAL_FLAG_32: u32 = 0x8000_0000;
pub const IMPORT_ORDINAL_FLAG_64: u64 = 0x8000_0000_0000_0000;

pub const MAX_DLL_NAME_LEN: usize = 256;
pub const MAX_SYMBOL_NAME_LEN: usize = 32 * 1024;
pub const MAX_LOOKUP_ENTRIES: usize = 64 * 1024;
pub const MAX_EXPORT_ENTRIES: u32 = 64 * 1024;

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod)]
#[repr(C)]
pub struct RawDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub struct RawSectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

/// One entry of the import directory table
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, serde::Serialize)]
#[repr(C)]
pub struct ImportDirectoryEntry {
    pub lookup_table_rva: u32,
    pub timestamp: u32,
    pub forwarder_chain: u32,
    pub name_rva: u32,
    pub address_table_rva: u32,
}

impl ImportDirectoryEntry {
    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }
}

/// One entry of the delay-load import directory table
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, serde::Serialize)]
#[repr(C)]
pub struct DelayLoadDirectoryEntry {
    pub attributes: u32,
    pub name: u32,
    pub module_handle: u32,
    pub address_table: u32,
    pub name_table: u32,
    pub bound_address_table: u32,
    pub unload_address_table: u32,
    pub timestamp: u32,
}

impl DelayLoadDirectoryEntry {
    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub ordinal_base: u32,
    pub address_table_entries: u32,
    pub number_of_name_pointers: u32,
    pub address_table_rva: u32,
    pub name_pointer_rva: u32,
    pub ordinal_table_rva: u32,
}

/// Bounds-checked read of a record at a file offset
pub fn read<T: Pod>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    DataView::from(bytes).try_read::<T>(offset)
}
