//! Import directory, delay-load directory and import lookup tables

use serde::Serialize;

use crate::pe::error::{PeError, Result};
use crate::pe::header::PeImage;
use crate::pe::locate::{find_object, offset_in_section, read_ascii_at, read_ascii_string, Located};
use crate::pe::raw::{self, DelayLoadDirectoryEntry, ImportDirectoryEntry};
use crate::pe::Parsed;

/// Import directory table, up to (and excluding) its all-zero sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDirectory {
    pub entries: Vec<ImportDirectoryEntry>,
    /// Section holding the table; lookup tables must live there too
    pub section: usize,
}

/// Delay-load directory table, up to (and excluding) its all-zero sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayImportDirectory {
    pub entries: Vec<DelayLoadDirectoryEntry>,
    pub section: usize,
}

/// One slot of an import lookup table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportLookupEntry {
    value: u64,
    is_64bit: bool,
}

/// Decoded lookup entry, borrowing the symbol name from the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Import<'a> {
    ByName { hint: u16, name: &'a str },
    ByOrdinal { ordinal: u16 },
}

impl ImportLookupEntry {
    pub fn new_32(value: u32) -> Self {
        Self {
            value: value as u64,
            is_64bit: false,
        }
    }

    pub fn new_64(value: u64) -> Self {
        Self {
            value,
            is_64bit: true,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_ordinal(&self) -> bool {
        if self.is_64bit {
            self.value & raw::IMPORT_ORDINAL_FLAG_64 != 0
        } else {
            self.value & raw::IMPORT_ORDINAL_FLAG_32 as u64 != 0
        }
    }

    /// The ordinal of an ordinal import; the bits between the flag and the
    /// ordinal must be clear
    pub fn ordinal(&self) -> Result<u16> {
        let reserved = if self.is_64bit {
            0x7FFF_FFFF_FFFF_0000
        } else {
            0x7FFF_0000
        };
        if !self.is_ordinal() || self.value & reserved != 0 {
            return Err(PeError::InvalidLookupEntry { value: self.value });
        }
        Ok((self.value & 0xFFFF) as u16)
    }

    /// The RVA of the hint/name pair of a name import
    pub fn hint_name_rva(&self) -> Result<u32> {
        if self.is_ordinal() || self.value & 0x7FFF_FFFF_8000_0000 != 0 {
            return Err(PeError::InvalidLookupEntry { value: self.value });
        }
        Ok((self.value & 0x7FFF_FFFF) as u32)
    }

    pub fn decode<'a>(&self, bytes: &'a [u8], image: &PeImage) -> Result<Import<'a>> {
        self.decode_rebased(bytes, image, 0)
    }

    /// Decode an entry whose hint/name pointer is relative to `base`
    ///
    /// Legacy delay-load descriptors store virtual addresses, which are
    /// turned into RVAs by subtracting the image base.
    pub fn decode_rebased<'a>(
        &self,
        bytes: &'a [u8],
        image: &PeImage,
        base: u64,
    ) -> Result<Import<'a>> {
        if self.is_ordinal() {
            return Ok(Import::ByOrdinal {
                ordinal: self.ordinal()?,
            });
        }
        let pointer = if base == 0 {
            self.hint_name_rva()? as u64
        } else {
            self.value
        };
        let rva = to_rva(pointer, base)?;
        let (hint, name) = read_hint_name(bytes, image, rva)?;
        Ok(Import::ByName { hint, name })
    }
}

/// Read a hint/name pair: a 16-bit hint followed by a NUL-terminated name
pub fn read_hint_name<'a>(bytes: &'a [u8], image: &PeImage, rva: u32) -> Result<(u16, &'a str)> {
    let Located { offset, section } = find_object(image, rva, 2)?;
    let hint = raw::read::<u16>(bytes, offset).ok_or(PeError::ObjectOutOfBounds { rva, size: 2 })?;
    let name = read_ascii_at(
        bytes,
        &image.sections[section],
        offset + 2,
        rva.wrapping_add(2),
        raw::MAX_SYMBOL_NAME_LEN,
    )?;
    Ok((hint, name))
}

fn to_rva(address: u64, base: u64) -> Result<u32> {
    address
        .checked_sub(base)
        .and_then(|rva| u32::try_from(rva).ok())
        .ok_or(PeError::ObjectNotFound {
            rva: address as u32,
        })
}

/// Scan a sentinel-terminated table of fixed-size records
///
/// At most `cap` records are inspected; running out without meeting the
/// sentinel is an error.
fn scan_sentinel_table<T, F>(
    bytes: &[u8],
    offset: usize,
    cap: usize,
    what: &'static str,
    is_sentinel: F,
) -> Result<Vec<T>>
where
    T: dataview::Pod,
    F: Fn(&T) -> bool,
{
    let size = std::mem::size_of::<T>();
    let mut entries = Vec::new();
    for i in 0..cap {
        let entry: T = raw::read(bytes, offset + i * size).ok_or(PeError::MissingSentinel { what })?;
        if is_sentinel(&entry) {
            return Ok(entries);
        }
        entries.push(entry);
    }
    Err(PeError::MissingSentinel { what })
}

/// Locate the import directory table and find its length
///
/// `Ok(None)` means the image has no imports.
pub fn parse_import_directory(bytes: &[u8], image: &PeImage) -> Result<Option<ImportDirectory>> {
    let Some(directory) = image.data_directory(raw::DIRECTORY_ENTRY_IMPORT) else {
        return Ok(None);
    };
    let located = find_object(image, directory.virtual_address, directory.size)?;
    let cap = directory.size as usize / std::mem::size_of::<ImportDirectoryEntry>();
    let entries = scan_sentinel_table(
        bytes,
        located.offset,
        cap,
        "import directory table",
        ImportDirectoryEntry::is_null,
    )?;
    Ok(Some(ImportDirectory {
        entries,
        section: located.section,
    }))
}

pub fn import_dll_name<'a>(
    bytes: &'a [u8],
    image: &PeImage,
    entry: &ImportDirectoryEntry,
) -> Result<&'a str> {
    read_ascii_string(bytes, image, entry.name_rva, raw::MAX_DLL_NAME_LEN)
}

/// The lookup table of one imported DLL, falling back to the address table
pub fn import_lookup_table(
    bytes: &[u8],
    image: &PeImage,
    directory: &ImportDirectory,
    entry: &ImportDirectoryEntry,
) -> Result<Vec<ImportLookupEntry>> {
    let rva = if entry.lookup_table_rva != 0 {
        entry.lookup_table_rva
    } else {
        entry.address_table_rva
    };
    if rva == 0 {
        return Err(PeError::MissingSentinel {
            what: "import lookup table",
        });
    }
    scan_lookup_table(bytes, image, directory.section, rva)
}

fn scan_lookup_table(
    bytes: &[u8],
    image: &PeImage,
    section: usize,
    rva: u32,
) -> Result<Vec<ImportLookupEntry>> {
    let located = offset_in_section(image, section, rva)?;
    let remaining = image.sections[section].raw_end() - located.offset;
    let cap = raw::MAX_LOOKUP_ENTRIES.min(remaining / image.lookup_entry_size());
    let what = "import lookup table";
    if image.is_64bit {
        Ok(scan_sentinel_table(bytes, located.offset, cap, what, |v: &u64| *v == 0)?
            .into_iter()
            .map(ImportLookupEntry::new_64)
            .collect())
    } else {
        Ok(scan_sentinel_table(bytes, located.offset, cap, what, |v: &u32| *v == 0)?
            .into_iter()
            .map(ImportLookupEntry::new_32)
            .collect())
    }
}

/// Locate the delay-load directory table and find its length
pub fn parse_delay_import_directory(
    bytes: &[u8],
    image: &PeImage,
) -> Result<Option<DelayImportDirectory>> {
    let Some(directory) = image.data_directory(raw::DIRECTORY_ENTRY_DELAY_IMPORT) else {
        return Ok(None);
    };
    let located = find_object(image, directory.virtual_address, directory.size)?;
    let cap = directory.size as usize / std::mem::size_of::<DelayLoadDirectoryEntry>();
    let entries = scan_sentinel_table(
        bytes,
        located.offset,
        cap,
        "delay-load directory table",
        DelayLoadDirectoryEntry::is_null,
    )?;
    Ok(Some(DelayImportDirectory {
        entries,
        section: located.section,
    }))
}

/// Base to subtract from the addresses stored in a delay-load descriptor
pub fn delay_address_base(image: &PeImage, entry: &DelayLoadDirectoryEntry) -> u64 {
    if entry.attributes & raw::DELAY_ATTRIBUTE_RVA_BASED != 0 {
        0
    } else {
        image.image_base
    }
}

pub fn delay_import_dll_name<'a>(
    bytes: &'a [u8],
    image: &PeImage,
    entry: &DelayLoadDirectoryEntry,
) -> Result<&'a str> {
    let rva = to_rva(entry.name as u64, delay_address_base(image, entry))?;
    read_ascii_string(bytes, image, rva, raw::MAX_DLL_NAME_LEN)
}

pub fn delay_import_name_table(
    bytes: &[u8],
    image: &PeImage,
    directory: &DelayImportDirectory,
    entry: &DelayLoadDirectoryEntry,
) -> Result<Vec<ImportLookupEntry>> {
    if entry.name_table == 0 {
        return Err(PeError::MissingSentinel {
            what: "delay import name table",
        });
    }
    let rva = to_rva(entry.name_table as u64, delay_address_base(image, entry))?;
    scan_lookup_table(bytes, image, directory.section, rva)
}

/// Symbol imported from a DLL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImportedSymbol {
    ByName { hint: u16, name: String },
    ByOrdinal { ordinal: u16 },
    /// The entry could not be decoded
    Invalid { reason: String },
}

impl ImportedSymbol {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::ByName { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImportedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByName { name, .. } => write!(f, "{name}"),
            Self::ByOrdinal { ordinal } => write!(f, "#{ordinal}"),
            Self::Invalid { reason } => write!(f, "<invalid: {reason}>"),
        }
    }
}

impl From<Import<'_>> for ImportedSymbol {
    fn from(import: Import<'_>) -> Self {
        match import {
            Import::ByName { hint, name } => Self::ByName {
                hint,
                name: name.to_owned(),
            },
            Import::ByOrdinal { ordinal } => Self::ByOrdinal { ordinal },
        }
    }
}

/// All symbols imported from one DLL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedDll {
    pub dll_name: String,
    pub delay_load: bool,
    pub symbols: Vec<ImportedSymbol>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportTable {
    pub dlls: Vec<ImportedDll>,
}

impl ImportTable {
    pub fn symbol_count(&self) -> usize {
        self.dlls.iter().map(|d| d.symbols.len()).sum()
    }
}

fn decode_symbols(
    bytes: &[u8],
    image: &PeImage,
    table: Result<Vec<ImportLookupEntry>>,
    base: u64,
    errors: &mut Vec<PeError>,
) -> Vec<ImportedSymbol> {
    match table {
        Ok(entries) => entries
            .iter()
            .map(|e| match e.decode_rebased(bytes, image, base) {
                Ok(import) => import.into(),
                Err(err) => {
                    let reason = err.to_string();
                    errors.push(err);
                    ImportedSymbol::Invalid { reason }
                }
            })
            .collect(),
        Err(err) => {
            errors.push(err);
            Vec::new()
        }
    }
}

/// Read the normal and delay-load imports of an image
///
/// A malformed directory empties only its own half of the table; a DLL whose
/// name cannot be read is skipped; a bad lookup table leaves its DLL without
/// symbols; a bad entry becomes `ImportedSymbol::Invalid`. Every failure is
/// reported in `errors`.
pub fn read_imports(bytes: &[u8], image: &PeImage) -> Parsed<ImportTable> {
    let mut errors = Vec::new();
    let mut dlls = Vec::new();

    match parse_import_directory(bytes, image) {
        Ok(Some(directory)) => {
            for entry in &directory.entries {
                let dll_name = match import_dll_name(bytes, image, entry) {
                    Ok(name) => name.to_owned(),
                    Err(err) => {
                        errors.push(err);
                        continue;
                    }
                };
                let table = import_lookup_table(bytes, image, &directory, entry);
                dlls.push(ImportedDll {
                    dll_name,
                    delay_load: false,
                    symbols: decode_symbols(bytes, image, table, 0, &mut errors),
                });
            }
        }
        Ok(None) => {}
        Err(err) => errors.push(err),
    }

    match parse_delay_import_directory(bytes, image) {
        Ok(Some(directory)) => {
            for entry in &directory.entries {
                let dll_name = match delay_import_dll_name(bytes, image, entry) {
                    Ok(name) => name.to_owned(),
                    Err(err) => {
                        errors.push(err);
                        continue;
                    }
                };
                let table = delay_import_name_table(bytes, image, &directory, entry);
                let base = delay_address_base(image, entry);
                dlls.push(ImportedDll {
                    dll_name,
                    delay_load: true,
                    symbols: decode_symbols(bytes, image, table, base, &mut errors),
                });
            }
        }
        Ok(None) => {}
        Err(err) => errors.push(err),
    }

    Parsed {
        value: Some(ImportTable { dlls }),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testing::{PeBuilder, TestImport};

    fn kernel32_imports() -> Vec<TestImport> {
        vec![
            TestImport::name("CreateFileW", 0x00C2),
            TestImport::ordinal(5),
            TestImport::name("CloseHandle", 0x0089),
        ]
    }

    #[test]
    fn directory_length_stops_at_sentinel() -> Result<()> {
        for is_64bit in [false, true] {
            let bytes = PeBuilder::new(is_64bit)
                .import("KERNEL32.dll", kernel32_imports())
                .import("USER32.dll", vec![TestImport::name("MessageBoxW", 1)])
                // declared size leaves room for five more entries past the sentinel
                .import_directory_slack(5)
                .build();
            let image = PeImage::parse(&bytes)?;
            let directory = parse_import_directory(&bytes, &image)?.expect("imports");
            assert_eq!(directory.entries.len(), 2);
        }
        Ok(())
    }

    #[test]
    fn directory_without_sentinel_is_rejected() -> Result<()> {
        let bytes = PeBuilder::new(false)
            .import("KERNEL32.dll", kernel32_imports())
            .truncate_import_directory_size()
            .build();
        let image = PeImage::parse(&bytes)?;
        assert_eq!(
            parse_import_directory(&bytes, &image),
            Err(PeError::MissingSentinel {
                what: "import directory table"
            })
        );
        let parsed = read_imports(&bytes, &image);
        assert_eq!(parsed.value.map(|t| t.dlls.len()), Some(0));
        assert_eq!(parsed.errors.len(), 1);
        Ok(())
    }

    #[test]
    fn no_import_directory_is_empty() -> Result<()> {
        let bytes = PeBuilder::new(true).build();
        let image = PeImage::parse(&bytes)?;
        assert_eq!(parse_import_directory(&bytes, &image)?, None);
        let parsed = read_imports(&bytes, &image);
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.value, Some(ImportTable::default()));
        Ok(())
    }

    #[test]
    fn reads_names_and_ordinals() -> Result<()> {
        for is_64bit in [false, true] {
            let bytes = PeBuilder::new(is_64bit)
                .import("KERNEL32.dll", kernel32_imports())
                .build();
            let image = PeImage::parse(&bytes)?;
            let parsed = read_imports(&bytes, &image);
            assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
            let table = parsed.value.expect("table");
            assert_eq!(table.dlls.len(), 1);
            let dll = &table.dlls[0];
            assert_eq!(dll.dll_name, "KERNEL32.dll");
            assert!(!dll.delay_load);
            assert_eq!(
                dll.symbols,
                vec![
                    ImportedSymbol::ByName {
                        hint: 0x00C2,
                        name: "CreateFileW".to_owned()
                    },
                    ImportedSymbol::ByOrdinal { ordinal: 5 },
                    ImportedSymbol::ByName {
                        hint: 0x0089,
                        name: "CloseHandle".to_owned()
                    },
                ]
            );
        }
        Ok(())
    }

    #[test]
    fn ordinal_flag_and_full_ordinal_bits() -> Result<()> {
        for ordinal in [0u16, 1, 5, 0x00FF, 0x1234, 0xFFFF] {
            let e32 = ImportLookupEntry::new_32(raw::IMPORT_ORDINAL_FLAG_32 | ordinal as u32);
            assert!(e32.is_ordinal());
            assert_eq!(e32.ordinal()?, ordinal);

            let e64 = ImportLookupEntry::new_64(raw::IMPORT_ORDINAL_FLAG_64 | ordinal as u64);
            assert!(e64.is_ordinal());
            assert_eq!(e64.ordinal()?, ordinal);
        }
        Ok(())
    }

    #[test]
    fn reserved_bits_are_rejected() {
        let e32 = ImportLookupEntry::new_32(raw::IMPORT_ORDINAL_FLAG_32 | 0x0001_0005);
        assert!(e32.ordinal().is_err());
        let e64 = ImportLookupEntry::new_64(raw::IMPORT_ORDINAL_FLAG_64 | 0x1_0000_0005);
        assert!(e64.ordinal().is_err());
        let name64 = ImportLookupEntry::new_64(0x1_0000_2000);
        assert!(!name64.is_ordinal());
        assert!(name64.hint_name_rva().is_err());
        let name32 = ImportLookupEntry::new_32(0x2000);
        assert_eq!(name32.hint_name_rva(), Ok(0x2000));
    }

    #[test]
    fn bad_entry_only_invalidates_itself() -> Result<()> {
        let bytes = PeBuilder::new(false)
            .import(
                "KERNEL32.dll",
                vec![
                    TestImport::name("CreateFileW", 1),
                    TestImport::Raw(0x7FFF_0000),
                    TestImport::name("CloseHandle", 2),
                ],
            )
            .build();
        let image = PeImage::parse(&bytes)?;
        let parsed = read_imports(&bytes, &image);
        assert_eq!(parsed.errors.len(), 1);
        let symbols = &parsed.value.expect("table").dlls[0].symbols;
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols[0].name(), Some("CreateFileW"));
        assert!(matches!(symbols[1], ImportedSymbol::Invalid { .. }));
        assert_eq!(symbols[2].name(), Some("CloseHandle"));
        Ok(())
    }

    #[test]
    fn non_ascii_dll_name_skips_that_dll() -> Result<()> {
        let bytes = PeBuilder::new(true)
            .import("K\u{e9}RNEL32.dll", kernel32_imports())
            .import("USER32.dll", vec![TestImport::name("MessageBoxW", 1)])
            .build();
        let image = PeImage::parse(&bytes)?;
        let parsed = read_imports(&bytes, &image);
        assert_eq!(parsed.errors.len(), 1);
        let table = parsed.value.expect("table");
        assert_eq!(table.dlls.len(), 1);
        assert_eq!(table.dlls[0].dll_name, "USER32.dll");
        Ok(())
    }

    #[test]
    fn delay_imports_are_tagged() -> Result<()> {
        // legacy VA descriptors only exist in 32-bit images
        for (is_64bit, rva_based) in [(false, true), (false, false), (true, true)] {
            let bytes = PeBuilder::new(is_64bit)
                .import("KERNEL32.dll", vec![TestImport::name("CreateFileW", 1)])
                .delay_import(
                    "dbghelp.dll",
                    vec![
                        TestImport::name("MiniDumpWriteDump", 7),
                        TestImport::ordinal(12),
                    ],
                    rva_based,
                )
                .build();
            let image = PeImage::parse(&bytes)?;
            let parsed = read_imports(&bytes, &image);
            assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
            let table = parsed.value.expect("table");
            assert_eq!(table.dlls.len(), 2);
            assert_eq!(table.symbol_count(), 3);
            let delayed = &table.dlls[1];
            assert!(delayed.delay_load);
            assert_eq!(delayed.dll_name, "dbghelp.dll");
            assert_eq!(delayed.symbols[0].name(), Some("MiniDumpWriteDump"));
            assert_eq!(delayed.symbols[1], ImportedSymbol::ByOrdinal { ordinal: 12 });
        }
        Ok(())
    }
}
