//! Export directory parsing

use serde::Serialize;

use crate::pe::error::{PeError, Result};
use crate::pe::header::PeImage;
use crate::pe::locate::{find_object, read_ascii_string};
use crate::pe::raw::{self, ExportDirectory};
use crate::pe::Parsed;

/// Where an export address table slot points
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExportTarget {
    /// RVA of the exported code or data
    Code(u32),
    /// "OtherDll.Symbol" string stored inside the export directory
    Forwarder(String),
    /// Zero slot: the ordinal is not exported
    Empty,
}

impl ExportTarget {
    pub fn is_forwarder(&self) -> bool {
        matches!(self, Self::Forwarder(_))
    }
}

/// Entry of the name pointer table, with its parallel ordinal table slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportName {
    pub name: String,
    /// Index into the address table (the biased ordinal)
    pub address_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportTable {
    pub dll_name: Option<String>,
    pub ordinal_base: u32,
    /// Indexed by `ordinal - ordinal_base`
    pub address_table: Vec<ExportTarget>,
    /// In file order, which the format requires to be sorted by name
    pub names: Vec<ExportName>,
    /// Whether `names` is actually sorted, enabling binary search
    pub names_sorted: bool,
}

/// One exported symbol, as listed for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Export<'a> {
    pub ordinal: u32,
    /// Position in the name pointer table, if the export is named
    pub hint: Option<u16>,
    pub name: Option<&'a str>,
    pub target: &'a ExportTarget,
}

impl ExportTable {
    /// Address table index of the export with the given name
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        let found = if self.names_sorted {
            self.names
                .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
                .ok()
        } else {
            self.names.iter().position(|e| e.name == name)
        };
        found
            .map(|i| self.names[i].address_index as usize)
            .filter(|&index| index < self.address_table.len())
    }

    /// Address table index of the given ordinal, if it is in range and exported
    pub fn find_by_ordinal(&self, ordinal: u16) -> Option<usize> {
        let index = (ordinal as u32).checked_sub(self.ordinal_base)? as usize;
        match self.address_table.get(index) {
            Some(ExportTarget::Empty) | None => None,
            Some(_) => Some(index),
        }
    }

    pub fn target(&self, index: usize) -> Option<&ExportTarget> {
        self.address_table.get(index)
    }

    /// Number of non-empty address table slots
    pub fn len(&self) -> usize {
        self.address_table
            .iter()
            .filter(|t| **t != ExportTarget::Empty)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All non-empty exports in ordinal order, with their names when they have one
    pub fn exports(&self) -> Vec<Export<'_>> {
        let mut named: Vec<Option<(u16, &str)>> = vec![None; self.address_table.len()];
        for (hint, e) in self.names.iter().enumerate() {
            if let Some(slot) = named.get_mut(e.address_index as usize) {
                if slot.is_none() {
                    *slot = Some((hint as u16, e.name.as_str()));
                }
            }
        }
        self.address_table
            .iter()
            .enumerate()
            .filter(|(_, t)| **t != ExportTarget::Empty)
            .filter_map(|(i, target)| {
                Some(Export {
                    ordinal: u32::try_from(i)
                        .ok()
                        .and_then(|i| self.ordinal_base.checked_add(i))?,
                    hint: named[i].map(|(h, _)| h),
                    name: named[i].map(|(_, n)| n),
                    target,
                })
            })
            .collect()
    }
}

fn read_u32_array(bytes: &[u8], image: &PeImage, rva: u32, count: u32) -> Result<Vec<u32>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let located = find_object(image, rva, count * 4)?;
    (0..count as usize)
        .map(|i| {
            raw::read::<u32>(bytes, located.offset + i * 4)
                .ok_or(PeError::ObjectOutOfBounds { rva, size: count * 4 })
        })
        .collect()
}

fn read_u16_array(bytes: &[u8], image: &PeImage, rva: u32, count: u32) -> Result<Vec<u16>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let located = find_object(image, rva, count * 2)?;
    (0..count as usize)
        .map(|i| {
            raw::read::<u16>(bytes, located.offset + i * 2)
                .ok_or(PeError::ObjectOutOfBounds { rva, size: count * 2 })
        })
        .collect()
}

/// Read the export table of an image
///
/// A missing directory yields no value and no error. A malformed directory or
/// address table yields no value. Broken names or forwarder strings are
/// skipped and reported.
pub fn read_exports(bytes: &[u8], image: &PeImage) -> Parsed<ExportTable> {
    let mut errors = Vec::new();
    let value = match parse_export_table(bytes, image, &mut errors) {
        Ok(table) => table,
        Err(err) => {
            errors.push(err);
            None
        }
    };
    Parsed { value, errors }
}

fn parse_export_table(
    bytes: &[u8],
    image: &PeImage,
    errors: &mut Vec<PeError>,
) -> Result<Option<ExportTable>> {
    let Some(directory) = image.data_directory(raw::DIRECTORY_ENTRY_EXPORT) else {
        return Ok(None);
    };
    let header_size = std::mem::size_of::<ExportDirectory>() as u32;
    let located = find_object(image, directory.virtual_address, header_size)?;
    let header: ExportDirectory = raw::read(bytes, located.offset).ok_or(
        PeError::ObjectOutOfBounds {
            rva: directory.virtual_address,
            size: header_size,
        },
    )?;

    if header.address_table_entries > raw::MAX_EXPORT_ENTRIES
        || header.number_of_name_pointers > raw::MAX_EXPORT_ENTRIES
    {
        return Err(PeError::InvalidExportTable(format!(
            "{} addresses and {} names exceed the supported table size",
            header.address_table_entries, header.number_of_name_pointers
        )));
    }
    if header.ordinal_base as u64 + header.address_table_entries as u64 > u32::MAX as u64 + 1 {
        return Err(PeError::InvalidExportTable(format!(
            "ordinal base {} leaves no room for {} addresses",
            header.ordinal_base, header.address_table_entries
        )));
    }
    if header.address_table_entries != 0 && header.address_table_rva == 0 {
        return Err(PeError::InvalidExportTable(
            "missing export address table".to_owned(),
        ));
    }

    let dll_name = if header.name != 0 {
        match read_ascii_string(bytes, image, header.name, raw::MAX_DLL_NAME_LEN) {
            Ok(name) => Some(name.to_owned()),
            Err(err) => {
                errors.push(err);
                None
            }
        }
    } else {
        None
    };

    let addresses = read_u32_array(
        bytes,
        image,
        header.address_table_rva,
        header.address_table_entries,
    )?;
    let address_table: Vec<ExportTarget> = addresses
        .into_iter()
        .map(|rva| {
            if rva == 0 {
                ExportTarget::Empty
            } else if directory.contains(rva) {
                match read_ascii_string(bytes, image, rva, raw::MAX_SYMBOL_NAME_LEN) {
                    Ok(forward) => ExportTarget::Forwarder(forward.to_owned()),
                    Err(err) => {
                        errors.push(err);
                        ExportTarget::Forwarder(String::new())
                    }
                }
            } else {
                ExportTarget::Code(rva)
            }
        })
        .collect();

    let names = match read_export_names(bytes, image, &header, address_table.len(), errors) {
        Ok(names) => names,
        Err(err) => {
            errors.push(err);
            Vec::new()
        }
    };
    let names_sorted = names
        .windows(2)
        .all(|w| w[0].name.as_bytes() <= w[1].name.as_bytes());

    Ok(Some(ExportTable {
        dll_name,
        ordinal_base: header.ordinal_base,
        address_table,
        names,
        names_sorted,
    }))
}

fn read_export_names(
    bytes: &[u8],
    image: &PeImage,
    header: &ExportDirectory,
    address_count: usize,
    errors: &mut Vec<PeError>,
) -> Result<Vec<ExportName>> {
    let count = header.number_of_name_pointers;
    let pointers = read_u32_array(bytes, image, header.name_pointer_rva, count)?;
    let ordinals = read_u16_array(bytes, image, header.ordinal_table_rva, count)?;

    let mut names = Vec::with_capacity(pointers.len());
    for (&name_rva, &address_index) in pointers.iter().zip(ordinals.iter()) {
        if address_index as usize >= address_count {
            errors.push(PeError::InvalidExportTable(format!(
                "name at RVA {name_rva:#x} refers to address slot {address_index} of {address_count}"
            )));
            continue;
        }
        match read_ascii_string(bytes, image, name_rva, raw::MAX_SYMBOL_NAME_LEN) {
            Ok(name) => names.push(ExportName {
                name: name.to_owned(),
                address_index,
            }),
            Err(err) => errors.push(err),
        }
    }
    Ok(names)
}
