//! Translation of loaded-image addresses into file offsets
//!
//! Every table parser goes through [`find_object`] (or [`offset_in_section`]
//! when a table must share its owner's section) before touching file bytes.

use crate::pe::error::{PeError, Result};
use crate::pe::header::{PeImage, SectionHeader};

/// File position of an object found through the section table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// Raw file offset of the first byte
    pub offset: usize,
    /// Index of the containing section in `PeImage::sections`
    pub section: usize,
}

/// Map `size` bytes at `virtual_address` to a raw file offset
///
/// The first section whose `[virtual_address, virtual_address + raw_size)`
/// contains the address wins; the object must then end within that section's
/// raw data.
pub fn find_object(image: &PeImage, virtual_address: u32, size: u32) -> Result<Located> {
    for (index, section) in image.sections.iter().enumerate() {
        let start = section.virtual_address as u64;
        let end = start + section.raw_size as u64;
        let va = virtual_address as u64;
        if va >= start && va < end {
            let raw = section.raw_ptr as u64 + (va - start);
            if raw + size as u64 > section.raw_end() as u64 {
                return Err(PeError::ObjectOutOfBounds {
                    rva: virtual_address,
                    size,
                });
            }
            return Ok(Located {
                offset: raw as usize,
                section: index,
            });
        }
    }
    Err(PeError::ObjectNotFound {
        rva: virtual_address,
    })
}

/// Map an RVA that must lie in a given section to a raw file offset
pub fn offset_in_section(image: &PeImage, section: usize, rva: u32) -> Result<Located> {
    let sct = image
        .sections
        .get(section)
        .ok_or(PeError::NotInSection { rva })?;
    let start = sct.virtual_address as u64;
    let rva64 = rva as u64;
    if rva64 < start || rva64 >= start + sct.virtual_size as u64 {
        return Err(PeError::NotInSection { rva });
    }
    let raw = sct.raw_ptr as u64 + (rva64 - start);
    if raw >= sct.raw_end() as u64 {
        return Err(PeError::ObjectOutOfBounds { rva, size: 1 });
    }
    Ok(Located {
        offset: raw as usize,
        section,
    })
}

/// Read a NUL-terminated printable ASCII string starting at an RVA
pub fn read_ascii_string<'a>(
    bytes: &'a [u8],
    image: &PeImage,
    rva: u32,
    max_len: usize,
) -> Result<&'a str> {
    if rva == 0 {
        return Err(PeError::InvalidString {
            rva,
            reason: "null address",
        });
    }
    let located = find_object(image, rva, 1)?;
    read_ascii_at(bytes, &image.sections[located.section], located.offset, rva, max_len)
}

/// Read a NUL-terminated printable ASCII string at a file offset inside a section
///
/// The terminator must appear within `max_len` bytes and before the end of
/// the section's raw data.
pub fn read_ascii_at<'a>(
    bytes: &'a [u8],
    section: &SectionHeader,
    offset: usize,
    rva: u32,
    max_len: usize,
) -> Result<&'a str> {
    let limit = section.raw_end().min(bytes.len());
    let window = limit.saturating_sub(offset).min(max_len);
    let candidate = bytes.get(offset..offset + window).ok_or(PeError::InvalidString {
        rva,
        reason: "outside the section",
    })?;
    let len = candidate
        .iter()
        .position(|&b| b == 0)
        .ok_or(PeError::InvalidString {
            rva,
            reason: "missing terminator",
        })?;
    let text = &candidate[..len];
    if text.is_empty() {
        return Err(PeError::InvalidString {
            rva,
            reason: "empty",
        });
    }
    if !is_printable_ascii(text) {
        return Err(PeError::InvalidString {
            rva,
            reason: "not printable ASCII",
        });
    }
    std::str::from_utf8(text).map_err(|_| PeError::InvalidString {
        rva,
        reason: "not printable ASCII",
    })
}

pub fn is_printable_ascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (32..=126).contains(&b))
}
