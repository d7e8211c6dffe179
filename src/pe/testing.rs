//! Synthetic PE images for tests
//!
//! Images have a single `.rdata` section holding every table, laid out in
//! the order the tables are declared on the builder.

use crate::pe::raw;

/// One lookup table entry of a synthetic import
#[derive(Debug, Clone)]
pub(crate) enum TestImport {
    Name { name: String, hint: u16 },
    Ordinal(u16),
    /// Written to the lookup table verbatim
    Raw(u64),
}

impl TestImport {
    pub(crate) fn name(name: &str, hint: u16) -> Self {
        Self::Name {
            name: name.to_owned(),
            hint,
        }
    }

    pub(crate) fn ordinal(ordinal: u16) -> Self {
        Self::Ordinal(ordinal)
    }
}

/// One export address table slot of a synthetic export table
#[derive(Debug, Clone)]
pub(crate) enum TestExport {
    Named(String),
    Unnamed,
    Forwarded { name: String, target: String },
    Empty,
}

impl TestExport {
    pub(crate) fn named(name: &str) -> Self {
        Self::Named(name.to_owned())
    }

    pub(crate) fn forwarded(name: &str, target: &str) -> Self {
        Self::Forwarded {
            name: name.to_owned(),
            target: target.to_owned(),
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) | Self::Forwarded { name, .. } => Some(name),
            Self::Unnamed | Self::Empty => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PeBuilder {
    is_64bit: bool,
    is_dll: bool,
    imports: Vec<(String, Vec<TestImport>)>,
    delay_imports: Vec<(String, Vec<TestImport>, bool)>,
    exports: Option<(String, u32, Vec<TestExport>)>,
    import_slack: usize,
    truncate_import_size: bool,
    sort_export_names: bool,
    export_address_count: Option<u32>,
    first_name_slot: Option<u16>,
}

#[derive(Default)]
struct SectionData {
    bytes: Vec<u8>,
}

impl SectionData {
    fn alloc(&mut self, len: usize, align: usize) -> usize {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
        let offset = self.bytes.len();
        self.bytes.resize(offset + len, 0);
        offset
    }

    fn put_cstr(&mut self, s: &str) -> u32 {
        let offset = self.alloc(s.len() + 1, 1);
        self.bytes[offset..offset + s.len()].copy_from_slice(s.as_bytes());
        rva(offset)
    }

    fn put_hint_name(&mut self, hint: u16, name: &str) -> u32 {
        let offset = self.alloc(2 + name.len() + 1, 2);
        self.set_u16(offset, hint);
        self.bytes[offset + 2..offset + 2 + name.len()].copy_from_slice(name.as_bytes());
        rva(offset)
    }

    fn put_lookup_table(&mut self, values: &[u64], is_64bit: bool) -> u32 {
        let size = if is_64bit { 8 } else { 4 };
        let offset = self.alloc((values.len() + 1) * size, size);
        for (i, &value) in values.iter().enumerate() {
            if is_64bit {
                self.set_u64(offset + i * size, value);
            } else {
                self.set_u32(offset + i * size, value as u32);
            }
        }
        rva(offset)
    }

    fn set_u16(&mut self, offset: usize, value: u16) {
        put(&mut self.bytes, offset, &value.to_le_bytes());
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        put(&mut self.bytes, offset, &value.to_le_bytes());
    }

    fn set_u64(&mut self, offset: usize, value: u64) {
        put(&mut self.bytes, offset, &value.to_le_bytes());
    }
}

fn put(buffer: &mut [u8], offset: usize, bytes: &[u8]) {
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn rva(section_offset: usize) -> u32 {
    PeBuilder::SECTION_RVA + section_offset as u32
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

impl PeBuilder {
    pub(crate) const PE_OFFSET: usize = 0x40;
    pub(crate) const HEADERS_SIZE: usize = 0x200;
    pub(crate) const SECTION_RVA: u32 = 0x1000;
    pub(crate) const SECTION_RAW_PTR: u32 = 0x200;
    pub(crate) const IMAGE_BASE_32: u64 = 0x40_0000;
    pub(crate) const IMAGE_BASE_64: u64 = 0x1_4000_0000;
    /// Exported code lives past the end of the only section
    pub(crate) const CODE_RVA: u32 = 0x8000;

    pub(crate) fn new(is_64bit: bool) -> Self {
        Self {
            is_64bit,
            is_dll: false,
            imports: Vec::new(),
            delay_imports: Vec::new(),
            exports: None,
            import_slack: 0,
            truncate_import_size: false,
            sort_export_names: true,
            export_address_count: None,
            first_name_slot: None,
        }
    }

    pub(crate) fn dll(mut self) -> Self {
        self.is_dll = true;
        self
    }

    pub(crate) fn import(mut self, dll_name: &str, imports: Vec<TestImport>) -> Self {
        self.imports.push((dll_name.to_owned(), imports));
        self
    }

    pub(crate) fn delay_import(
        mut self,
        dll_name: &str,
        imports: Vec<TestImport>,
        rva_based: bool,
    ) -> Self {
        self.delay_imports
            .push((dll_name.to_owned(), imports, rva_based));
        self
    }

    pub(crate) fn exports(mut self, dll_name: &str, ordinal_base: u32, slots: Vec<TestExport>) -> Self {
        self.is_dll = true;
        self.exports = Some((dll_name.to_owned(), ordinal_base, slots));
        self
    }

    /// Declare room for extra all-zero entries after the import sentinel
    pub(crate) fn import_directory_slack(mut self, entries: usize) -> Self {
        self.import_slack = entries;
        self
    }

    /// Declare an import directory size that stops short of the sentinel
    pub(crate) fn truncate_import_directory_size(mut self) -> Self {
        self.truncate_import_size = true;
        self
    }

    /// Keep export names in declaration order instead of sorting them
    pub(crate) fn unsorted_export_names(mut self) -> Self {
        self.sort_export_names = false;
        self
    }

    /// Declare an address table entry count other than the number of slots
    pub(crate) fn export_address_count(mut self, count: u32) -> Self {
        self.export_address_count = Some(count);
        self
    }

    /// Point the first export name at the given address table slot
    pub(crate) fn first_export_name_slot(mut self, slot: u16) -> Self {
        self.first_name_slot = Some(slot);
        self
    }

    fn image_base(&self) -> u64 {
        if self.is_64bit {
            Self::IMAGE_BASE_64
        } else {
            Self::IMAGE_BASE_32
        }
    }

    fn lookup_values(&self, section: &mut SectionData, imports: &[TestImport], base: u64) -> Vec<u64> {
        imports
            .iter()
            .map(|import| match import {
                TestImport::Name { name, hint } => base + section.put_hint_name(*hint, name) as u64,
                TestImport::Ordinal(ordinal) if self.is_64bit => {
                    raw::IMPORT_ORDINAL_FLAG_64 | *ordinal as u64
                }
                TestImport::Ordinal(ordinal) => (raw::IMPORT_ORDINAL_FLAG_32 | *ordinal as u32) as u64,
                TestImport::Raw(value) => *value,
            })
            .collect()
    }

    fn build_section(&self, directories: &mut [(u32, u32); 16]) -> SectionData {
        let mut section = SectionData::default();

        if !self.imports.is_empty() {
            let slots = self.imports.len() + 1 + self.import_slack;
            let table = section.alloc(slots * 20, 4);
            let size = if self.truncate_import_size {
                self.imports.len() * 20
            } else {
                slots * 20
            };
            directories[raw::DIRECTORY_ENTRY_IMPORT] = (rva(table), size as u32);
            for (i, (dll_name, imports)) in self.imports.iter().enumerate() {
                let name_rva = section.put_cstr(dll_name);
                let values = self.lookup_values(&mut section, imports, 0);
                let ilt = section.put_lookup_table(&values, self.is_64bit);
                let iat = section.put_lookup_table(&values, self.is_64bit);
                let entry = table + i * 20;
                section.set_u32(entry, ilt);
                section.set_u32(entry + 12, name_rva);
                section.set_u32(entry + 16, iat);
            }
        }

        if !self.delay_imports.is_empty() {
            let size = (self.delay_imports.len() + 1) * 32;
            let table = section.alloc(size, 4);
            directories[raw::DIRECTORY_ENTRY_DELAY_IMPORT] = (rva(table), size as u32);
            for (i, (dll_name, imports, rva_based)) in self.delay_imports.iter().enumerate() {
                // legacy descriptors hold 32-bit virtual addresses
                let base = if *rva_based { 0 } else { self.image_base() };
                let address = |rva: u32| (base + rva as u64) as u32;
                let name_rva = section.put_cstr(dll_name);
                let values = self.lookup_values(&mut section, imports, base);
                let int = section.put_lookup_table(&values, self.is_64bit);
                let iat = section.put_lookup_table(&values, self.is_64bit);
                let entry = table + i * 32;
                section.set_u32(entry, if *rva_based { raw::DELAY_ATTRIBUTE_RVA_BASED } else { 0 });
                section.set_u32(entry + 4, address(name_rva));
                section.set_u32(entry + 12, address(iat));
                section.set_u32(entry + 16, address(int));
            }
        }

        if let Some((dll_name, ordinal_base, slots)) = &self.exports {
            let start = section.alloc(40, 4);
            let address_table = section.alloc(slots.len() * 4, 4);
            let mut names: Vec<(&str, u16)> = slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.name().map(|name| (name, i as u16)))
                .collect();
            if self.sort_export_names {
                names.sort();
            }
            let name_pointers = section.alloc(names.len() * 4, 4);
            let ordinals = section.alloc(names.len() * 2, 2);
            let dll_name_rva = section.put_cstr(dll_name);
            for (k, (name, index)) in names.iter().enumerate() {
                let name_rva = section.put_cstr(name);
                section.set_u32(name_pointers + k * 4, name_rva);
                let index = match self.first_name_slot {
                    Some(slot) if k == 0 => slot,
                    _ => *index,
                };
                section.set_u16(ordinals + k * 2, index);
            }
            for (i, slot) in slots.iter().enumerate() {
                let target = match slot {
                    TestExport::Empty => 0,
                    TestExport::Named(_) | TestExport::Unnamed => Self::CODE_RVA + i as u32 * 0x10,
                    TestExport::Forwarded { target, .. } => section.put_cstr(target),
                };
                section.set_u32(address_table + i * 4, target);
            }
            let end = section.bytes.len();

            section.set_u32(start + 12, dll_name_rva);
            section.set_u32(start + 16, *ordinal_base);
            let address_count = self.export_address_count.unwrap_or(slots.len() as u32);
            section.set_u32(start + 20, address_count);
            section.set_u32(start + 24, names.len() as u32);
            section.set_u32(start + 28, rva(address_table));
            section.set_u32(start + 32, rva(name_pointers));
            section.set_u32(start + 36, rva(ordinals));
            directories[raw::DIRECTORY_ENTRY_EXPORT] = (rva(start), (end - start) as u32);
        }

        section
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut directories = [(0u32, 0u32); 16];
        let section = self.build_section(&mut directories);
        let raw_size = align_up(section.bytes.len().max(1), 0x200);

        let mut file = vec![0u8; Self::HEADERS_SIZE + raw_size];
        put(&mut file, 0, &raw::MZ_MAGIC);
        put(&mut file, raw::NEW_HEADER_OFFSET_FIELD, &(Self::PE_OFFSET as u16).to_le_bytes());
        put(&mut file, Self::PE_OFFSET, &raw::PE_MAGIC.to_le_bytes());

        let (machine, fixed_size, magic) = if self.is_64bit {
            (0x8664u16, raw::OPTIONAL_FIXED_SIZE_PE32_PLUS, raw::OPTIONAL_MAGIC_PE32_PLUS)
        } else {
            (0x014Cu16, raw::OPTIONAL_FIXED_SIZE_PE32, raw::OPTIONAL_MAGIC_PE32)
        };
        let optional_size = fixed_size + 16 * 8;
        let mut characteristics: u16 = 0x0002;
        characteristics |= if self.is_64bit { 0x0020 } else { 0x0100 };
        if self.is_dll {
            characteristics |= 0x2000;
        }

        let coff = Self::PE_OFFSET + raw::PE_SIGNATURE_SIZE;
        put(&mut file, coff, &machine.to_le_bytes());
        put(&mut file, coff + 2, &1u16.to_le_bytes());
        put(&mut file, coff + 4, &0x5F00_0000u32.to_le_bytes());
        put(&mut file, coff + 16, &(optional_size as u16).to_le_bytes());
        put(&mut file, coff + 18, &characteristics.to_le_bytes());

        let optional = coff + 20;
        put(&mut file, optional, &magic.to_le_bytes());
        if self.is_64bit {
            put(&mut file, optional + 24, &self.image_base().to_le_bytes());
        } else {
            put(&mut file, optional + 28, &(self.image_base() as u32).to_le_bytes());
        }
        put(&mut file, optional + 32, &0x1000u32.to_le_bytes());
        put(&mut file, optional + 36, &0x200u32.to_le_bytes());
        let size_of_image = align_up(Self::SECTION_RVA as usize + raw_size, 0x1000) as u32;
        put(&mut file, optional + 56, &size_of_image.to_le_bytes());
        put(&mut file, optional + 60, &(Self::HEADERS_SIZE as u32).to_le_bytes());
        let subsystem: u16 = 3;
        put(&mut file, optional + 68, &subsystem.to_le_bytes());
        put(&mut file, optional + fixed_size - 4, &16u32.to_le_bytes());
        for (i, (address, size)) in directories.iter().enumerate() {
            let entry = optional + fixed_size + i * 8;
            put(&mut file, entry, &address.to_le_bytes());
            put(&mut file, entry + 4, &size.to_le_bytes());
        }

        let header = optional + optional_size;
        put(&mut file, header, b".rdata\0\0");
        put(&mut file, header + 8, &(raw_size as u32).to_le_bytes());
        put(&mut file, header + 12, &Self::SECTION_RVA.to_le_bytes());
        put(&mut file, header + 16, &(raw_size as u32).to_le_bytes());
        put(&mut file, header + 20, &Self::SECTION_RAW_PTR.to_le_bytes());
        put(&mut file, header + 36, &0x4000_0040u32.to_le_bytes());

        put(&mut file, Self::SECTION_RAW_PTR as usize, &section.bytes);
        file
    }
}
