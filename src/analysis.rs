//! Result of a dependency scan: the module arena and the queries over it

use crate::lookup_path::LookupPathEntry;
use crate::pe::{ByteRegion, Diagnostic, ExportTable, ImportTable, ImportedSymbol, PeImage};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Index of a module in the arena of an [`Analysis`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// How an imported symbol was matched against the exports of its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImportStatus {
    Resolved,
    /// The export forwards to another module
    ResolvedForwarded,
    /// No such export, or the module itself is missing or unparsable
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportPairing {
    pub symbol: ImportedSymbol,
    pub status: ImportStatus,
    /// Address table index of the matching export
    pub export_index: Option<usize>,
}

/// Edge from an importing module to one of the DLLs named in its import tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Name as it appears in the import table
    pub dll_name: String,
    pub target: NodeId,
    pub delay_load: bool,
    pub imports: Vec<ImportPairing>,
}

impl Dependency {
    /// Worst status among the imports of this edge
    pub fn status(&self) -> ImportStatus {
        if self.imports.iter().any(|i| i.status == ImportStatus::Unresolved) {
            ImportStatus::Unresolved
        } else if self
            .imports
            .iter()
            .any(|i| i.status == ImportStatus::ResolvedForwarded)
        {
            ImportStatus::ResolvedForwarded
        } else {
            ImportStatus::Resolved
        }
    }
}

/// A module of the dependency graph
#[derive(Debug, Serialize)]
pub struct FileInfo {
    /// Name under which the module was first encountered
    pub name: String,
    /// Location on disk; absent if the DLL was not found
    pub file_path: Option<PathBuf>,
    pub is_root: bool,
    /// Search path entry the module was found through
    pub location: Option<LookupPathEntry>,
    /// Depth at which the module was first mentioned in the dependency tree
    pub depth: usize,
    pub image: Option<PeImage>,
    pub imports: Option<ImportTable>,
    pub exports: Option<ExportTable>,
    pub dependencies: Vec<Dependency>,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip)]
    pub(crate) region: Option<ByteRegion>,
}

impl FileInfo {
    pub(crate) fn new(
        name: &str,
        file_path: Option<PathBuf>,
        location: Option<LookupPathEntry>,
        depth: usize,
        is_root: bool,
    ) -> Self {
        Self {
            name: name.to_owned(),
            file_path,
            is_root,
            location,
            depth,
            image: None,
            imports: None,
            exports: None,
            dependencies: Vec::new(),
            diagnostics: Vec::new(),
            region: None,
        }
    }

    /// File name on disk if found, else the name it was imported as
    pub fn display_name(&self) -> &str {
        self.file_path
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .unwrap_or(&self.name)
    }

    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn is_found(&self) -> bool {
        self.file_path.is_some()
    }

    /// Whether the headers decoded successfully
    pub fn is_valid_pe(&self) -> bool {
        self.image.is_some()
    }

    pub fn is_system(&self) -> bool {
        self.location.as_ref().is_some_and(LookupPathEntry::is_system)
    }

    pub fn is_known_dll(&self) -> bool {
        self.location == Some(LookupPathEntry::KnownDLLs)
    }

    pub fn import_count(&self) -> usize {
        self.imports.as_ref().map_or(0, ImportTable::symbol_count)
    }

    pub fn export_count(&self) -> usize {
        self.exports.as_ref().map_or(0, ExportTable::len)
    }

    /// Bytes of the file, kept mapped for the whole session
    pub fn bytes(&self) -> Option<&[u8]> {
        self.region.as_ref().map(ByteRegion::bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Map from dependent to list of non found dependees
    pub not_found_libraries: BTreeMap<String, BTreeSet<String>>,
    /// Map from importer to list of non found imported symbols, grouped by dependended DLL
    pub not_found_symbols: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl CheckReport {
    pub fn is_empty(&self) -> bool {
        self.not_found_libraries.is_empty() && self.not_found_symbols.is_empty()
    }
}

/// Collection of FileInfo objects, result of a DLL search
#[derive(Debug, Serialize)]
pub struct Analysis {
    pub(crate) nodes: Vec<FileInfo>,
    #[serde(skip)]
    pub(crate) index: HashMap<String, NodeId>,
    pub(crate) roots: Vec<NodeId>,
}

impl Analysis {
    pub fn node(&self, id: NodeId) -> &FileInfo {
        &self.nodes[id.0]
    }

    /// All modules, in the order they were first encountered
    pub fn nodes(&self) -> &[FileInfo] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &FileInfo)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Case-insensitive lookup by module name
    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.index.get(&name.to_lowercase()).copied()
    }

    pub fn get(&self, name: &str) -> Option<&FileInfo> {
        self.id_of(name).map(|id| self.node(id))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// Unique modules, ordered by depth of first appearance
    pub fn modules(&self) -> Vec<&FileInfo> {
        let mut sorted: Vec<&FileInfo> = self.nodes.iter().collect();
        sorted.sort_by_key(|n| n.depth);
        sorted
    }

    /// Modules importing from the given one
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| n.dependencies.iter().any(|d| d.target == id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Address table indices of the exports of a module that some module of the session imports
    pub fn export_usage(&self, id: NodeId) -> BTreeSet<usize> {
        self.nodes
            .iter()
            .flat_map(|n| n.dependencies.iter())
            .filter(|d| d.target == id)
            .flat_map(|d| d.imports.iter())
            .filter_map(|p| p.export_index)
            .collect()
    }

    /// Every diagnostic raised during the scan
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.nodes.iter().flat_map(|n| n.diagnostics.iter())
    }

    /// Check that all referenced DLLs are found, and that imported symbols are present
    pub fn check(&self) -> CheckReport {
        let mut report = CheckReport::default();
        for importer in &self.nodes {
            for dependency in &importer.dependencies {
                let target = self.node(dependency.target);
                if !target.is_found() {
                    report
                        .not_found_libraries
                        .entry(importer.display_name().to_owned())
                        .or_default()
                        .insert(dependency.dll_name.clone());
                    continue;
                }
                let missing: BTreeSet<String> = dependency
                    .imports
                    .iter()
                    .filter(|p| p.status == ImportStatus::Unresolved)
                    .map(|p| p.symbol.to_string())
                    .collect();
                if !missing.is_empty() {
                    report
                        .not_found_symbols
                        .entry(importer.display_name().to_owned())
                        .or_default()
                        .entry(dependency.dll_name.clone())
                        .or_default()
                        .extend(missing);
                }
            }
        }
        report
    }
}
