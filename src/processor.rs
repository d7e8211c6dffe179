use crate::analysis::{Analysis, Dependency, FileInfo, ImportPairing, ImportStatus, NodeId};
use crate::common::LookupError;
use crate::lookup_path::LookupPath;
use crate::pe::{
    read_exports, read_imports, ByteRegion, Diagnostic, ExportTable, ExportTarget, ImportedSymbol,
    PeError, PeImage,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info, warn};

/// Finds the dependencies of the specified binaries within the given search path
///
/// The dependencies are resolved recursively, in a breadth-first fashion. Every module is
/// visited once, however many times and under whatever casing it is imported.
pub struct Processor<'a> {
    lookup_path: &'a LookupPath,
    queue: VecDeque<NodeId>,
    nodes: Vec<FileInfo>,
    // lowercase module name -> node
    index: HashMap<String, NodeId>,
    roots: Vec<NodeId>,
}

impl<'a> Processor<'a> {
    pub fn new(lookup_path: &'a LookupPath) -> Self {
        Self {
            lookup_path,
            queue: VecDeque::new(),
            nodes: Vec::new(),
            index: HashMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn run<P: AsRef<Path>>(mut self, roots: &[P]) -> Result<Analysis, LookupError> {
        if roots.is_empty() {
            return Err(LookupError::ScanError("No binary to scan".to_owned()));
        }
        for root in roots {
            self.add_root(root.as_ref())?;
        }

        while let Some(id) = self.queue.pop_front() {
            self.process(id);
        }
        self.pair_imports();

        info!(modules = self.nodes.len(), "scan complete");
        Ok(Analysis {
            nodes: self.nodes,
            index: self.index,
            roots: self.roots,
        })
    }

    fn add_root(&mut self, path: &Path) -> Result<(), LookupError> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                LookupError::ScanError(format!("could not open file {}", path.display()))
            })?;
        let key = name.to_lowercase();
        if let Some(&id) = self.index.get(&key) {
            warn!(
                path = %path.display(),
                "a root named {name} was already given, ignoring"
            );
            self.nodes[id.0].is_root = true;
            return Ok(());
        }
        let id = self.push(key, FileInfo::new(name, Some(path.to_owned()), None, 0, true));
        self.roots.push(id);
        self.queue.push_back(id);
        Ok(())
    }

    fn push(&mut self, key: String, node: FileInfo) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.index.insert(key, id);
        id
    }

    /// Return the node for a DLL name, locating it on first encounter
    fn resolve(&mut self, dll_name: &str, importer: &Path, depth: usize) -> NodeId {
        let key = dll_name.to_lowercase();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        match self.lookup_path.search_dll(dll_name, importer) {
            Some(found) => {
                info!(
                    dll = dll_name,
                    location = ?found.location,
                    path = %found.fullpath.display(),
                    "resolved"
                );
                let node = FileInfo::new(
                    dll_name,
                    Some(found.fullpath),
                    Some(found.location),
                    depth,
                    false,
                );
                let id = self.push(key, node);
                self.queue.push_back(id);
                id
            }
            None => {
                info!(dll = dll_name, importer = %importer.display(), "not found");
                self.push(key, FileInfo::new(dll_name, None, None, depth, false))
            }
        }
    }

    fn diagnose(&mut self, id: NodeId, diagnostic: Diagnostic) {
        warn!("{diagnostic}");
        self.nodes[id.0].diagnostics.push(diagnostic);
    }

    fn diagnose_pe(&mut self, id: NodeId, error: &PeError) {
        let module = self.nodes[id.0].display_name().to_owned();
        self.diagnose(id, Diagnostic::from_pe_error(&module, error));
    }

    /// Parse a module and create the edges to its dependencies
    ///
    /// A module that cannot be read or decoded stays a leaf of the graph.
    fn process(&mut self, id: NodeId) {
        let Some(path) = self.nodes[id.0].file_path.clone() else {
            return;
        };
        let depth = self.nodes[id.0].depth;
        debug!(path = %path.display(), depth, "processing");

        let region = match ByteRegion::open(&path) {
            Ok(region) => region,
            Err(e) => {
                let module = self.nodes[id.0].display_name().to_owned();
                self.diagnose(
                    id,
                    Diagnostic {
                        module,
                        offset: None,
                        reason: format!("could not read {}: {e}", path.display()),
                    },
                );
                return;
            }
        };

        let bytes = region.bytes();
        let image = match PeImage::parse(bytes) {
            Ok(image) => image,
            Err(e) => {
                self.diagnose_pe(id, &e);
                self.nodes[id.0].region = Some(region);
                return;
            }
        };
        let imports = read_imports(bytes, &image);
        let exports = read_exports(bytes, &image);
        for e in imports.errors.iter().chain(exports.errors.iter()) {
            self.diagnose_pe(id, e);
        }

        let mut dependencies = Vec::new();
        if let Some(table) = &imports.value {
            for dll in &table.dlls {
                let target = self.resolve(&dll.dll_name, &path, depth + 1);
                dependencies.push(Dependency {
                    dll_name: dll.dll_name.clone(),
                    target,
                    delay_load: dll.delay_load,
                    imports: dll
                        .symbols
                        .iter()
                        .map(|symbol| ImportPairing {
                            symbol: symbol.clone(),
                            status: ImportStatus::Unresolved,
                            export_index: None,
                        })
                        .collect(),
                });
            }
        }

        let node = &mut self.nodes[id.0];
        node.image = Some(image);
        node.imports = imports.value;
        node.exports = exports.value;
        node.dependencies = dependencies;
        node.region = Some(region);
    }

    /// Match every import against the exports of the module it targets
    fn pair_imports(&mut self) {
        for i in 0..self.nodes.len() {
            let pairings: Vec<Vec<(ImportStatus, Option<usize>)>> = self.nodes[i]
                .dependencies
                .iter()
                .map(|dependency| {
                    let exports = self.nodes[dependency.target.0].exports.as_ref();
                    dependency
                        .imports
                        .iter()
                        .map(|p| pair_symbol(&p.symbol, exports))
                        .collect()
                })
                .collect();
            for (dependency, statuses) in self.nodes[i].dependencies.iter_mut().zip(pairings) {
                for (pairing, (status, export_index)) in dependency.imports.iter_mut().zip(statuses)
                {
                    pairing.status = status;
                    pairing.export_index = export_index;
                }
            }
        }
    }
}

fn pair_symbol(
    symbol: &ImportedSymbol,
    exports: Option<&ExportTable>,
) -> (ImportStatus, Option<usize>) {
    let Some(exports) = exports else {
        return (ImportStatus::Unresolved, None);
    };
    let index = match symbol {
        ImportedSymbol::ByName { name, .. } => exports.find_by_name(name),
        ImportedSymbol::ByOrdinal { ordinal } => exports.find_by_ordinal(*ordinal),
        ImportedSymbol::Invalid { .. } => None,
    };
    match index.and_then(|i| exports.target(i).map(|t| (i, t))) {
        Some((i, ExportTarget::Forwarder(_))) => (ImportStatus::ResolvedForwarded, Some(i)),
        Some((i, ExportTarget::Code(_))) => (ImportStatus::Resolved, Some(i)),
        _ => (ImportStatus::Unresolved, None),
    }
}

/// Build the dependency graph of the roots of a query
pub fn analyze(
    query: &crate::query::LookupQuery,
    lookup_path: &LookupPath,
) -> Result<Analysis, LookupError> {
    Processor::new(lookup_path).run(&query.target.roots)
}
