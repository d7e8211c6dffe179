//! Side-by-side manifests
//!
//! An application manifest (`X.exe.manifest` next to `X.exe`) can redirect
//! DLL names to files of its own assembly, or to private assemblies installed
//! next to it.

use crate::common::LookupError;
use fs_err as fs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// DLL names redirected by the manifests of one binary, keyed by lowercase name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestRedirections {
    files: HashMap<String, PathBuf>,
}

fn element_named<'a, 'input>(node: &roxmltree::Node<'a, 'input>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn sidecar_manifest(binary: &Path) -> Option<PathBuf> {
    let mut file_name = binary.file_name()?.to_os_string();
    file_name.push(".manifest");
    Some(binary.with_file_name(file_name))
}

/// Probe the locations of a private assembly manifest
fn private_assembly_manifest(dir: &Path, assembly: &str) -> Option<PathBuf> {
    let file_name = format!("{assembly}.manifest");
    [dir.join(&file_name), dir.join(assembly).join(&file_name)]
        .into_iter()
        .find(|p| p.is_file())
}

impl ManifestRedirections {
    /// Redirections declared by the sidecar manifest of a binary, if it has one
    pub fn for_binary<P: AsRef<Path>>(binary: P) -> Result<Self, LookupError> {
        let binary = binary.as_ref();
        let (Some(manifest), Some(dir)) = (sidecar_manifest(binary), binary.parent()) else {
            return Ok(Self::default());
        };
        if !manifest.is_file() {
            return Ok(Self::default());
        }
        tracing::debug!(manifest = %manifest.display(), "reading side-by-side manifest");
        let content = fs::read_to_string(&manifest)?;
        Self::parse(&content, dir)
    }

    /// Parse an application manifest whose assembly lives in `dir`
    pub fn parse(content: &str, dir: &Path) -> Result<Self, LookupError> {
        let doc = roxmltree::Document::parse(content)?;
        let mut ret = Self::default();
        ret.add_files(&doc, dir);

        let dependencies: Vec<&str> = doc
            .descendants()
            .filter(|n| element_named(n, "assemblyIdentity"))
            .filter(|n| n.parent().is_some_and(|p| element_named(&p, "dependentAssembly")))
            .filter_map(|n| n.attribute("name"))
            .collect();
        for assembly in dependencies {
            let Some(manifest) = private_assembly_manifest(dir, assembly) else {
                tracing::debug!(assembly, "no private assembly found, assuming a shared one");
                continue;
            };
            let content = fs::read_to_string(&manifest)?;
            let assembly_doc = roxmltree::Document::parse(&content)?;
            if let Some(assembly_dir) = manifest.parent() {
                ret.add_files(&assembly_doc, assembly_dir);
            }
        }
        Ok(ret)
    }

    fn add_files(&mut self, doc: &roxmltree::Document, dir: &Path) {
        for name in doc
            .descendants()
            .filter(|n| element_named(n, "file"))
            .filter_map(|n| n.attribute("name"))
        {
            let path = dir.join(name);
            if path.is_file() {
                self.files.entry(name.to_lowercase()).or_insert(path);
            } else {
                tracing::debug!(file = %path.display(), "manifest file entry does not exist");
            }
        }
    }

    pub fn redirect(&self, dll_name: &str) -> Option<&Path> {
        self.files.get(&dll_name.to_lowercase()).map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
