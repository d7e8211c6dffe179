use crate::common::LookupError;
use crate::knowndlls::KnownDllRegistry;
use crate::manifest::ManifestRedirections;
use crate::query::LookupQuery;
use crate::system::WinFileSystemCache;
use fs_err as fs;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directory/set of DLLs to be searched, and relative metadata
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub enum LookupPathEntry {
    /// Redirection through the side-by-side manifest of the importing binary
    SideBySide,
    /// The DLL is implicitely loaded by the OS for every process, and not looked up every time
    KnownDLLs,
    /// Directory where the importing binary sits
    ExecutableDir,
    /// Windows System directory (typically C:\Windows\System32)
    SystemDir(PathBuf),
    /// 16-bit Windows System directory (typically C:\Windows\System)
    SystemDir16(PathBuf),
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system (value PATH variable in the shell executing the process)
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::KnownDLLs | Self::SystemDir(_) | Self::SystemDir16(_) | Self::WindowsDir(_)
        )
    }

    /// Fixed directory of the entry; the others depend on the importing binary
    pub fn get_path(&self) -> Option<&Path> {
        match self {
            Self::SideBySide | Self::KnownDLLs | Self::ExecutableDir => None,
            Self::SystemDir(p)
            | Self::SystemDir16(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => Some(p),
        }
    }
}

/// Full location of a DLL found during lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Sorted list of directories to be looked up when searching for a DLL
/// It is built from a query, depending on the current system configuration
/// (availability of a Windows root, and its configuration that influences the lookup)
#[derive(Debug)]
pub struct LookupPath {
    pub entries: Vec<LookupPathEntry>,
    known_dlls: Option<KnownDllRegistry>,
    fs_cache: RefCell<WinFileSystemCache>,
    manifests: RefCell<HashMap<PathBuf, ManifestRedirections>>,
}

impl LookupPath {
    pub fn new(entries: Vec<LookupPathEntry>, known_dlls: Option<KnownDllRegistry>) -> Self {
        Self {
            entries,
            known_dlls,
            fs_cache: RefCell::new(WinFileSystemCache::new()),
            manifests: RefCell::new(HashMap::new()),
        }
    }

    /// The standard search order for desktop applications
    pub fn deduce(query: &LookupQuery) -> Self {
        let working_dir = vec![LookupPathEntry::WorkingDir(query.target.working_dir.clone())];
        let entries = if let Some(system) = &query.system {
            let knowndlls_entry = if system.known_dlls.is_some() {
                vec![LookupPathEntry::KnownDLLs]
            } else {
                vec![]
            };
            let system_entries = vec![
                LookupPathEntry::SystemDir(system.sys_dir.clone()),
                LookupPathEntry::SystemDir16(system.sys16_dir.clone()),
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ];

            if system.safe_dll_search_mode() {
                [
                    vec![LookupPathEntry::SideBySide],
                    knowndlls_entry,
                    vec![LookupPathEntry::ExecutableDir],
                    system_entries,
                    working_dir,
                    Self::system_path_entries(query),
                    Self::user_path_entries(query),
                ]
                .concat()
            } else {
                [
                    vec![LookupPathEntry::SideBySide],
                    knowndlls_entry,
                    vec![LookupPathEntry::ExecutableDir],
                    working_dir,
                    system_entries,
                    Self::system_path_entries(query),
                    Self::user_path_entries(query),
                ]
                .concat()
            }
        } else {
            [
                vec![LookupPathEntry::SideBySide, LookupPathEntry::ExecutableDir],
                working_dir,
                Self::user_path_entries(query),
            ]
            .concat()
        };

        Self::new(entries, query.known_dlls().cloned())
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|path| {
                path.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.target
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect()
    }

    /// Parse an entry in a .dwp file
    fn dwp_string_to_context_entry(
        s: &str,
        q: &LookupQuery,
    ) -> Result<Vec<LookupPathEntry>, LookupError> {
        let system = q.system.as_ref();
        match s {
            "SxS" => Ok(vec![LookupPathEntry::SideBySide]),
            "KnownDLLs" => Ok(vec![LookupPathEntry::KnownDLLs]),
            "AppDir" => Ok(vec![LookupPathEntry::ExecutableDir]),
            "32BitSysDir" => Ok(system
                .map(|s| LookupPathEntry::SystemDir(s.sys_dir.clone()))
                .into_iter()
                .collect()),
            "16BitSysDir" => Ok(system
                .map(|s| LookupPathEntry::SystemDir16(s.sys16_dir.clone()))
                .into_iter()
                .collect()),
            "OSDir" => Ok(system
                .map(|s| LookupPathEntry::WindowsDir(s.win_dir.clone()))
                .into_iter()
                .collect()),
            // App Paths registrations only apply to ShellExecute
            "AppPath" => Ok(vec![]),
            "SysPath" => Ok(Self::system_path_entries(q)),
            _ if s.starts_with("UserDir ") => Ok(vec![LookupPathEntry::UserPath(PathBuf::from(
                s["UserDir ".len()..].trim(),
            ))]),
            _ => Err(LookupError::ParseError(format!(
                "Unknown key in dwp file: {}",
                s
            ))),
        }
    }

    /// Build a LookupPath from the content of a Dependency Walker .dwp file
    pub fn from_dwp_str(content: &str, query: &LookupQuery) -> Result<Self, LookupError> {
        // https://www.dependencywalker.com/help/html/path_files.htm
        let comment_chars = [':', ';', '/', '\'', '#'];
        let entries_vecs = content
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.starts_with(comment_chars))
            .map(|e| Self::dwp_string_to_context_entry(e, query))
            .collect::<Result<Vec<Vec<LookupPathEntry>>, LookupError>>()?;
        Ok(Self::new(entries_vecs.concat(), query.known_dlls().cloned()))
    }

    pub fn from_dwp_file<P: AsRef<Path>>(
        dwp_path: P,
        query: &LookupQuery,
    ) -> Result<Self, LookupError> {
        Self::from_dwp_str(&fs::read_to_string(dwp_path.as_ref())?, query)
    }

    // linearize the lookup context into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter_map(|e| e.get_path())
            .map(Path::to_owned)
            .collect()
    }

    pub fn known_dlls(&self) -> Option<&KnownDllRegistry> {
        self.known_dlls.as_ref()
    }

    /// Look for a DLL imported by `importer`, following the entries in order
    ///
    /// The first entry yielding a file wins.
    pub fn search_dll(&self, library: &str, importer: &Path) -> Option<LookupResult> {
        for e in &self.entries {
            let found = match e {
                LookupPathEntry::SideBySide => self.search_dll_in_manifests(library, importer),
                LookupPathEntry::KnownDLLs => self
                    .known_dlls
                    .as_ref()
                    .and_then(|kd| kd.lookup(library)),
                LookupPathEntry::ExecutableDir => importer
                    .parent()
                    .and_then(|dir| self.search_file_in_folder(library, dir)),
                LookupPathEntry::SystemDir(p)
                | LookupPathEntry::SystemDir16(p)
                | LookupPathEntry::WindowsDir(p)
                | LookupPathEntry::WorkingDir(p)
                | LookupPathEntry::SystemPath(p)
                | LookupPathEntry::UserPath(p) => self.search_file_in_folder(library, p),
            };
            if let Some(fullpath) = found {
                tracing::debug!(library, location = ?e, path = %fullpath.display(), "found");
                return Some(LookupResult {
                    location: e.clone(),
                    fullpath,
                });
            }
        }
        tracing::debug!(library, importer = %importer.display(), "not found in any search path entry");
        None
    }

    fn search_dll_in_manifests(&self, library: &str, importer: &Path) -> Option<PathBuf> {
        let mut manifests = self.manifests.borrow_mut();
        let redirections = manifests.entry(importer.to_owned()).or_insert_with(|| {
            ManifestRedirections::for_binary(importer).unwrap_or_else(|e| {
                tracing::warn!(importer = %importer.display(), "ignoring side-by-side manifest: {e}");
                ManifestRedirections::default()
            })
        });
        redirections.redirect(library).map(Path::to_owned)
    }

    fn search_file_in_folder(&self, filename: &str, folder: &Path) -> Option<PathBuf> {
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, folder)
    }
}
