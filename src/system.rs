#[cfg(windows)]
extern crate winapi;
use crate::common::LookupError;
use crate::knowndlls::KnownDllRegistry;
use fs_err as fs;
use serde::Serialize;
use std::collections::HashMap;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Description of a Windows system
/// If running from within Windows we extract the available information from the environment
/// variables and the Windows API.
/// If running in another OS we can only guess the directories, and can't do anything about the PATH
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowsSystem {
    /// SafeDllSearchMode; assumed on when unknown
    pub safe_dll_search_mode_on: Option<bool>,
    pub known_dlls: Option<KnownDllRegistry>,
    pub win_dir: PathBuf,
    pub sys_dir: PathBuf,
    /// 16-bit system directory (typically C:\Windows\System)
    pub sys16_dir: PathBuf,
    pub system_path: Option<Vec<PathBuf>>,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;

        let system_path = std::env::var("PATH").ok().map(|s| {
            s.split(';')
                .filter(|subs| !subs.is_empty())
                .filter_map(|subs| fs::canonicalize(subs).ok())
                .collect()
        });
        let known_dlls = match KnownDllRegistry::from_current_system(&sys_dir) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!("could not list \\KnownDlls, using the stock list: {e}");
                KnownDllRegistry::windows_default(&sys_dir)
            }
        };
        Ok(Self {
            safe_dll_search_mode_on: None,
            known_dlls: Some(known_dlls),
            sys16_dir: win_dir.join("System"),
            win_dir,
            sys_dir,
            system_path,
        })
    }

    /// Collect information about the Windows operating system installed on the partition the target
    /// executable lies into
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Option<Self> {
        Self::find_root(&p).and_then(Self::from_root)
    }

    /// Try finding a Windows installation along the path to the target executable
    /// Rationale: the user may have mounted a Windows partition at an unknown depth in the filesystem
    pub fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        p.as_ref()
            .parent()?
            .ancestors()
            .find(|a| Self::from_root(a).is_some())
            .map(Path::to_owned)
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        // TODO: read SafeDllSearchMode and the KnownDLLs key from the SYSTEM hive of the partition
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if sys_dir.is_dir() {
            Some(Self {
                safe_dll_search_mode_on: None,
                known_dlls: Some(KnownDllRegistry::windows_default(&sys_dir)),
                sys16_dir: win_dir.join("System"),
                win_dir,
                sys_dir,
                system_path: None,
            })
        } else {
            None
        }
    }

    pub fn safe_dll_search_mode(&self) -> bool {
        self.safe_dll_search_mode_on.unwrap_or(true)
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
///
/// File names are compared case-insensitively, as Windows does.
#[derive(Debug, Default)]
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn test_file_in_folder_case_insensitive<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        filename: P,
        folder: Q,
    ) -> Option<PathBuf> {
        let folder = folder.as_ref();
        let dir = self.scan_folder(folder);
        dir.get(&filename.as_ref().to_string_lossy().to_lowercase())
            .map(|p| folder.join(p))
    }

    /// Scan a folder once; an unreadable folder is remembered as empty
    fn scan_folder(&mut self, folder: &Path) -> &HashMap<String, PathBuf> {
        self.files_in_dirs
            .entry(folder.to_owned())
            .or_insert_with(|| match Self::list_files(folder) {
                Ok(files) => files,
                Err(e) => {
                    tracing::debug!(folder = %folder.display(), "cannot scan directory: {e}");
                    HashMap::new()
                }
            })
    }

    fn list_files(folder: &Path) -> Result<HashMap<String, PathBuf>, LookupError> {
        Ok(fs::read_dir(folder)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.metadata().map_or_else(|_| false, |m| m.is_file()))
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|s| (s.to_lowercase(), entry.file_name().into()))
            })
            .collect())
    }
}
