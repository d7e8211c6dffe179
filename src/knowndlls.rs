//! The list of known DLLs of a Windows installation
//!
//! Known DLLs are mapped by the loader from a fixed directory regardless of
//! the search order. Names are stored lowercase and sorted, so that a
//! membership test is a binary search.

use crate::common::LookupError;
use fs_err as fs;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// KnownDLLs of a stock Windows 10 installation, sorted
pub const DEFAULT_KNOWN_DLLS: &[&str] = &[
    "advapi32.dll",
    "clbcatq.dll",
    "combase.dll",
    "comdlg32.dll",
    "coml2.dll",
    "difxapi.dll",
    "gdi32.dll",
    "gdiplus.dll",
    "imagehlp.dll",
    "imm32.dll",
    "kernel32.dll",
    "kernelbase.dll",
    "msctf.dll",
    "msvcrt.dll",
    "normaliz.dll",
    "nsi.dll",
    "ntdll.dll",
    "ole32.dll",
    "oleaut32.dll",
    "psapi.dll",
    "rpcrt4.dll",
    "sechost.dll",
    "setupapi.dll",
    "shcore.dll",
    "shell32.dll",
    "shlwapi.dll",
    "user32.dll",
    "wldap32.dll",
    "wow64.dll",
    "wow64win.dll",
    "ws2_32.dll",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownDllRegistry {
    names: Vec<String>,
    directory: PathBuf,
}

impl KnownDllRegistry {
    /// Wrap a list that is already lowercase, ASCII and strictly ascending
    pub fn new<P: Into<PathBuf>>(names: Vec<String>, directory: P) -> Result<Self, LookupError> {
        if let Some(bad) = names
            .iter()
            .find(|n| n.is_empty() || !n.is_ascii() || n.bytes().any(|b| b.is_ascii_uppercase()))
        {
            return Err(LookupError::InvalidKnownDllList(format!(
                "{bad:?} is not a lowercase ASCII name"
            )));
        }
        if let Some(pair) = names.windows(2).find(|w| w[0] >= w[1]) {
            return Err(LookupError::InvalidKnownDllList(format!(
                "{:?} and {:?} are out of order or duplicated",
                pair[0], pair[1]
            )));
        }
        Ok(Self {
            names,
            directory: directory.into(),
        })
    }

    /// Normalize arbitrary names: lowercase, sort and deduplicate
    pub fn from_unsorted<I, S, P>(names: I, directory: P) -> Result<Self, LookupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        P: Into<PathBuf>,
    {
        let mut names: Vec<String> = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Self::new(names, directory)
    }

    /// Parse a list with one name per line; blank lines and `#` comments are skipped
    pub fn parse_list<P: Into<PathBuf>>(content: &str, directory: P) -> Result<Self, LookupError> {
        let names = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));
        Self::from_unsorted(names, directory)
    }

    pub fn from_file<P: AsRef<Path>, Q: Into<PathBuf>>(
        list_path: P,
        directory: Q,
    ) -> Result<Self, LookupError> {
        let content = fs::read_to_string(list_path.as_ref())?;
        Self::parse_list(&content, directory)
    }

    /// The stock Windows list, mapped from the given system directory
    pub fn windows_default<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            names: DEFAULT_KNOWN_DLLS.iter().map(|&s| s.to_owned()).collect(),
            directory: directory.into(),
        }
    }

    /// Read the list from the `\KnownDlls` object directory of the running system
    ///
    /// Listing the object directory, rather than the registry key, also
    /// yields the dependencies of the listed DLLs.
    #[cfg(windows)]
    pub fn from_current_system<P: Into<PathBuf>>(directory: P) -> Result<Self, LookupError> {
        let names = object_directory::known_dll_sections()?;
        Self::from_unsorted(names, directory)
    }

    pub fn contains(&self, dll_name: &str) -> bool {
        self.position(dll_name).is_some()
    }

    /// Path the loader maps a known DLL from
    pub fn lookup(&self, dll_name: &str) -> Option<PathBuf> {
        self.position(dll_name)
            .map(|i| self.directory.join(&self.names[i]))
    }

    fn position(&self, dll_name: &str) -> Option<usize> {
        let key = dll_name.to_ascii_lowercase();
        self.names.binary_search(&key).ok()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn with_directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.directory = directory.into();
        self
    }
}

#[cfg(windows)]
mod object_directory {
    use ntapi::ntobapi::{
        NtClose, NtOpenDirectoryObject, NtQueryDirectoryObject, DIRECTORY_QUERY,
        OBJECT_DIRECTORY_INFORMATION,
    };
    use ntapi::ntrtl::RtlNtStatusToDosError;
    use std::ffi::OsString;
    use std::mem::size_of;
    use std::os::windows::prelude::*;
    use std::ptr::null_mut;
    use winapi::shared::ntdef::{
        FALSE, HANDLE, NT_SUCCESS, OBJECT_ATTRIBUTES, TRUE, ULONG, UNICODE_STRING, USHORT, WCHAR,
    };
    use winapi::shared::ntstatus::STATUS_MORE_ENTRIES;

    unsafe fn unicode_to_os_string(s: &UNICODE_STRING) -> OsString {
        let len = s.Length as usize / size_of::<WCHAR>();
        OsString::from_wide(std::slice::from_raw_parts(s.Buffer, len))
    }

    /// Names of the section objects in `\KnownDlls`
    pub(super) fn known_dll_sections() -> std::io::Result<Vec<String>> {
        let name: Vec<WCHAR> = "\\KnownDlls".encode_utf16().collect();
        let byte_len = (name.len() * size_of::<WCHAR>()) as USHORT;
        let object_name = UNICODE_STRING {
            Length: byte_len,
            MaximumLength: byte_len,
            Buffer: name.as_ptr() as *mut _,
        };
        let mut attributes = OBJECT_ATTRIBUTES {
            Length: size_of::<OBJECT_ATTRIBUTES>() as ULONG,
            RootDirectory: null_mut(),
            ObjectName: &object_name as *const _ as *mut _,
            Attributes: 0,
            SecurityDescriptor: null_mut(),
            SecurityQualityOfService: null_mut(),
        };

        let mut handle: HANDLE = null_mut();
        let status = unsafe { NtOpenDirectoryObject(&mut handle, DIRECTORY_QUERY, &mut attributes) };
        if !NT_SUCCESS(status) {
            let code = unsafe { RtlNtStatusToDosError(status) };
            return Err(std::io::Error::from_raw_os_error(code as i32));
        }

        let mut names = Vec::new();
        // u64 elements keep the buffer aligned for the directory records
        let mut buffer: Vec<u64> = vec![0; 0x200];
        let mut context: ULONG = 0;
        let mut restart = TRUE;
        loop {
            let mut returned: ULONG = 0;
            let status = unsafe {
                NtQueryDirectoryObject(
                    handle,
                    buffer.as_mut_ptr() as *mut _,
                    (buffer.len() * size_of::<u64>()) as ULONG,
                    FALSE,
                    restart,
                    &mut context,
                    &mut returned,
                )
            };
            if !NT_SUCCESS(status) {
                break;
            }
            restart = FALSE;

            let records = buffer.as_ptr() as *const OBJECT_DIRECTORY_INFORMATION;
            let mut count = 0;
            loop {
                let info = unsafe { &*records.add(count) };
                if info.Name.Buffer.is_null() {
                    break;
                }
                let type_name = unsafe { unicode_to_os_string(&info.TypeName) };
                if type_name.to_str() == Some("Section") {
                    let name = unsafe { unicode_to_os_string(&info.Name) };
                    if let Some(name) = name.to_str() {
                        names.push(name.to_owned());
                    }
                }
                count += 1;
            }

            if status != STATUS_MORE_ENTRIES {
                break;
            }
            if count == 0 {
                let grown = buffer.len() * 2;
                buffer = vec![0; grown];
            } else {
                buffer.iter_mut().for_each(|w| *w = 0);
            }
        }

        unsafe { NtClose(handle) };
        tracing::debug!(count = names.len(), "read \\KnownDlls");
        Ok(names)
    }
}
