//! Data structures that must be filled with the input and the parameters for the DLL scan

use crate::common::LookupError;
use crate::system::WindowsSystem;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LookupTarget {
    /// Paths to the binaries whose dependencies are analysed
    pub roots: Vec<PathBuf>,
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

/// Complete description of a search task
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LookupQuery {
    pub system: Option<WindowsSystem>,
    pub target: LookupTarget,
}

impl LookupQuery {
    /// Build a query for the given roots
    ///
    /// The working directory will be set to the one containing the first root
    pub fn new(system: Option<WindowsSystem>, roots: Vec<PathBuf>) -> Result<Self, LookupError> {
        let first = roots.first().ok_or_else(|| {
            LookupError::ContextDeductionError("No executable given".to_owned())
        })?;
        let working_dir = first
            .parent()
            .ok_or_else(|| {
                LookupError::ContextDeductionError(format!(
                    "Could not find application directory for given executable {}",
                    first.display()
                ))
            })?
            .to_owned();
        Ok(Self {
            system,
            target: LookupTarget {
                roots,
                working_dir,
                user_path: Vec::new(),
            },
        })
    }

    /// autodetects the settings with sensible defaults
    ///
    /// On Windows the host system is described; elsewhere, the Windows partition the first
    /// root lies in, if any
    pub fn deduce_from_executable_locations<P: AsRef<Path>>(
        roots: &[P],
    ) -> Result<Self, LookupError> {
        let roots: Vec<PathBuf> = roots.iter().map(|p| p.as_ref().to_owned()).collect();

        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = roots.first().and_then(WindowsSystem::from_exe_location);

        Self::new(system, roots)
    }

    pub fn known_dlls(&self) -> Option<&crate::knowndlls::KnownDllRegistry> {
        self.system.as_ref().and_then(|s| s.known_dlls.as_ref())
    }
}
