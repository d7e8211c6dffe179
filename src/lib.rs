//! Dependency viewer for Windows PE files
//!
//! Starting from one or more binaries, the DLLs they import are located the way the
//! Windows loader would, parsed in turn, and every imported symbol is paired with
//! the export that satisfies it.

extern crate thiserror;

pub mod analysis;
pub mod common;
pub mod knowndlls;
pub mod logging;
pub mod lookup_path;
pub mod manifest;
pub mod pe;
pub mod processor;
pub mod query;
pub mod system;

pub use analysis::{Analysis, CheckReport, Dependency, FileInfo, ImportStatus, NodeId};
pub use common::{decanonicalize, path_to_string, readable_canonical_path, LookupError};
pub use knowndlls::KnownDllRegistry;
pub use lookup_path::{LookupPath, LookupPathEntry};
pub use processor::{analyze, Processor};
pub use query::LookupQuery;
pub use system::WindowsSystem;
