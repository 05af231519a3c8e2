//! Build-time entry mapping.
//!
//! After the client, SSR and render bundles are built, this crate correlates
//! their outputs so module references produced while rendering can be turned
//! into loadable assets:
//! - `EntryMapper` - Correlates the three builds
//! - `EntryMap` - The three tables, persisted into a generated module
//! - `normalize_path` - Separator-independent map keys

mod artifact;
mod build;
mod mapper;
mod paths;

pub use artifact::*;
pub use build::*;
pub use mapper::*;
pub use paths::*;
