//! The persisted entry tables and the generated module carrying them.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flight_core::FlightError;
use serde::{Deserialize, Serialize};

use crate::paths::normalize_path;

/// Export name of the client entries table.
pub const CLIENT_ENTRIES: &str = "clientEntries";
/// Export name of the SSR entries table.
pub const SSR_ENTRIES: &str = "ssrEntries";
/// Export name of the server entries table.
pub const SERVER_ENTRIES: &str = "serverEntries";

/// The three entry tables produced by one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMap {
    /// Render bundle file to browser asset.
    #[serde(default)]
    pub client_entries: BTreeMap<String, String>,
    /// Render bundle file to SSR asset.
    #[serde(default)]
    pub ssr_entries: BTreeMap<String, String>,
    /// Logical root name to render bundle file.
    #[serde(default)]
    pub server_entries: BTreeMap<String, String>,
}

impl EntryMap {
    /// Browser asset for a server module id.
    pub fn client_asset(&self, module_id: &str) -> Result<&str, FlightError> {
        lookup(&self.client_entries, CLIENT_ENTRIES, &normalize_path(module_id))
    }

    /// SSR asset for a server module id.
    pub fn ssr_asset(&self, module_id: &str) -> Result<&str, FlightError> {
        lookup(&self.ssr_entries, SSR_ENTRIES, &normalize_path(module_id))
    }

    /// Render bundle file of a logical root.
    pub fn server_asset(&self, root: &str) -> Result<&str, FlightError> {
        lookup(&self.server_entries, SERVER_ENTRIES, root)
    }

    /// Whether every table is empty.
    pub fn is_empty(&self) -> bool {
        self.client_entries.is_empty() && self.ssr_entries.is_empty() && self.server_entries.is_empty()
    }

    /// Render the tables as module source.
    pub fn render_module(&self) -> Result<String, FlightError> {
        let mut out = String::new();
        for (name, table) in self.tables() {
            let json = serde_json::to_string_pretty(table)
                .map_err(|e| FlightError::Decode(format!("{name}: {e}")))?;
            out.push_str(&format!("export const {name} = {json};\n"));
        }
        Ok(out)
    }

    /// Append the rendered tables to the generated module at `path`.
    pub fn append_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let module = self.render_module()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open entries artifact: {}", path.display()))?;
        file.write_all(b"\n")
            .and_then(|_| file.write_all(module.as_bytes()))
            .with_context(|| format!("Failed to write entries artifact: {}", path.display()))?;

        tracing::info!(path = %path.display(), "entry tables appended");
        Ok(())
    }

    /// Read the tables back from a generated module.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read entries artifact: {}", path.display()))?;
        Self::parse_module(&source)
            .with_context(|| format!("Failed to parse entries artifact: {}", path.display()))
    }

    /// Parse the tables out of module source.
    ///
    /// The last declaration of each table wins, so a module appended to by
    /// several builds reads as the most recent one. A missing table is empty.
    pub fn parse_module(source: &str) -> Result<Self, FlightError> {
        Ok(Self {
            client_entries: parse_table(source, CLIENT_ENTRIES)?,
            ssr_entries: parse_table(source, SSR_ENTRIES)?,
            server_entries: parse_table(source, SERVER_ENTRIES)?,
        })
    }

    fn tables(&self) -> [(&'static str, &BTreeMap<String, String>); 3] {
        [
            (CLIENT_ENTRIES, &self.client_entries),
            (SSR_ENTRIES, &self.ssr_entries),
            (SERVER_ENTRIES, &self.server_entries),
        ]
    }
}

fn lookup<'a>(
    table: &'a BTreeMap<String, String>,
    name: &str,
    key: &str,
) -> Result<&'a str, FlightError> {
    table
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| FlightError::EntryMapping {
            table: name.to_string(),
            module_id: key.to_string(),
        })
}

fn parse_table(source: &str, name: &str) -> Result<BTreeMap<String, String>, FlightError> {
    let marker = format!("export const {name} = ");
    let Some(start) = source.rfind(&marker) else {
        return Ok(BTreeMap::new());
    };

    let rest = &source[start + marker.len()..];
    let mut values = serde_json::Deserializer::from_str(rest).into_iter::<BTreeMap<String, String>>();
    match values.next() {
        Some(Ok(table)) => Ok(table),
        Some(Err(e)) => Err(FlightError::Decode(format!("{name}: {e}"))),
        None => Err(FlightError::Decode(format!("{name}: missing table body"))),
    }
}
