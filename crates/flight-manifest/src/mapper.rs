//! Correlation of three independent builds into entry tables.

use std::collections::BTreeSet;

use crate::artifact::EntryMap;
use crate::build::{BuildOutput, OutputUnit};
use crate::paths::normalize_path;

/// Table name of the top-level server entry root.
pub const ENTRY_ROOT: &str = "entry";

/// Table name of the route table root.
pub const ROUTES_ROOT: &str = "routes";

/// Source files of the two fixed logical roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRoots {
    /// Top-level server entry source.
    pub entry: String,
    /// Route table source.
    pub routes: String,
}

impl LogicalRoots {
    pub fn new(entry: impl Into<String>, routes: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            routes: routes.into(),
        }
    }

    fn iter(&self) -> [(&'static str, &str); 2] {
        [(ENTRY_ROOT, &self.entry), (ROUTES_ROOT, &self.routes)]
    }
}

/// Builds the entry tables once all three builds have finished.
///
/// Misses never fail the build: the module is left out of its table and the
/// render that later needs it fails instead.
#[derive(Debug)]
pub struct EntryMapper<'a> {
    client: &'a BuildOutput,
    ssr: &'a BuildOutput,
    server: &'a BuildOutput,
    client_boundaries: BTreeSet<String>,
    roots: Option<LogicalRoots>,
}

impl<'a> EntryMapper<'a> {
    /// Create a mapper over the client, SSR and render bundle outputs.
    pub fn new(client: &'a BuildOutput, ssr: &'a BuildOutput, server: &'a BuildOutput) -> Self {
        Self {
            client,
            ssr,
            server,
            client_boundaries: BTreeSet::new(),
            roots: None,
        }
    }

    /// Declare the source files of client-boundary components.
    pub fn with_client_boundaries<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.client_boundaries
            .extend(sources.into_iter().map(|s| normalize_path(s.as_ref())));
        self
    }

    /// Set the logical roots resolved into the server table.
    pub fn with_roots(mut self, roots: LogicalRoots) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Compute all three tables.
    pub fn map(&self) -> EntryMap {
        let mut entries = EntryMap::default();

        for (render_file, asset) in self.correlate("client", self.client) {
            entries.client_entries.insert(render_file, asset);
        }
        for (render_file, asset) in self.correlate("ssr", self.ssr) {
            entries.ssr_entries.insert(render_file, asset);
        }

        if let Some(roots) = &self.roots {
            for (name, source) in roots.iter() {
                match self.server.unit_for_facade(source) {
                    Some(unit) => {
                        entries
                            .server_entries
                            .insert(name.to_string(), normalize_path(&unit.file_name));
                    }
                    None => {
                        tracing::debug!(root = name, source, "logical root missing from render bundle");
                    }
                }
            }
        }

        tracing::info!(
            client = entries.client_entries.len(),
            ssr = entries.ssr_entries.len(),
            server = entries.server_entries.len(),
            "entry tables built"
        );
        entries
    }

    /// Pair each boundary unit of `build` with the render unit containing its source.
    fn correlate(&self, table: &'static str, build: &BuildOutput) -> Vec<(String, String)> {
        build
            .units
            .iter()
            .filter_map(|unit| {
                let source = self.boundary_source(unit)?;
                match self.server.unit_including(&source) {
                    Some(render) => Some((
                        normalize_path(&render.file_name),
                        normalize_path(&unit.file_name),
                    )),
                    None => {
                        tracing::debug!(table, source = %source, unit = %unit.name, "no render bundle unit includes module");
                        None
                    }
                }
            })
            .collect()
    }

    fn boundary_source(&self, unit: &OutputUnit) -> Option<String> {
        let facade = normalize_path(unit.facade_module_id.as_deref()?);
        self.client_boundaries.contains(&facade).then_some(facade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn builds() -> (BuildOutput, BuildOutput, BuildOutput) {
        let client = BuildOutput::new(vec![
            OutputUnit::new("Counter", "assets/Counter-1a2b.js")
                .with_facade("web/src/components/Counter.tsx")
                .with_module("web/src/components/Counter.tsx"),
            OutputUnit::new("Orphan", "assets/Orphan-9f9f.js")
                .with_facade("web/src/components/Orphan.tsx")
                .with_module("web/src/components/Orphan.tsx"),
            OutputUnit::new("vendor", "assets/vendor.js").with_module("node_modules/x/index.js"),
        ]);
        let ssr = BuildOutput::new(vec![OutputUnit::new("Counter", "ssr/Counter.mjs")
            .with_facade(r"web\src\components\Counter.tsx")
            .with_module(r"web\src\components\Counter.tsx")]);
        let server = BuildOutput::new(vec![
            OutputUnit::new("rsc0", "rsc/rsc0.mjs")
                .with_module("web/src/components/Counter.tsx")
                .with_module("web/src/pages/HomePage.tsx"),
            OutputUnit::new("entry", "rsc/entry.server.mjs").with_facade("web/src/entry.server.tsx"),
            OutputUnit::new("routes", "rsc/Routes.mjs").with_facade("web/src/Routes.tsx"),
        ]);
        (client, ssr, server)
    }

    #[test]
    fn test_module_in_all_builds_fills_every_table() {
        let (client, ssr, server) = builds();
        let map = EntryMapper::new(&client, &ssr, &server)
            .with_client_boundaries(["web/src/components/Counter.tsx"])
            .with_roots(LogicalRoots::new("web/src/entry.server.tsx", "web/src/Routes.tsx"))
            .map();

        assert_eq!(map.client_entries.get("rsc/rsc0.mjs").unwrap(), "assets/Counter-1a2b.js");
        assert_eq!(map.ssr_entries.get("rsc/rsc0.mjs").unwrap(), "ssr/Counter.mjs");
        assert_eq!(map.server_entries.get(ENTRY_ROOT).unwrap(), "rsc/entry.server.mjs");
        assert_eq!(map.server_entries.get(ROUTES_ROOT).unwrap(), "rsc/Routes.mjs");
    }

    #[test]
    fn test_module_missing_from_render_bundle_is_omitted() {
        let (client, ssr, server) = builds();
        let map = EntryMapper::new(&client, &ssr, &server)
            .with_client_boundaries([
                "web/src/components/Counter.tsx",
                "web/src/components/Orphan.tsx",
            ])
            .map();

        assert_eq!(map.client_entries.len(), 1);
        assert!(!map.client_entries.values().any(|v| v.contains("Orphan")));
        assert!(map.server_entries.is_empty());
    }

    #[test]
    fn test_undeclared_units_are_ignored() {
        let (client, ssr, server) = builds();
        let map = EntryMapper::new(&client, &ssr, &server).map();
        assert!(map.client_entries.is_empty());
        assert!(map.ssr_entries.is_empty());
    }

    #[test]
    fn test_keys_match_across_path_conventions() {
        let client = BuildOutput::new(vec![OutputUnit::new("A", r"assets\A.js")
            .with_facade(r"C:\app\src\A.tsx")]);
        let server_back = BuildOutput::new(vec![OutputUnit::new("rsc", r"rsc\\a.mjs")
            .with_module(r"C:\app\src\A.tsx")]);
        let server_fwd = BuildOutput::new(vec![OutputUnit::new("rsc", "rsc/a.mjs")
            .with_module("c:/app/src/A.tsx")]);
        let empty = BuildOutput::default();

        let back = EntryMapper::new(&client, &empty, &server_back)
            .with_client_boundaries([r"C:\app\src\A.tsx"])
            .map();
        let fwd = EntryMapper::new(&client, &empty, &server_fwd)
            .with_client_boundaries(["c:/app/src/A.tsx"])
            .map();

        assert_eq!(back.client_entries, fwd.client_entries);
        assert_eq!(fwd.client_entries.get("rsc/a.mjs").unwrap(), "assets/A.js");
    }

    #[test]
    fn test_roots_need_exact_facade_not_membership() {
        let (client, ssr, _) = builds();
        let server = BuildOutput::new(vec![
            OutputUnit::new("chunk", "rsc/chunk.mjs").with_module("web/src/Routes.tsx"),
        ]);
        let map = EntryMapper::new(&client, &ssr, &server)
            .with_roots(LogicalRoots::new("web/src/entry.server.tsx", "web/src/Routes.tsx"))
            .map();
        assert!(map.server_entries.is_empty());
    }
}
