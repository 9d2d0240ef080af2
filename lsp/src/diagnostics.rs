//! Per-file diagnostics published by every running server.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::types::{Diagnostic, DiagnosticsSnapshot};

/// Latest diagnostics for each file, tracked per publishing server so one
/// server re-publishing never clobbers another's results.
#[derive(Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<PathBuf, BTreeMap<String, Vec<Diagnostic>>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `server`'s diagnostics for `path`. An empty list clears them.
    pub fn update(&mut self, server: &str, path: PathBuf, items: Vec<Diagnostic>) {
        if items.is_empty() {
            if let Some(by_server) = self.data.get_mut(&path) {
                by_server.remove(server);
                if by_server.is_empty() {
                    self.data.remove(&path);
                }
            }
            return;
        }
        self.data
            .entry(path)
            .or_default()
            .insert(server.to_string(), items);
    }

    /// Drop everything `server` published; its results are stale once it stops.
    pub fn clear_server(&mut self, server: &str) {
        self.data.retain(|_, by_server| {
            by_server.remove(server);
            !by_server.is_empty()
        });
    }

    /// Merged diagnostics for `path`, most severe first, then by position.
    pub fn for_file(&self, path: &Path) -> Vec<Diagnostic> {
        let mut items: Vec<Diagnostic> = self
            .data
            .get(path)
            .map(|by_server| by_server.values().flatten().cloned().collect())
            .unwrap_or_default();
        items.sort_by_key(|d| (d.severity(), d.line(), d.col()));
        items
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .data
            .keys()
            .map(|path| (path.clone(), self.for_file(path)))
            .collect();

        // Files with errors first, then alphabetically
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }

    pub fn errors_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        paths
            .iter()
            .filter_map(|path| {
                let errors: Vec<Diagnostic> = self
                    .for_file(path)
                    .into_iter()
                    .filter(|d| d.severity().is_error())
                    .collect();
                (!errors.is_empty()).then(|| (path.clone(), errors))
            })
            .collect()
    }
}
