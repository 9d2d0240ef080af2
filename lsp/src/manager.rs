//! Host-side owner of every session.
//!
//! The manager routes documents to servers by glob pattern, starts a session
//! the first time a matching document opens, keeps the server's view of each
//! document in sync, and turns session events into diagnostics. It is driven
//! by [`LspManager::tick`] from the host's loop, like the sessions it owns.
//!
//! Positions are 1-based on this API.

use std::cell::Cell;
use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;

use crate::capabilities::{ServerCapabilities, TextDocumentSyncKind};
use crate::diagnostics::DiagnosticsStore;
use crate::protocol::{self, Response};
use crate::queue::RequestOptions;
use crate::session::{NotificationOptions, Session};
use crate::transport::{ProcessTransport, Transport};
use crate::types::{
    ConfigError, Diagnostic, DiagnosticsSnapshot, DocumentEdit, HostPosition, LspConfig, LspEvent,
    ServerConfig, ServerStopReason,
};

/// Creates the transport for a new session: `(server name, config, workspace root)`.
pub type Launcher = Box<dyn FnMut(&str, &ServerConfig, &Path) -> anyhow::Result<Box<dyn Transport>>>;

const CLIENT_NAME: &str = "relay";

struct Route {
    server: String,
    language_id: String,
    patterns: GlobSet,
}

impl Route {
    fn matches(&self, path: &Path, language_id: Option<&str>) -> bool {
        if language_id.is_some_and(|id| id == self.language_id) {
            return true;
        }
        self.patterns.is_match(path)
            || path
                .file_name()
                .is_some_and(|name| self.patterns.is_match(name))
    }
}

/// Build routes sorted by server name so overlapping patterns resolve
/// deterministically.
fn build_routes(config: &LspConfig) -> Result<Vec<Route>, ConfigError> {
    let mut names: Vec<&String> = config.servers().keys().collect();
    names.sort();

    let mut routes = Vec::with_capacity(names.len());
    for name in names {
        let server_config = &config.servers()[name];
        if server_config.command().trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                server: name.clone(),
            });
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in server_config.file_patterns() {
            let glob = Glob::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                server: name.clone(),
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let patterns = builder.build().map_err(|source| ConfigError::InvalidPattern {
            server: name.clone(),
            pattern: server_config.file_patterns().join(","),
            source,
        })?;
        routes.push(Route {
            server: name.clone(),
            language_id: server_config.language_id().to_string(),
            patterns,
        });
    }
    Ok(routes)
}

/// Nearest ancestor of `path` holding one of `markers`, else `fallback`.
fn find_root(path: &Path, markers: &[String], fallback: &Path) -> PathBuf {
    if !markers.is_empty() {
        for dir in path.ancestors().skip(1) {
            if markers.iter().any(|marker| dir.join(marker).exists()) {
                return dir.to_path_buf();
            }
        }
    }
    fallback.to_path_buf()
}

/// The server's view of an open document.
struct OpenDocument {
    server: String,
    language_id: String,
    version: i32,
    text: String,
    sync: PendingSync,
}

/// Changes recorded for a document but not yet accepted by its session.
///
/// Pushes can be refused by the hitrate ceiling, so nothing is forgotten
/// until the session takes it; refused changes are retried on every tick.
#[derive(Default)]
struct PendingSync {
    /// Incremental edits since the last accepted `didChange`, in order.
    edits: Vec<DocumentEdit>,
    /// The next `didChange` must carry the whole text.
    full_text: bool,
    dirty: bool,
    /// Set while an accepted `didChange` waits to be written.
    in_flight: Rc<Cell<bool>>,
}

impl PendingSync {
    fn record(&mut self, edits: &[DocumentEdit]) {
        if edits.is_empty() {
            self.full_text = true;
            self.edits.clear();
        } else if !self.full_text {
            self.edits.extend_from_slice(edits);
        }
        self.dirty = true;
    }

    fn accepted(&mut self) {
        self.in_flight.set(true);
        self.edits.clear();
        self.full_text = false;
        self.dirty = false;
    }
}

pub struct LspManager {
    config: LspConfig,
    routes: Vec<Route>,
    /// Running sessions by server name; absence means not running.
    sessions: HashMap<String, Session>,
    documents: HashMap<PathBuf, OpenDocument>,
    diagnostics: DiagnosticsStore,
    last_restart: HashMap<String, Instant>,
    workspace_root: PathBuf,
    launcher: Launcher,
}

impl LspManager {
    /// Build a manager that spawns real server processes.
    ///
    /// Must be used inside a tokio runtime; see [`ProcessTransport`].
    pub fn new(config: LspConfig, workspace_root: &Path) -> Result<Self, ConfigError> {
        let launcher: Launcher = Box::new(|_name: &str, server_config: &ServerConfig, root: &Path| {
            let transport = ProcessTransport::spawn(server_config, root)?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        });
        Self::with_launcher(config, workspace_root, launcher)
    }

    pub fn with_launcher(
        config: LspConfig,
        workspace_root: &Path,
        launcher: Launcher,
    ) -> Result<Self, ConfigError> {
        let routes = build_routes(&config)?;
        Ok(Self {
            config,
            routes,
            sessions: HashMap::new(),
            documents: HashMap::new(),
            diagnostics: DiagnosticsStore::new(),
            last_restart: HashMap::new(),
            workspace_root: workspace_root.to_path_buf(),
            launcher,
        })
    }

    /// Server that handles `path`, if any.
    #[must_use]
    pub fn server_for(&self, path: &Path, language_id: Option<&str>) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.matches(path, language_id))
            .map(|route| route.server.as_str())
    }

    #[must_use]
    pub fn session(&self, server: &str) -> Option<&Session> {
        self.sessions.get(server)
    }

    #[must_use]
    pub fn has_running_servers(&self) -> bool {
        !self.sessions.is_empty()
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.documents.contains_key(path)
    }

    fn start_session(&mut self, server: &str, root: &Path) -> bool {
        let Some(server_config) = self.config.servers().get(server).cloned() else {
            return false;
        };
        tracing::info!(
            "Starting LSP server '{server}' ({}) in {}",
            server_config.command(),
            root.display()
        );
        let transport = match (self.launcher)(server, &server_config, root) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Failed to start LSP server '{server}': {e:#}");
                return false;
            }
        };

        let mut session = Session::new(server, server_config, self.config.session.clone());
        session.start(transport);
        if let Err(e) = session.initialize(root, CLIENT_NAME, env!("CARGO_PKG_VERSION")) {
            tracing::warn!("Failed to initialize LSP server '{server}': {e}");
            session.exit();
            return false;
        }
        self.sessions.insert(server.to_string(), session);
        true
    }

    /// Register an opened document and send `didOpen`, starting its server if
    /// needed. Returns the handling server's name.
    pub fn open_document(
        &mut self,
        path: &Path,
        language_id: Option<&str>,
        text: &str,
    ) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        if let Some(doc) = self.documents.get(path) {
            let server = doc.server.clone();
            self.change_document(path, text, &[]);
            return Some(server);
        }
        let server = self.server_for(path, language_id)?.to_string();
        let server_config = &self.config.servers()[&server];
        let language_id = language_id
            .unwrap_or_else(|| server_config.language_id())
            .to_string();

        if !self.sessions.contains_key(&server) {
            let root = find_root(path, &server_config.root_markers, &self.workspace_root);
            if !self.start_session(&server, &root) {
                return None;
            }
            // Documents left over from a server that could not be restarted.
            self.reopen_documents(&server);
        }

        let doc = OpenDocument {
            server: server.clone(),
            language_id,
            version: 1,
            text: text.to_string(),
            sync: PendingSync::default(),
        };
        self.send_did_open(path, &doc);
        self.documents.insert(path.to_path_buf(), doc);
        Some(server)
    }

    fn send_did_open(&mut self, path: &Path, doc: &OpenDocument) {
        let Some(uri) = file_uri(path) else { return };
        let Some(session) = self.sessions.get_mut(&doc.server) else {
            return;
        };
        session.cancel_quit();
        session.push_notification(
            "textDocument/didOpen",
            Some(protocol::did_open_params(
                &uri,
                &doc.language_id,
                doc.version,
                &doc.text,
            )),
            NotificationOptions::default(),
        );
    }

    /// Record new contents for an open document and sync the server.
    ///
    /// `edits` describe the change incrementally; they are used when the
    /// server negotiated incremental sync. With no edits the whole text is
    /// sent. Changes the session refuses stay pending and are retried from
    /// [`LspManager::tick`].
    pub fn change_document(&mut self, path: &Path, text: &str, edits: &[DocumentEdit]) {
        let Some(doc) = self.documents.get_mut(path) else {
            tracing::debug!("change for unopened document {}", path.display());
            return;
        };
        doc.version += 1;
        doc.text = text.to_string();
        doc.sync.record(edits);
        self.flush_changes(path);
    }

    /// Hand a document's pending changes to its session as one `didChange`.
    fn flush_changes(&mut self, path: &Path) {
        let Some(doc) = self.documents.get_mut(path) else {
            return;
        };
        if !doc.sync.dirty {
            return;
        }
        let Some(session) = self.sessions.get_mut(&doc.server) else {
            return;
        };
        let Some(uri) = file_uri(path) else { return };
        // Until capabilities arrive the whole text is the safe choice.
        let sync = session
            .capabilities()
            .map_or(TextDocumentSyncKind::Full, ServerCapabilities::sync_kind);

        let params = match sync {
            TextDocumentSyncKind::None => {
                doc.sync = PendingSync::default();
                return;
            }
            // A newer full text supersedes anything still queued.
            TextDocumentSyncKind::Full => {
                protocol::did_change_full_params(&uri, doc.version, &doc.text)
            }
            // Edits apply on top of the last accepted change, so wait for it
            // to be written before sending the next batch.
            TextDocumentSyncKind::Incremental if doc.sync.in_flight.get() => return,
            TextDocumentSyncKind::Incremental if doc.sync.full_text => {
                protocol::did_change_full_params(&uri, doc.version, &doc.text)
            }
            TextDocumentSyncKind::Incremental => {
                protocol::did_change_incremental_params(&uri, doc.version, &doc.sync.edits)
            }
        };

        let in_flight = doc.sync.in_flight.clone();
        let opts = NotificationOptions {
            on_sent: Some(Box::new(move |_: &mut Session| in_flight.set(false))),
            ..NotificationOptions::overwrite_key(uri)
        };
        if session.push_notification("textDocument/didChange", Some(params), opts) {
            doc.sync.accepted();
        } else {
            tracing::debug!(
                server = %doc.server,
                path = %path.display(),
                version = doc.version,
                "didChange deferred"
            );
        }
    }

    pub fn save_document(&mut self, path: &Path) {
        self.flush_changes(path);
        let Some(doc) = self.documents.get(path) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&doc.server) else {
            return;
        };
        let Some(uri) = file_uri(path) else { return };
        let (wants_save, include_text) = match session.capabilities() {
            Some(caps) => (
                caps.text_document_sync.save.is_some(),
                caps.save_includes_text(),
            ),
            None => (true, false),
        };
        if !wants_save {
            return;
        }
        let text = include_text.then_some(doc.text.as_str());
        session.push_notification(
            "textDocument/didSave",
            Some(protocol::did_save_params(&uri, text)),
            NotificationOptions::default(),
        );
    }

    /// Forget a document. When its server has no open document left, the
    /// server is scheduled to quit after the idle timeout.
    pub fn close_document(&mut self, path: &Path) {
        let Some(doc) = self.documents.remove(path) else {
            return;
        };
        let still_open = self.documents.values().any(|d| d.server == doc.server);
        let idle_after = self.config.session.idle_shutdown();
        let Some(session) = self.sessions.get_mut(&doc.server) else {
            return;
        };
        if let Some(uri) = file_uri(path) {
            session.push_notification(
                "textDocument/didClose",
                Some(protocol::text_document_params(&uri)),
                NotificationOptions::default(),
            );
        }
        if !still_open {
            tracing::debug!(server = %doc.server, "no open documents, scheduling idle shutdown");
            session.schedule_quit(Instant::now() + idle_after);
        }
    }

    /// Push a feature request for `path` to its server when the server
    /// advertises `supported`.
    fn feature_request(
        &mut self,
        path: &Path,
        method: &str,
        supported: impl FnOnce(&ServerCapabilities) -> bool,
        params: impl FnOnce(&str) -> Value,
        callback: impl FnOnce(Response) + 'static,
        opts: RequestOptions,
    ) -> Option<u64> {
        let server = self.documents.get(path)?.server.clone();
        let session = self.sessions.get_mut(&server)?;
        if !session.capabilities().is_some_and(supported) {
            tracing::debug!(server = %server, method, "server does not support request");
            return None;
        }
        let uri = file_uri(path)?;
        session.push_request(
            method,
            Some(params(&uri)),
            move |_: &mut Session, response: Response| callback(response),
            opts,
        )
    }

    pub fn completion(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/completion",
            |caps| caps.completion_provider.is_some(),
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::overwrite(),
        )
    }

    /// Resolve a completion item previously returned for `path`.
    pub fn resolve_completion(
        &mut self,
        path: &Path,
        item: Value,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "completionItem/resolve",
            |caps| {
                caps.completion_provider
                    .as_ref()
                    .is_some_and(|c| c.resolve_provider)
            },
            |_| item,
            callback,
            RequestOptions::default(),
        )
    }

    pub fn hover(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/hover",
            |caps| caps.hover_provider,
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::overwrite(),
        )
    }

    pub fn signature_help(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/signatureHelp",
            |caps| caps.signature_help_provider.is_some(),
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::overwrite(),
        )
    }

    pub fn document_symbols(
        &mut self,
        path: &Path,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/documentSymbol",
            |caps| caps.document_symbol_provider,
            protocol::text_document_params,
            callback,
            RequestOptions::default(),
        )
    }

    pub fn definition(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/definition",
            |caps| caps.definition_provider,
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn type_definition(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/typeDefinition",
            |caps| caps.type_definition_provider,
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn implementation(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/implementation",
            |caps| caps.implementation_provider,
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn declaration(
        &mut self,
        path: &Path,
        pos: HostPosition,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/declaration",
            |caps| caps.declaration_provider,
            |uri| protocol::position_params(uri, pos),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn references(
        &mut self,
        path: &Path,
        pos: HostPosition,
        include_declaration: bool,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/references",
            |caps| caps.references_provider,
            |uri| protocol::references_params(uri, pos, include_declaration),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn rename(
        &mut self,
        path: &Path,
        pos: HostPosition,
        new_name: &str,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/rename",
            |caps| caps.rename_provider.is_some(),
            |uri| protocol::rename_params(uri, pos, new_name),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn formatting(
        &mut self,
        path: &Path,
        tab_size: u32,
        insert_spaces: bool,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/formatting",
            |caps| caps.document_formatting_provider,
            |uri| protocol::formatting_params(uri, tab_size, insert_spaces),
            callback,
            RequestOptions::default(),
        )
    }

    pub fn range_formatting(
        &mut self,
        path: &Path,
        start: HostPosition,
        end: HostPosition,
        tab_size: u32,
        insert_spaces: bool,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "textDocument/rangeFormatting",
            |caps| caps.document_range_formatting_provider,
            |uri| protocol::range_formatting_params(uri, start, end, tab_size, insert_spaces),
            callback,
            RequestOptions::default(),
        )
    }

    /// Workspace-wide symbol search on the server handling `path`.
    pub fn workspace_symbols(
        &mut self,
        path: &Path,
        query: &str,
        callback: impl FnOnce(Response) + 'static,
    ) -> Option<u64> {
        self.feature_request(
            path,
            "workspace/symbol",
            |caps| caps.workspace_symbol_provider,
            |_| protocol::workspace_symbol_params(query),
            callback,
            RequestOptions::default(),
        )
    }

    /// Tick every session and act on what they emitted. Returns the number
    /// of events handled.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut events = Vec::new();
        for session in self.sessions.values_mut() {
            session.tick_at(now);
            events.extend(session.take_events());
        }
        let count = events.len();
        for event in events {
            self.handle_event(event, now);
        }

        let pending: Vec<PathBuf> = self
            .documents
            .iter()
            .filter(|(_, doc)| doc.sync.dirty)
            .map(|(path, _)| path.clone())
            .collect();
        for path in pending {
            self.flush_changes(&path);
        }

        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.quit_due(now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in idle {
            if let Some(mut session) = self.sessions.remove(&name) {
                tracing::info!("Stopping idle LSP server '{name}'");
                session.exit();
                self.diagnostics.clear_server(&name);
            }
        }
        count
    }

    fn handle_event(&mut self, event: LspEvent, now: Instant) {
        match event {
            LspEvent::Initialized { server } => {
                tracing::debug!(server = %server, "LSP server initialized");
            }
            LspEvent::Diagnostics {
                server,
                path,
                items,
            } => {
                tracing::debug!(
                    path = %path.display(),
                    count = items.len(),
                    "Diagnostics updated"
                );
                self.diagnostics.update(&server, path, items);
            }
            LspEvent::ServerStopped { server, reason } => {
                match &reason {
                    ServerStopReason::Exited => {
                        tracing::info!(server = %server, "LSP server exited");
                    }
                    other => {
                        tracing::warn!(server = %server, reason = %other, "LSP server failed");
                    }
                }
                if let Some(mut session) = self.sessions.remove(&server) {
                    session.exit();
                }
                self.diagnostics.clear_server(&server);
                self.maybe_restart(&server, now);
            }
        }
    }

    /// Restart `server` when documents still need it and it did not restart recently.
    fn maybe_restart(&mut self, server: &str, now: Instant) {
        let Some(first) = self
            .documents
            .iter()
            .find(|(_, doc)| doc.server == server)
            .map(|(path, _)| path.clone())
        else {
            return;
        };
        let min_interval = self.config.session.restart_min_interval();
        if let Some(last) = self.last_restart.get(server)
            && now.saturating_duration_since(*last) < min_interval
        {
            tracing::warn!(server, "LSP server stopped again too soon, not restarting");
            return;
        }

        let Some(server_config) = self.config.servers().get(server) else {
            return;
        };
        let root = find_root(&first, &server_config.root_markers, &self.workspace_root);
        self.last_restart.insert(server.to_string(), now);
        if self.start_session(server, &root) {
            self.reopen_documents(server);
        }
    }

    /// Send `didOpen` with the current text for every document of `server`.
    fn reopen_documents(&mut self, server: &str) {
        let paths: Vec<PathBuf> = self
            .documents
            .iter()
            .filter(|(_, doc)| doc.server == server)
            .map(|(path, _)| path.clone())
            .collect();
        for path in paths {
            if let Some(mut doc) = self.documents.remove(&path) {
                // didOpen carries the full text; earlier changes are moot.
                doc.sync = PendingSync::default();
                self.send_did_open(&path, &doc);
                self.documents.insert(path, doc);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Diagnostics for one file, most severe first.
    #[must_use]
    pub fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.diagnostics.for_file(path)
    }

    #[must_use]
    pub fn errors_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        self.diagnostics.errors_for_files(paths)
    }

    /// Exit every session.
    pub fn shutdown(&mut self) {
        let sessions = mem::take(&mut self.sessions);
        for (name, mut session) in sessions {
            tracing::info!("Shutting down LSP server '{name}'...");
            session.exit();
        }
    }
}

fn file_uri(path: &Path) -> Option<String> {
    match protocol::path_to_file_uri(path) {
        Ok(uri) => Some(uri.to_string()),
        Err(e) => {
            tracing::warn!("Skipping LSP message: {e}");
            None
        }
    }
}
