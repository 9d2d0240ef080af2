//! Session engine: owns one language server and drives it tick by tick.
//!
//! A [`Session`] never blocks and never spawns work of its own. The host calls
//! [`Session::tick`] once per scheduling pass; each tick reads what the server
//! produced, dispatches complete frames, expires unanswered requests and
//! writes at most one notification, one request and one raw chunk.
//!
//! ```text
//! Stopped -> Starting -> AwaitingInit -> Ready -> Degraded
//!    ^                                     |         |
//!    +------------------ exit() -----------+---------+
//! ```

mod dispatch;
#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::capabilities::ServerCapabilities;
use crate::codec::{Framer, encode_frame};
use crate::hitrate::{HitCategory, HitrateLimiter};
use crate::protocol::{
    self, NotificationFrame, PathToUriError, RequestFrame, RequestId, Response, ResponseError,
};
use crate::queue::{
    NotificationQueue, OutboundBody, PendingRequest, QueuedNotification, RawPayload, RawQueue,
    RequestOptions, RequestQueue, SentCallback,
};
use crate::transport::Transport;
use crate::types::{LspEvent, ServerConfig, ServerStopReason, SessionSettings};

pub use dispatch::{EventListener, MessageListener, RequestListener};
use dispatch::Listeners;

/// The `initialize` request always carries this id.
pub const INIT_REQUEST_ID: u64 = 1;

const STDERR_BUDGET_BYTES: usize = 16 * 1024;

const EXIT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    /// Transport attached; `initialize` not yet queued.
    Starting,
    /// Only the `initialize` request may reach the wire.
    AwaitingInit,
    Ready,
    /// Failed; queues cleared and the host has been signalled.
    Degraded,
}

impl SessionState {
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::AwaitingInit | Self::Ready)
    }
}

/// Options for [`Session::push_notification`].
#[derive(Default)]
pub struct NotificationOptions {
    /// Replace an unsent notification with the same key instead of appending.
    pub overwrite: bool,
    /// Overwrite key; the method when unset.
    pub key: Option<String>,
    /// Fired once the notification is fully written.
    pub on_sent: Option<SentCallback>,
}

impl NotificationOptions {
    #[must_use]
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Self::default()
        }
    }

    /// Overwrite only unsent notifications pushed under the same `key`.
    #[must_use]
    pub fn overwrite_key(key: impl Into<String>) -> Self {
        Self {
            overwrite: true,
            key: Some(key.into()),
            on_sent: None,
        }
    }
}

/// Remainder of a frame the transport only partly accepted.
struct PartialWrite {
    bytes: Vec<u8>,
    offset: usize,
    on_done: Option<SentCallback>,
}

enum WriteOutcome {
    Complete,
    Partial,
    /// Nothing was written; the callback is handed back for a retry.
    Failed(Option<SentCallback>),
}

pub struct Session {
    name: String,
    config: ServerConfig,
    settings: SessionSettings,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    capabilities: Option<ServerCapabilities>,
    next_id: u64,
    write_failures: u32,
    hitrate: HitrateLimiter,
    notifications: NotificationQueue,
    requests: RequestQueue,
    raw: RawQueue,
    partial: Option<PartialWrite>,
    /// `initialize` answered; `initialized` not yet fully written.
    initialized_pending: bool,
    listeners: Listeners,
    framer: Framer,
    events: VecDeque<LspEvent>,
    quit_at: Option<Instant>,
}

impl Session {
    #[must_use]
    pub fn new(name: impl Into<String>, config: ServerConfig, settings: SessionSettings) -> Self {
        let hitrate = HitrateLimiter::new(settings.hitrate_ceiling);
        Self {
            name: name.into(),
            config,
            settings,
            state: SessionState::Stopped,
            transport: None,
            capabilities: None,
            next_id: INIT_REQUEST_ID + 1,
            write_failures: 0,
            hitrate,
            notifications: NotificationQueue::default(),
            requests: RequestQueue::default(),
            raw: RawQueue::default(),
            partial: None,
            initialized_pending: false,
            listeners: Listeners::default(),
            framer: Framer::new(),
            events: VecDeque::new(),
            quit_at: None,
        }
    }

    /// Attach a transport: Stopped → Starting.
    pub fn start(&mut self, transport: Box<dyn Transport>) {
        if self.state != SessionState::Stopped {
            tracing::warn!(server = %self.name, state = ?self.state, "start ignored");
            return;
        }
        self.transport = Some(transport);
        self.state = SessionState::Starting;
        tracing::debug!(server = %self.name, "session starting");
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Normalized capabilities; `None` until `initialize` succeeds.
    #[must_use]
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.as_ref()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn queued_notifications(&self) -> usize {
        self.notifications.len()
    }

    /// Queued (unsent) notifications for `method`.
    #[must_use]
    pub fn queued_for(&self, method: &str) -> usize {
        self.notifications.count_method(method) + self.requests.unsent_count(method)
    }

    #[must_use]
    pub fn queued_raw(&self) -> usize {
        self.raw.len()
    }

    /// Take every event emitted since the last call.
    pub fn take_events(&mut self) -> Vec<LspEvent> {
        self.events.drain(..).collect()
    }

    pub fn schedule_quit(&mut self, at: Instant) {
        self.quit_at = Some(at);
    }

    pub fn cancel_quit(&mut self) {
        self.quit_at = None;
    }

    #[must_use]
    pub fn quit_due(&self, now: Instant) -> bool {
        self.quit_at.is_some_and(|at| now >= at)
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Queue the `initialize` handshake ahead of everything else.
    pub fn initialize(
        &mut self,
        workspace_root: &Path,
        client_name: &str,
        client_version: &str,
    ) -> Result<(), PathToUriError> {
        if self.state != SessionState::Starting {
            tracing::warn!(server = %self.name, state = ?self.state, "initialize ignored");
            return Ok(());
        }
        let root_uri = protocol::path_to_file_uri(workspace_root)?;
        let workspace_name = workspace_root
            .file_name()
            .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().into_owned());
        let params = protocol::initialize_params(
            root_uri.as_str(),
            &workspace_name,
            client_name,
            client_version,
            self.config.initialization_options.as_ref(),
        );

        self.requests.push_front(PendingRequest {
            id: INIT_REQUEST_ID,
            method: "initialize".to_string(),
            params: Some(params),
            callback: Some(Box::new(|session: &mut Session, response: Response| {
                session.finish_initialize(response);
            })),
            on_overwritten: None,
            timeout: self.settings.init_resend_interval(),
            on_timeout: Some(Box::new(|session: &mut Session| {
                session.degrade(ServerStopReason::InitFailed(
                    "no response to initialize".to_string(),
                ));
            })),
            next_retry: None,
            times_sent: 0,
            max_sends: self.settings.init_max_sends.max(1),
            overwritten: false,
            replaceable: false,
        });
        self.state = SessionState::AwaitingInit;
        tracing::debug!(server = %self.name, root = %root_uri, "initialize queued");
        Ok(())
    }

    fn finish_initialize(&mut self, response: Response) {
        match response {
            Ok(result) => {
                if self.capabilities.is_none() {
                    let raw = result.get("capabilities").unwrap_or(&Value::Null);
                    self.capabilities = Some(ServerCapabilities::normalize(raw));
                }
                self.initialized_pending = true;
            }
            Err(error) => {
                self.degrade(ServerStopReason::InitFailed(error.message));
            }
        }
    }

    fn enter_ready(&mut self) {
        self.initialized_pending = false;
        self.state = SessionState::Ready;
        tracing::info!(server = %self.name, "LSP server ready");
        self.emit(LspEvent::Initialized {
            server: self.name.clone(),
        });
    }

    fn accepts_pushes(&self, what: &str) -> bool {
        if self.state.is_live() {
            return true;
        }
        tracing::debug!(server = %self.name, state = ?self.state, "dropping {what} push");
        false
    }

    /// Queue a notification. Returns `false` when it was dropped.
    ///
    /// Delivery is best-effort: the hitrate ceiling silently drops excess
    /// non-whitelisted traffic.
    pub fn push_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
        opts: NotificationOptions,
    ) -> bool {
        if !self.accepts_pushes(method) {
            return false;
        }
        if !self
            .hitrate
            .allow(HitCategory::Request, method, Instant::now())
        {
            tracing::trace!(server = %self.name, method, "hitrate ceiling reached");
            return false;
        }
        self.notifications.push(QueuedNotification {
            key: opts
                .overwrite
                .then(|| opts.key.unwrap_or_else(|| method.to_string())),
            body: OutboundBody::Notification {
                method: method.to_string(),
                params,
            },
            callback: opts.on_sent,
        });
        true
    }

    /// Queue a request. Returns its id, or `None` when it was dropped.
    ///
    /// An overwrite that lands on an unsent request reuses that request's id.
    pub fn push_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        callback: impl FnOnce(&mut Session, Response) + 'static,
        opts: RequestOptions,
    ) -> Option<u64> {
        if !self.accepts_pushes(method) {
            return None;
        }
        if !self
            .hitrate
            .allow(HitCategory::Request, method, Instant::now())
        {
            tracing::trace!(server = %self.name, method, "hitrate ceiling reached");
            return None;
        }

        let request = PendingRequest {
            id: 0,
            method: method.to_string(),
            params,
            callback: Some(Box::new(callback)),
            on_overwritten: opts.on_overwritten,
            timeout: opts
                .timeout
                .unwrap_or_else(|| self.settings.resend_interval()),
            on_timeout: opts.on_timeout,
            next_retry: None,
            times_sent: 0,
            max_sends: 2,
            overwritten: false,
            replaceable: opts.overwrite,
        };

        let mut request = if opts.overwrite {
            match self.requests.overwrite(request) {
                Ok(id) => return Some(id),
                Err(request) => request,
            }
        } else {
            request
        };
        request.id = self.alloc_id();
        let id = request.id;
        self.requests.push(request);
        Some(id)
    }

    /// Queue a pre-serialized JSON-RPC body, written in chunks when idle.
    pub fn push_raw(
        &mut self,
        name: &str,
        body: Vec<u8>,
        callback: Option<SentCallback>,
        overwrite: bool,
    ) -> bool {
        if !self.accepts_pushes(name) {
            return false;
        }
        if !self.hitrate.allow(HitCategory::Raw, name, Instant::now()) {
            tracing::trace!(server = %self.name, name, "raw hitrate ceiling reached");
            return false;
        }
        self.raw.push(
            RawPayload {
                name: name.to_string(),
                bytes: encode_frame(&body),
                offset: 0,
                callback,
            },
            overwrite,
        );
        true
    }

    /// Answer a server-initiated request.
    ///
    /// A second answer for the same id replaces the first if it is still unsent.
    pub fn push_response(&mut self, id: RequestId, response: Response) {
        if !self.state.is_live() {
            return;
        }
        self.notifications.push(QueuedNotification {
            key: Some(format!("$/response/{id}")),
            body: OutboundBody::Response { id, response },
            callback: None,
        });
    }

    /// Advance the session using the current time.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        if !self.state.is_live() || self.transport.is_none() {
            return;
        }

        self.drain_stderr();
        self.read_inbound();
        if !self.state.is_live() {
            return;
        }
        if !self.transport.as_mut().is_some_and(|t| t.running()) {
            tracing::warn!(server = %self.name, "LSP server process is gone");
            self.degrade(ServerStopReason::Exited);
            return;
        }

        self.expire_requests(now);
        if !self.state.is_live() || !self.flush_partial() {
            return;
        }

        match self.state {
            SessionState::AwaitingInit => {
                if self.initialized_pending {
                    self.send_initialized();
                } else {
                    self.send_next_request(now, true);
                }
            }
            SessionState::Ready => {
                if self.raw.in_progress() {
                    self.send_raw_chunk();
                    return;
                }
                let failures = self.write_failures;
                let mut wrote = self.send_next_notification();
                if self.blocked_since(failures) {
                    return;
                }
                let failures = self.write_failures;
                wrote |= self.send_next_request(now, false);
                if !wrote && !self.blocked_since(failures) {
                    self.send_raw_chunk();
                }
            }
            SessionState::Starting | SessionState::Stopped | SessionState::Degraded => {}
        }
    }

    /// Nothing more may be written this tick: a frame is half-written, the
    /// session went down, or a write failed after `failures` was sampled.
    fn blocked_since(&self, failures: u32) -> bool {
        self.partial.is_some() || !self.state.is_live() || self.write_failures > failures
    }

    fn drain_stderr(&mut self) {
        let Some(bytes) = self
            .transport
            .as_mut()
            .and_then(|t| t.read_stderr(STDERR_BUDGET_BYTES))
        else {
            return;
        };
        for line in String::from_utf8_lossy(&bytes).lines() {
            let line = line.trim_end();
            if !line.is_empty() {
                tracing::debug!(server = %self.name, "stderr: {line}");
            }
        }
    }

    fn read_inbound(&mut self) {
        let budget = self.settings.read_budget_bytes.max(1);
        if let Some(bytes) = self.transport.as_mut().and_then(|t| t.read_stdout(budget)) {
            self.framer.feed(&bytes);
        }

        loop {
            match self.framer.next_frame() {
                Ok(Some(body)) => self.handle_frame(&body),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(server = %self.name, "LSP framing error: {e}");
                    self.degrade(ServerStopReason::Protocol(e.to_string()));
                    return;
                }
            }
            if !self.state.is_live() {
                return;
            }
        }
    }

    fn expire_requests(&mut self, now: Instant) {
        for request in self.requests.expire(now) {
            if request.overwritten {
                tracing::trace!(server = %self.name, id = request.id, "superseded request retired");
                continue;
            }
            tracing::debug!(
                server = %self.name,
                id = request.id,
                method = %request.method,
                sends = request.times_sent,
                "request timed out"
            );
            if let Some(on_timeout) = request.on_timeout {
                on_timeout(self);
            }
            if !self.state.is_live() {
                return;
            }
        }
    }

    fn send_initialized(&mut self) {
        let params = json!({});
        let frame = NotificationFrame::new("initialized", Some(&params));
        let Some(bytes) = self.serialize(&frame) else {
            return;
        };
        let on_done: SentCallback = Box::new(Session::enter_ready);
        // A failed write leaves `initialized_pending` set; the next tick retries.
        let _ = self.write_frame(bytes, Some(on_done));
    }

    fn send_next_notification(&mut self) -> bool {
        let Some(entry) = self.notifications.pop() else {
            return false;
        };
        let bytes = match &entry.body {
            OutboundBody::Notification { method, params } => {
                self.serialize(&NotificationFrame::new(method, params.as_ref()))
            }
            OutboundBody::Response { id, response } => {
                self.serialize(&protocol::response_frame(id, response))
            }
        };
        let Some(bytes) = bytes else {
            return false;
        };

        let QueuedNotification { key, body, callback } = entry;
        match self.write_frame(bytes, callback) {
            WriteOutcome::Complete | WriteOutcome::Partial => true,
            WriteOutcome::Failed(callback) => {
                if self.state.is_live() {
                    self.notifications.push_front(QueuedNotification {
                        key,
                        body,
                        callback,
                    });
                }
                false
            }
        }
    }

    /// Write the first due request. With `init_only`, only `initialize` qualifies.
    fn send_next_request(&mut self, now: Instant, init_only: bool) -> bool {
        let Some(request) = self.requests.next_due(now) else {
            return false;
        };
        if init_only && request.id != INIT_REQUEST_ID {
            return false;
        }
        let id = request.id;
        if request.times_sent > 0 {
            tracing::debug!(server = %self.name, id, method = %request.method, "resending request");
        }
        let frame = RequestFrame::new(id, &request.method, request.params.as_ref());
        let bytes = match serde_json::to_vec(&frame) {
            Ok(bytes) => encode_frame(&bytes),
            Err(e) => {
                tracing::error!(server = %self.name, "failed to serialize request: {e}");
                self.requests.take(id);
                return false;
            }
        };

        match self.write_frame(bytes, None) {
            WriteOutcome::Complete | WriteOutcome::Partial => {
                if let Some(request) = self.requests.get_mut(id) {
                    request.times_sent += 1;
                    request.next_retry = Some(now + request.timeout);
                }
                true
            }
            WriteOutcome::Failed(_) => false,
        }
    }

    fn send_raw_chunk(&mut self) {
        let chunk = self.settings.raw_chunk_bytes.max(1);
        let (Some(transport), Some(payload)) = (self.transport.as_mut(), self.raw.front_mut())
        else {
            return;
        };
        let remaining = payload.remaining();
        let result = transport.write(&remaining[..chunk.min(remaining.len())]);
        let written = match result {
            Ok(0) => {
                self.record_write_failure("transport accepted no bytes");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                self.record_write_failure(&e.to_string());
                return;
            }
        };
        payload.offset += written;
        let done = payload.is_done();
        self.write_failures = 0;

        if done && let Some(payload) = self.raw.pop() {
            tracing::trace!(server = %self.name, name = %payload.name, "raw payload sent");
            if let Some(callback) = payload.callback {
                callback(self);
            }
        }
    }

    fn serialize<T: serde::Serialize>(&self, frame: &T) -> Option<Vec<u8>> {
        match serde_json::to_vec(frame) {
            Ok(body) => Some(encode_frame(&body)),
            Err(e) => {
                tracing::error!(server = %self.name, "failed to serialize frame: {e}");
                None
            }
        }
    }

    fn write_frame(&mut self, bytes: Vec<u8>, on_done: Option<SentCallback>) -> WriteOutcome {
        let Some(transport) = self.transport.as_mut() else {
            return WriteOutcome::Failed(on_done);
        };
        match transport.write(&bytes) {
            Ok(n) if n >= bytes.len() => {
                self.write_failures = 0;
                if let Some(on_done) = on_done {
                    on_done(self);
                }
                WriteOutcome::Complete
            }
            Ok(0) => {
                self.record_write_failure("transport accepted no bytes");
                WriteOutcome::Failed(on_done)
            }
            Ok(n) => {
                self.write_failures = 0;
                self.partial = Some(PartialWrite {
                    bytes,
                    offset: n,
                    on_done,
                });
                WriteOutcome::Partial
            }
            Err(e) => {
                self.record_write_failure(&e.to_string());
                WriteOutcome::Failed(on_done)
            }
        }
    }

    /// Continue a partially written frame. Returns `true` once nothing is pending.
    fn flush_partial(&mut self) -> bool {
        let Some(mut partial) = self.partial.take() else {
            return true;
        };
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.write(&partial.bytes[partial.offset..]) {
            Ok(0) => {
                self.partial = Some(partial);
                self.record_write_failure("transport accepted no bytes");
                false
            }
            Ok(n) => {
                self.write_failures = 0;
                partial.offset += n;
                if partial.offset < partial.bytes.len() {
                    self.partial = Some(partial);
                    return false;
                }
                if let Some(on_done) = partial.on_done {
                    on_done(self);
                }
                self.state.is_live()
            }
            Err(e) => {
                self.partial = Some(partial);
                self.record_write_failure(&e.to_string());
                false
            }
        }
    }

    fn record_write_failure(&mut self, error: &str) {
        self.write_failures += 1;
        tracing::warn!(
            server = %self.name,
            failures = self.write_failures,
            "LSP write failed: {error}"
        );
        if self.write_failures >= self.settings.write_failure_threshold {
            self.degrade(ServerStopReason::WriteFailures(self.write_failures));
        }
    }

    /// Enter Degraded: drop every queued item uninvoked and signal the host once.
    fn degrade(&mut self, reason: ServerStopReason) {
        if !self.state.is_live() {
            return;
        }
        tracing::warn!(server = %self.name, %reason, "LSP session degraded");
        self.state = SessionState::Degraded;
        self.clear_queues();
        if let Some(transport) = self.transport.as_mut() {
            transport.kill();
        }
        self.emit(LspEvent::ServerStopped {
            server: self.name.clone(),
            reason,
        });
    }

    fn clear_queues(&mut self) {
        self.notifications.clear();
        self.requests.clear();
        self.raw.clear();
        self.partial = None;
        self.initialized_pending = false;
        self.framer.reset();
    }

    /// Best-effort `shutdown` + `exit`, then release the transport with a
    /// short grace period before it is killed.
    ///
    /// Always ends in Stopped and never blocks; no response is awaited.
    pub fn exit(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        let was_live = self.state.is_live();
        if was_live && self.flush_partial() {
            let id = self.alloc_id();
            let shutdown = RequestFrame::new(id, "shutdown", None);
            let exit = NotificationFrame::new("exit", None);
            for bytes in [self.serialize(&shutdown), self.serialize(&exit)]
                .into_iter()
                .flatten()
            {
                if let Some(transport) = self.transport.as_mut()
                    && let Err(e) = transport.write(&bytes)
                {
                    tracing::debug!(server = %self.name, "exit write failed: {e}");
                }
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.close(EXIT_GRACE);
        }
        self.clear_queues();
        self.state = SessionState::Stopped;
        tracing::info!(server = %self.name, "LSP session stopped");
    }

    /// Reply to a server request with no registered listener.
    fn default_reply(method: &str, params: &Value) -> Response {
        match method {
            "workspace/configuration" => {
                let count = params
                    .get("items")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                Ok(Value::Array(vec![Value::Null; count]))
            }
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability"
            | "window/showMessageRequest" => Ok(Value::Null),
            _ => Err(ResponseError::method_not_found(method)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.kill();
        }
    }
}
