//! Outbound queues: notifications (and responses), requests, raw payloads.
//!
//! Every queue preserves FIFO order among unsent entries. An entry pushed
//! with `overwrite` replaces an unsent entry carrying the same key in place
//! instead of growing the queue.

use std::collections::VecDeque;
use std::mem;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::protocol::{RequestId, Response};
use crate::session::Session;

/// Fired once a notification or raw payload is fully written.
pub type SentCallback = Box<dyn FnOnce(&mut Session)>;
/// Receives the server's answer to a request.
pub type ResponseCallback = Box<dyn FnOnce(&mut Session, Response)>;
/// Fired when a request is dropped after exhausting its sends.
pub type TimeoutCallback = Box<dyn FnOnce(&mut Session)>;

pub(crate) enum OutboundBody {
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        response: Response,
    },
}

pub(crate) struct QueuedNotification {
    /// Overwrite key; `None` entries are never replaced.
    pub key: Option<String>,
    pub body: OutboundBody,
    pub callback: Option<SentCallback>,
}

impl QueuedNotification {
    pub fn label(&self) -> &str {
        match &self.body {
            OutboundBody::Notification { method, .. } => method,
            OutboundBody::Response { .. } => "$/response",
        }
    }
}

#[derive(Default)]
pub(crate) struct NotificationQueue {
    entries: VecDeque<QueuedNotification>,
}

impl NotificationQueue {
    pub fn push(&mut self, entry: QueuedNotification) {
        if let Some(key) = entry.key.as_deref()
            && let Some(slot) = self
                .entries
                .iter_mut()
                .find(|queued| queued.key.as_deref() == Some(key))
        {
            *slot = entry;
            return;
        }
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedNotification> {
        self.entries.pop_front()
    }

    pub fn push_front(&mut self, entry: QueuedNotification) {
        self.entries.push_front(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn count_method(&self, method: &str) -> usize {
        self.entries
            .iter()
            .filter(|queued| queued.label() == method)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Options for [`Session::push_request`].
#[derive(Default)]
pub struct RequestOptions {
    /// Replace an unsent request for the same method instead of appending.
    pub overwrite: bool,
    /// Invoked instead of the primary callback when the request was superseded.
    pub on_overwritten: Option<ResponseCallback>,
    /// Resend interval; defaults to the session's configured interval.
    pub timeout: Option<Duration>,
    pub on_timeout: Option<TimeoutCallback>,
}

impl RequestOptions {
    #[must_use]
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Self::default()
        }
    }
}

pub(crate) struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub params: Option<Value>,
    pub callback: Option<ResponseCallback>,
    pub on_overwritten: Option<ResponseCallback>,
    pub timeout: Duration,
    pub on_timeout: Option<TimeoutCallback>,
    pub next_retry: Option<Instant>,
    pub times_sent: u32,
    pub max_sends: u32,
    pub overwritten: bool,
    /// Whether this entry may be replaced by a later overwrite push.
    pub replaceable: bool,
}

impl PendingRequest {
    fn is_due(&self, now: Instant) -> bool {
        self.next_retry.is_none_or(|at| now >= at)
    }

    fn is_sent(&self) -> bool {
        self.times_sent > 0
    }

    /// Sent at least once and superseded; never resent.
    fn is_retired(&self) -> bool {
        self.overwritten && self.is_sent()
    }

    fn is_exhausted(&self, now: Instant) -> bool {
        self.is_sent() && self.is_due(now) && self.times_sent >= self.max_sends
    }

    /// Count a resend the retired entry skips, so a late response can still
    /// reach it for as long as a live request would wait.
    fn age_retired(&mut self, now: Instant) {
        if let Some(at) = self.next_retry
            && self.is_retired()
            && now >= at
            && self.times_sent < self.max_sends
        {
            self.times_sent += 1;
            self.next_retry = Some(at + self.timeout);
        }
    }

    /// Pick the callback for a response: superseded requests prefer the
    /// overwritten-callback.
    pub fn into_callback(self) -> Option<ResponseCallback> {
        if self.overwritten && self.on_overwritten.is_some() {
            self.on_overwritten
        } else {
            self.callback
        }
    }
}

/// Requests awaiting their first send, a resend, or a response.
#[derive(Default)]
pub(crate) struct RequestQueue {
    entries: Vec<PendingRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, request: PendingRequest) {
        self.entries.push(request);
    }

    pub fn push_front(&mut self, request: PendingRequest) {
        self.entries.insert(0, request);
    }

    /// Apply overwrite semantics for `incoming.method`.
    ///
    /// An unsent replaceable entry takes the new params and callbacks in place
    /// and keeps its id, which is returned; `incoming` is consumed. Otherwise
    /// every sent replaceable entry for the method is retired and `incoming`
    /// is handed back for appending.
    pub fn overwrite(&mut self, incoming: PendingRequest) -> Result<u64, PendingRequest> {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|r| r.replaceable && !r.is_sent() && r.method == incoming.method)
        {
            slot.params = incoming.params;
            slot.callback = incoming.callback;
            slot.on_overwritten = incoming.on_overwritten;
            slot.timeout = incoming.timeout;
            slot.on_timeout = incoming.on_timeout;
            slot.overwritten = true;
            return Ok(slot.id);
        }

        for sent in self
            .entries
            .iter_mut()
            .filter(|r| r.replaceable && r.is_sent() && r.method == incoming.method)
        {
            sent.overwritten = true;
        }
        Err(incoming)
    }

    /// First entry that should be written now, in queue order.
    pub fn next_due(&mut self, now: Instant) -> Option<&mut PendingRequest> {
        self.entries
            .iter_mut()
            .find(|r| r.is_due(now) && r.times_sent < r.max_sends && !r.is_retired())
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut PendingRequest> {
        self.entries.iter_mut().find(|r| r.id == id)
    }

    /// Remove the request answered by `id`. Consumes it exactly once.
    pub fn take(&mut self, id: u64) -> Option<PendingRequest> {
        let pos = self.entries.iter().position(|r| r.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Remove every request whose last send went unanswered.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        for request in &mut self.entries {
            request.age_retired(now);
        }
        let (expired, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.entries)
            .into_iter()
            .partition(|r| r.is_exhausted(now));
        self.entries = kept;
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn unsent_count(&self, method: &str) -> usize {
        self.entries
            .iter()
            .filter(|r| !r.is_sent() && r.method == method)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A pre-framed payload written a chunk at a time.
pub(crate) struct RawPayload {
    pub name: String,
    pub bytes: Vec<u8>,
    pub offset: usize,
    pub callback: Option<SentCallback>,
}

impl RawPayload {
    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.offset..]
    }

    pub fn in_progress(&self) -> bool {
        self.offset > 0
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.bytes.len()
    }
}

#[derive(Default)]
pub(crate) struct RawQueue {
    entries: VecDeque<RawPayload>,
}

impl RawQueue {
    /// Append, or with `overwrite` replace an unstarted payload of the same name.
    pub fn push(&mut self, payload: RawPayload, overwrite: bool) {
        if overwrite
            && let Some(slot) = self
                .entries
                .iter_mut()
                .find(|queued| !queued.in_progress() && queued.name == payload.name)
        {
            *slot = payload;
            return;
        }
        self.entries.push_back(payload);
    }

    pub fn front_mut(&mut self) -> Option<&mut RawPayload> {
        self.entries.front_mut()
    }

    pub fn pop(&mut self) -> Option<RawPayload> {
        self.entries.pop_front()
    }

    /// Whether the head payload is partially written.
    pub fn in_progress(&self) -> bool {
        self.entries.front().is_some_and(RawPayload::in_progress)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
