//! Inbound routing: responses to pending callbacks, server requests and
//! notifications to listeners, with built-in defaults when none are registered.

use std::collections::HashMap;

use serde_json::Value;

use super::Session;
use crate::protocol::{self, Inbound, PublishDiagnosticsParams, RequestId};
use crate::types::LspEvent;

/// Invoked for every notification of the method it was registered under.
pub type MessageListener = Box<dyn FnMut(&mut Session, &Value)>;
/// Invoked for every server request of its method; answers via [`Session::push_response`].
pub type RequestListener = Box<dyn FnMut(&mut Session, &RequestId, &Value)>;
/// Invoked for every event emitted under its name (see [`LspEvent::name`]).
pub type EventListener = Box<dyn FnMut(&mut Session, &LspEvent)>;

#[derive(Default)]
pub(super) struct Listeners {
    messages: HashMap<String, Vec<MessageListener>>,
    requests: HashMap<String, Vec<RequestListener>>,
    events: HashMap<String, Vec<EventListener>>,
}

/// Put a listener list back, keeping anything registered while it was out.
fn restore<L>(map: &mut HashMap<String, Vec<L>>, key: &str, mut list: Vec<L>) {
    if let Some(added) = map.remove(key) {
        list.extend(added);
    }
    map.insert(key.to_string(), list);
}

impl Session {
    pub fn add_message_listener(
        &mut self,
        method: &str,
        listener: impl FnMut(&mut Session, &Value) + 'static,
    ) {
        self.listeners
            .messages
            .entry(method.to_string())
            .or_default()
            .push(Box::new(listener));
    }

    pub fn add_request_listener(
        &mut self,
        method: &str,
        listener: impl FnMut(&mut Session, &RequestId, &Value) + 'static,
    ) {
        self.listeners
            .requests
            .entry(method.to_string())
            .or_default()
            .push(Box::new(listener));
    }

    /// Register for events named [`LspEvent::INITIALIZED`], [`LspEvent::DIAGNOSTICS`]
    /// or [`LspEvent::SHUTDOWN`].
    pub fn add_event_listener(
        &mut self,
        name: &str,
        listener: impl FnMut(&mut Session, &LspEvent) + 'static,
    ) {
        self.listeners
            .events
            .entry(name.to_string())
            .or_default()
            .push(Box::new(listener));
    }

    /// Run event listeners, then queue the event for [`Session::take_events`].
    pub(super) fn emit(&mut self, event: LspEvent) {
        let name = event.name();
        if let Some(mut list) = self.listeners.events.remove(name) {
            for listener in &mut list {
                listener(self, &event);
            }
            restore(&mut self.listeners.events, name, list);
        }
        self.events.push_back(event);
    }

    pub(super) fn handle_frame(&mut self, body: &[u8]) {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(server = %self.name, "dropping undecodable LSP frame: {e}");
                return;
            }
        };
        match protocol::classify(value) {
            Some(inbound) => self.route(inbound),
            None => tracing::debug!(server = %self.name, "ignoring malformed LSP message"),
        }
    }

    pub(super) fn route(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Response { id, response } => {
                let Some(request) = self.requests.take(id) else {
                    tracing::debug!(server = %self.name, id, "response for unknown request");
                    return;
                };
                if let Some(callback) = request.into_callback() {
                    callback(self, response);
                }
            }
            Inbound::ServerRequest { id, method, params } => {
                if let Some(mut list) = self.listeners.requests.remove(&method) {
                    for listener in &mut list {
                        listener(self, &id, &params);
                    }
                    restore(&mut self.listeners.requests, &method, list);
                    return;
                }
                tracing::debug!(server = %self.name, %id, method = %method, "answering server request");
                let reply = Self::default_reply(&method, &params);
                self.push_response(id, reply);
            }
            Inbound::Notification { method, params } => {
                if let Some(mut list) = self.listeners.messages.remove(&method) {
                    for listener in &mut list {
                        listener(self, &params);
                    }
                    restore(&mut self.listeners.messages, &method, list);
                    return;
                }
                self.default_notification(&method, params);
            }
        }
    }

    fn default_notification(&mut self, method: &str, params: Value) {
        match method {
            "textDocument/publishDiagnostics" => self.publish_diagnostics(params),
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                // MessageType: 1 error, 2 warning, 3 info, 4 log.
                match params.get("type").and_then(Value::as_u64) {
                    Some(1) => tracing::error!(server = %self.name, "{message}"),
                    Some(2) => tracing::warn!(server = %self.name, "{message}"),
                    Some(3) => tracing::info!(server = %self.name, "{message}"),
                    _ => tracing::debug!(server = %self.name, "{message}"),
                }
            }
            _ => tracing::trace!(server = %self.name, method, "unhandled notification"),
        }
    }

    fn publish_diagnostics(&mut self, params: Value) {
        let params: PublishDiagnosticsParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(server = %self.name, "bad publishDiagnostics params: {e}");
                return;
            }
        };
        let Some(path) = protocol::file_uri_to_path(&params.uri) else {
            tracing::debug!(server = %self.name, uri = %params.uri, "diagnostics for non-file URI");
            return;
        };
        let items = params
            .diagnostics
            .iter()
            .map(protocol::LspDiagnostic::to_diagnostic)
            .collect();
        self.emit(LspEvent::Diagnostics {
            server: self.name.clone(),
            path,
            items,
        });
    }
}
