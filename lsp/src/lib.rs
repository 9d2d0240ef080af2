//! Tick-driven LSP client.
//!
//! A [`Session`] owns one language server process and advances only when the
//! host calls [`Session::tick`]: it reads and frames what the server wrote,
//! routes responses, notifications and server requests, and flushes at most
//! one queued notification and one queued request per tick. [`LspManager`]
//! sits on top, routing documents to sessions and collecting diagnostics.

pub mod capabilities;
pub mod codec;
pub mod hitrate;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod transport;
pub mod types;

pub(crate) mod diagnostics;

mod manager;
#[cfg(test)]
mod testing;

pub use capabilities::{ServerCapabilities, TextDocumentSyncKind};
pub use manager::{Launcher, LspManager};
pub use protocol::{RequestId, Response, ResponseError};
pub use queue::RequestOptions;
pub use session::{NotificationOptions, Session, SessionState};
pub use transport::{ProcessTransport, Transport};
pub use types::{
    ConfigError, Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, DocumentEdit, HostPosition,
    LspConfig, LspEvent, ServerConfig, ServerStopReason, SessionSettings,
};
