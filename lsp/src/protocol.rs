//! JSON-RPC envelopes and LSP message builders.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::types::{Diagnostic, DiagnosticSeverity, DocumentEdit, HostPosition};

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// Id of a request initiated by the server. JSON-RPC allows numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;

    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Outcome of a request: the `result` member, or the `error` member.
pub type Response = Result<Value, ResponseError>;

#[derive(Debug, Serialize)]
pub(crate) struct RequestFrame<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> RequestFrame<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct NotificationFrame<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> NotificationFrame<'a> {
    pub fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Build a response envelope carrying exactly one of `result` / `error`.
pub(crate) fn response_frame(id: &RequestId, response: &Response) -> Value {
    match response {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
    }
}

/// A decoded inbound message, classified for routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response { id: u64, response: Response },
    ServerRequest {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification { method: String, params: Value },
}

/// Classify a decoded JSON-RPC frame. Returns `None` for frames that fit no shape.
#[must_use]
pub fn classify(frame: Value) -> Option<Inbound> {
    let Value::Object(mut obj) = frame else {
        return None;
    };
    let method = match obj.remove("method") {
        Some(Value::String(m)) => Some(m),
        _ => None,
    };
    let params = obj.remove("params").unwrap_or(Value::Null);

    match (obj.remove("id"), method) {
        (Some(id), Some(method)) => Some(Inbound::ServerRequest {
            id: serde_json::from_value(id).ok()?,
            method,
            params,
        }),
        (None, Some(method)) => Some(Inbound::Notification { method, params }),
        (Some(id), None) => {
            let id = match id {
                Value::Number(n) => n.as_u64()?,
                Value::String(s) => s.parse().ok()?,
                _ => return None,
            };
            let response = if let Some(error) = obj.remove("error") {
                Err(serde_json::from_value(error).unwrap_or_else(|e| {
                    ResponseError::new(
                        ResponseError::INTERNAL_ERROR,
                        format!("malformed error object: {e}"),
                    )
                }))
            } else {
                Ok(obj.remove("result")?)
            };
            Some(Inbound::Response { id, response })
        }
        (None, None) => None,
    }
}

/// LSP position (0-based line and UTF-16 character offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl From<HostPosition> for Position {
    /// Host positions are 1-based; the wire is 0-based.
    fn from(pos: HostPosition) -> Self {
        Self {
            line: pos.line.saturating_sub(1),
            character: pos.col.saturating_sub(1),
        }
    }
}

impl From<Position> for HostPosition {
    fn from(pos: Position) -> Self {
        HostPosition::new(pos.line + 1, pos.character + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

pub(crate) fn initialize_params(
    root_uri: &str,
    workspace_name: &str,
    client_name: &str,
    client_version: &str,
    initialization_options: Option<&Value>,
) -> Value {
    let mut params = json!({
        "processId": process::id(),
        "clientInfo": { "name": client_name, "version": client_version },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": {
                    "dynamicRegistration": false,
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["markdown", "plaintext"],
                        "resolveSupport": { "properties": ["documentation", "detail"] }
                    },
                    "contextSupport": true
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "signatureHelp": {
                    "dynamicRegistration": false,
                    "signatureInformation": {
                        "documentationFormat": ["markdown", "plaintext"]
                    }
                },
                "documentSymbol": {
                    "dynamicRegistration": false,
                    "hierarchicalDocumentSymbolSupport": true
                },
                "definition": { "dynamicRegistration": false, "linkSupport": false },
                "typeDefinition": { "dynamicRegistration": false, "linkSupport": false },
                "implementation": { "dynamicRegistration": false, "linkSupport": false },
                "declaration": { "dynamicRegistration": false, "linkSupport": false },
                "references": { "dynamicRegistration": false },
                "rename": { "dynamicRegistration": false, "prepareSupport": false },
                "formatting": { "dynamicRegistration": false },
                "rangeFormatting": { "dynamicRegistration": false },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "symbol": { "dynamicRegistration": false }
            },
            "window": {
                "workDoneProgress": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": workspace_name
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_full_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn did_change_incremental_params(
    uri: &str,
    version: i32,
    edits: &[DocumentEdit],
) -> Value {
    let changes: Vec<Value> = edits
        .iter()
        .map(|edit| {
            let range = Range {
                start: edit.start.into(),
                end: edit.end.into(),
            };
            json!({ "range": range, "text": edit.text })
        })
        .collect();
    json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": changes
    })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = json!({ "textDocument": { "uri": uri } });
    if let Some(text) = text {
        params["text"] = Value::String(text.to_string());
    }
    params
}

pub(crate) fn text_document_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn position_params(uri: &str, pos: HostPosition) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": Position::from(pos)
    })
}

pub(crate) fn references_params(uri: &str, pos: HostPosition, include_declaration: bool) -> Value {
    let mut params = position_params(uri, pos);
    params["context"] = json!({ "includeDeclaration": include_declaration });
    params
}

pub(crate) fn rename_params(uri: &str, pos: HostPosition, new_name: &str) -> Value {
    let mut params = position_params(uri, pos);
    params["newName"] = Value::String(new_name.to_string());
    params
}

pub(crate) fn formatting_params(uri: &str, tab_size: u32, insert_spaces: bool) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "options": { "tabSize": tab_size, "insertSpaces": insert_spaces }
    })
}

pub(crate) fn range_formatting_params(
    uri: &str,
    start: HostPosition,
    end: HostPosition,
    tab_size: u32,
    insert_spaces: bool,
) -> Value {
    let range = Range {
        start: start.into(),
        end: end.into(),
    };
    let mut params = formatting_params(uri, tab_size, insert_spaces);
    params["range"] = json!(range);
    params
}

pub(crate) fn workspace_symbol_params(query: &str) -> Value {
    json!({ "query": query })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: Range,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
            self.source
                .clone()
                .unwrap_or_else(|| String::from("unknown")),
        )
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<Url, PathToUriError> {
    Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
