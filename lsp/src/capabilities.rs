//! Server capability normalization.
//!
//! LSP lets a server advertise most capabilities in two shapes: a scalar
//! (`true`, or a sync-kind integer) or an options object. [`ServerCapabilities`]
//! collapses both into one structured shape so call sites never branch on
//! representation. Serializing a normalized value and normalizing it again
//! yields an equal value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How document edits are synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum TextDocumentSyncKind {
    #[default]
    None,
    Full,
    Incremental,
}

impl From<u8> for TextDocumentSyncKind {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Full,
            2 => Self::Incremental,
            _ => Self::None,
        }
    }
}

impl From<TextDocumentSyncKind> for u8 {
    fn from(kind: TextDocumentSyncKind) -> Self {
        match kind {
            TextDocumentSyncKind::None => 0,
            TextDocumentSyncKind::Full => 1,
            TextDocumentSyncKind::Incremental => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    pub include_text: bool,
}

/// Long-form `textDocumentSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentSync {
    pub open_close: bool,
    pub change: TextDocumentSyncKind,
    pub will_save: bool,
    pub will_save_wait_until: bool,
    pub save: Option<SaveOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    pub trigger_characters: Vec<String>,
    pub resolve_provider: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureHelpOptions {
    pub trigger_characters: Vec<String>,
    pub retrigger_characters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameOptions {
    pub prepare_provider: bool,
}

/// Canonical view of what a server declared support for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    pub text_document_sync: TextDocumentSync,
    pub completion_provider: Option<CompletionOptions>,
    pub hover_provider: bool,
    pub signature_help_provider: Option<SignatureHelpOptions>,
    pub document_symbol_provider: bool,
    pub definition_provider: bool,
    pub type_definition_provider: bool,
    pub implementation_provider: bool,
    pub declaration_provider: bool,
    pub references_provider: bool,
    pub rename_provider: Option<RenameOptions>,
    pub document_formatting_provider: bool,
    pub document_range_formatting_provider: bool,
    pub workspace_symbol_provider: bool,
}

impl ServerCapabilities {
    /// Normalize the raw `capabilities` object of an initialize result.
    #[must_use]
    pub fn normalize(raw: &Value) -> Self {
        let field = |name| member(raw, name);

        Self {
            text_document_sync: normalize_sync(field("textDocumentSync")),
            completion_provider: field("completionProvider")
                .is_object()
                .then(|| CompletionOptions {
                    trigger_characters: string_list(field("completionProvider"), "triggerCharacters"),
                    resolve_provider: flag(field("completionProvider").get("resolveProvider")),
                }),
            hover_provider: enabled(field("hoverProvider")),
            signature_help_provider: field("signatureHelpProvider").is_object().then(|| {
                SignatureHelpOptions {
                    trigger_characters: string_list(field("signatureHelpProvider"), "triggerCharacters"),
                    retrigger_characters: string_list(
                        field("signatureHelpProvider"),
                        "retriggerCharacters",
                    ),
                }
            }),
            document_symbol_provider: enabled(field("documentSymbolProvider")),
            definition_provider: enabled(field("definitionProvider")),
            type_definition_provider: enabled(field("typeDefinitionProvider")),
            implementation_provider: enabled(field("implementationProvider")),
            declaration_provider: enabled(field("declarationProvider")),
            references_provider: enabled(field("referencesProvider")),
            rename_provider: enabled(field("renameProvider")).then(|| RenameOptions {
                prepare_provider: flag(field("renameProvider").get("prepareProvider")),
            }),
            document_formatting_provider: enabled(field("documentFormattingProvider")),
            document_range_formatting_provider: enabled(field("documentRangeFormattingProvider")),
            workspace_symbol_provider: enabled(field("workspaceSymbolProvider")),
        }
    }

    #[must_use]
    pub fn sync_kind(&self) -> TextDocumentSyncKind {
        self.text_document_sync.change
    }

    /// Whether didSave should carry the full document text.
    #[must_use]
    pub fn save_includes_text(&self) -> bool {
        self.text_document_sync
            .save
            .is_some_and(|save| save.include_text)
    }
}

static NULL: Value = Value::Null;

fn member<'a>(raw: &'a Value, name: &str) -> &'a Value {
    raw.get(name).unwrap_or(&NULL)
}

fn flag(value: Option<&Value>) -> bool {
    value.and_then(Value::as_bool).unwrap_or(false)
}

/// `true` or an options object both mean "supported".
fn enabled(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Object(_) => true,
        _ => false,
    }
}

fn string_list(options: &Value, key: &str) -> Vec<String> {
    options
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn sync_kind(value: Option<&Value>) -> TextDocumentSyncKind {
    value
        .and_then(Value::as_u64)
        .and_then(|n| u8::try_from(n).ok())
        .map(TextDocumentSyncKind::from)
        .unwrap_or_default()
}

fn normalize_sync(value: &Value) -> TextDocumentSync {
    let short_form = |change: TextDocumentSyncKind, open_close: bool| TextDocumentSync {
        open_close,
        change,
        will_save: false,
        will_save_wait_until: false,
        save: Some(SaveOptions {
            include_text: false,
        }),
    };

    match value {
        Value::Number(_) => short_form(sync_kind(Some(value)), true),
        Value::Bool(true) => short_form(TextDocumentSyncKind::Full, true),
        Value::Bool(false) => short_form(TextDocumentSyncKind::None, false),
        Value::Object(opts) => TextDocumentSync {
            open_close: flag(opts.get("openClose")),
            change: sync_kind(opts.get("change")),
            will_save: flag(opts.get("willSave")),
            will_save_wait_until: flag(opts.get("willSaveWaitUntil")),
            save: match opts.get("save") {
                Some(Value::Bool(true)) => Some(SaveOptions {
                    include_text: false,
                }),
                Some(Value::Object(save)) => Some(SaveOptions {
                    include_text: flag(save.get("includeText")),
                }),
                _ => None,
            },
        },
        _ => TextDocumentSync::default(),
    }
}
