//! Internal LSP message serde types for JSON-RPC communication.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LspError;
use crate::position;
use crate::types::{CompletionItem, CompletionItemKind, HoverFormat, HoverInfo};

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";
pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CHANGE: &str = "textDocument/didChange";
pub(crate) const DID_CLOSE: &str = "textDocument/didClose";
pub(crate) const COMPLETION: &str = "textDocument/completion";
pub(crate) const HOVER: &str = "textDocument/hover";
pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

pub(crate) fn method_not_found(id: &serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

/// Split a response frame into its result, or the server's error object.
pub(crate) fn response_result(mut body: serde_json::Value) -> Result<serde_json::Value, LspError> {
    if let Some(error) = body.get("error") {
        return Err(LspError::ServerError {
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body
        .get_mut("result")
        .map(serde_json::Value::take)
        .unwrap_or_default())
}

pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "kestrel",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "general": {
                "positionEncodings": ["utf-16"]
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "completion": {
                    "dynamicRegistration": false,
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["markdown", "plaintext"]
                    },
                    "contextSupport": true
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Whole-document sync: one content change with no range.
pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri
        }
    })
}

pub(crate) fn text_document_position_params(uri: &str, position: WirePosition) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri
        },
        "position": position
    })
}

pub(crate) fn completion_params(uri: &str, position: WirePosition) -> serde_json::Value {
    let mut params = text_document_position_params(uri, position);
    // 1 = Invoked
    params["context"] = serde_json::json!({ "triggerKind": 1 });
    params
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WirePosition {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WireRange {
    pub start: WirePosition,
    pub end: WirePosition,
}

// ── publishDiagnostics ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireDiagnostic {
    pub range: WireRange,
    pub severity: Option<u64>,
    pub code: Option<WireCode>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireCode {
    Number(i64),
    Text(String),
}

impl WireCode {
    pub fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

// ── completion ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletionResponse {
    List(WireCompletionList),
    Items(Vec<WireCompletionItem>),
}

#[derive(Debug, Deserialize)]
struct WireCompletionList {
    items: Vec<WireCompletionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCompletionItem {
    label: String,
    kind: Option<u64>,
    detail: Option<String>,
    documentation: Option<Documentation>,
    insert_text: Option<String>,
    sort_text: Option<String>,
    filter_text: Option<String>,
    text_edit: Option<WireTextEdit>,
}

/// Both `TextEdit` and `InsertReplaceEdit` carry `newText`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTextEdit {
    new_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Documentation {
    Plain(String),
    Markup(MarkupContent),
}

#[derive(Debug, Deserialize)]
struct MarkupContent {
    kind: String,
    value: String,
}

impl From<WireCompletionItem> for CompletionItem {
    fn from(item: WireCompletionItem) -> Self {
        Self {
            label: item.label,
            kind: item.kind.and_then(CompletionItemKind::from_lsp),
            detail: item.detail,
            documentation: item.documentation.map(|doc| match doc {
                Documentation::Plain(s) => s,
                Documentation::Markup(m) => m.value,
            }),
            insert_text: item.text_edit.map(|e| e.new_text).or(item.insert_text),
            sort_text: item.sort_text,
            filter_text: item.filter_text,
        }
    }
}

/// Decode a `textDocument/completion` result (`null`, items, or a list).
pub(crate) fn parse_completion_response(
    result: serde_json::Value,
) -> Result<Vec<CompletionItem>, LspError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    let response: CompletionResponse = serde_json::from_value(result)
        .map_err(|e| LspError::MalformedMessage(format!("completion response: {e}")))?;
    let items = match response {
        CompletionResponse::List(list) => list.items,
        CompletionResponse::Items(items) => items,
    };
    Ok(items.into_iter().map(CompletionItem::from).collect())
}

// ── hover ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireHover {
    contents: HoverContents,
    range: Option<WireRange>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HoverContents {
    Markup(MarkupContent),
    Marked(MarkedString),
    Array(Vec<MarkedString>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MarkedString {
    Plain(String),
    Code { language: String, value: String },
}

impl MarkedString {
    fn render(self) -> String {
        match self {
            Self::Plain(s) => s,
            Self::Code { language, value } => format!("```{language}\n{value}\n```"),
        }
    }
}

/// Decode a `textDocument/hover` result; empty contents count as no hover.
pub(crate) fn parse_hover_response(
    result: serde_json::Value,
    text: Option<&str>,
) -> Result<Option<HoverInfo>, LspError> {
    if result.is_null() {
        return Ok(None);
    }
    let hover: WireHover = serde_json::from_value(result)
        .map_err(|e| LspError::MalformedMessage(format!("hover response: {e}")))?;

    let (contents, format) = match hover.contents {
        HoverContents::Markup(markup) => {
            let format = if markup.kind == "markdown" {
                HoverFormat::Markdown
            } else {
                HoverFormat::PlainText
            };
            (markup.value, format)
        }
        HoverContents::Marked(marked) => (marked.render(), HoverFormat::Markdown),
        HoverContents::Array(parts) => (
            parts
                .into_iter()
                .map(MarkedString::render)
                .filter(|s| !s.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n\n"),
            HoverFormat::Markdown,
        ),
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(HoverInfo {
        contents,
        format,
        range: hover
            .range
            .map(|r| position::range_from_wire(text, r.start, r.end)),
    }))
}

// ── URIs ───────────────────────────────────────────────────────────────

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, LspError> {
    url::Url::from_file_path(path).map_err(|()| LspError::InvalidPath(path.to_path_buf()))
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
