//! Public types consumed by the host application.
//!
//! Every line and column here is one-based, ready for display. Conversion
//! to and from the zero-based wire format happens inside the crate.

use std::fmt;
use std::path::{Path, PathBuf};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

impl DiagnosticSeverity {
    /// Convert from the protocol's numeric severity.
    ///
    /// Hints fold into `Info`, as do missing and out-of-range values.
    #[must_use]
    pub fn from_lsp(value: Option<u64>) -> Self {
        match value {
            Some(1) => Self::Error,
            Some(2) => Self::Warning,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// A one-based line/column pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A single normalized diagnostic.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    range: Range,
    message: String,
    source: Option<String>,
    code: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        range: Range,
        message: String,
        source: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self {
            severity,
            range,
            message,
            source,
            code,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    /// 1-based line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.range.start.line
    }

    /// 1-based column.
    #[must_use]
    pub fn column(&self) -> u32 {
        self.range.start.column
    }

    #[must_use]
    pub fn end_line(&self) -> u32 {
        self.range.end.line
    }

    #[must_use]
    pub fn end_column(&self) -> u32 {
        self.range.end.column
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source of the diagnostic (e.g. "ts", "rustc").
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Format as `path:line:col: severity: [source] message`.
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        let mut out = format!(
            "{}:{}:{}: {}: ",
            path.display(),
            self.line(),
            self.column(),
            self.severity.label(),
        );
        if let Some(source) = &self.source {
            out.push_str(&format!("[{source}] "));
        }
        out.push_str(&self.message);
        out
    }
}

/// The protocol's fixed set of completion item kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionItemKind {
    Text,
    Method,
    Function,
    Constructor,
    Field,
    Variable,
    Class,
    Interface,
    Module,
    Property,
    Unit,
    Value,
    Enum,
    Keyword,
    Snippet,
    Color,
    File,
    Reference,
    Folder,
    EnumMember,
    Constant,
    Struct,
    Event,
    Operator,
    TypeParameter,
}

impl CompletionItemKind {
    /// Decode the protocol's numeric kind; unknown values yield `None`.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        let kind = match value {
            1 => Self::Text,
            2 => Self::Method,
            3 => Self::Function,
            4 => Self::Constructor,
            5 => Self::Field,
            6 => Self::Variable,
            7 => Self::Class,
            8 => Self::Interface,
            9 => Self::Module,
            10 => Self::Property,
            11 => Self::Unit,
            12 => Self::Value,
            13 => Self::Enum,
            14 => Self::Keyword,
            15 => Self::Snippet,
            16 => Self::Color,
            17 => Self::File,
            18 => Self::Reference,
            19 => Self::Folder,
            20 => Self::EnumMember,
            21 => Self::Constant,
            22 => Self::Struct,
            23 => Self::Event,
            24 => Self::Operator,
            25 => Self::TypeParameter,
            _ => return None,
        };
        Some(kind)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Method => "method",
            Self::Function => "function",
            Self::Constructor => "constructor",
            Self::Field => "field",
            Self::Variable => "variable",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Module => "module",
            Self::Property => "property",
            Self::Unit => "unit",
            Self::Value => "value",
            Self::Enum => "enum",
            Self::Keyword => "keyword",
            Self::Snippet => "snippet",
            Self::Color => "color",
            Self::File => "file",
            Self::Reference => "reference",
            Self::Folder => "folder",
            Self::EnumMember => "enum member",
            Self::Constant => "constant",
            Self::Struct => "struct",
            Self::Event => "event",
            Self::Operator => "operator",
            Self::TypeParameter => "type parameter",
        }
    }
}

impl fmt::Display for CompletionItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured completion data; presentation is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionItem {
    pub label: String,
    pub kind: Option<CompletionItemKind>,
    pub detail: Option<String>,
    pub documentation: Option<String>,
    pub insert_text: Option<String>,
    pub sort_text: Option<String>,
    pub filter_text: Option<String>,
}

impl CompletionItem {
    /// Text to insert when the item is accepted.
    #[must_use]
    pub fn text_to_insert(&self) -> &str {
        self.insert_text.as_deref().unwrap_or(&self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoverFormat {
    Markdown,
    PlainText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverInfo {
    pub contents: String,
    pub format: HoverFormat,
    /// Span of the hovered symbol, when the server reports one.
    pub range: Option<Range>,
}

/// Lifecycle state of a language server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Ready,
    Degraded,
    Terminated,
}

impl SessionState {
    /// Whether new requests may be issued against the session.
    #[must_use]
    pub fn accepts_requests(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Terminated => "terminated",
        }
    }
}

/// An event emitted by the LSP subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum LspEvent {
    /// Diagnostics replaced for a file. An empty list means "all clear".
    Diagnostics {
        uri: String,
        path: Option<PathBuf>,
        items: Vec<Diagnostic>,
    },
    /// A session changed lifecycle state.
    SessionState {
        language: String,
        state: SessionState,
        reason: Option<String>,
    },
}

/// Immutable snapshot of all diagnostics, suitable for UI rendering.
///
/// Counts are computed from `files` rather than cached alongside it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-file diagnostics, sorted with error-containing files first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(String, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    /// Per-file diagnostics keyed by URI, error files first.
    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn for_uri(&self, uri: &str) -> &[Diagnostic] {
        self.files
            .iter()
            .find(|(u, _)| u == uri)
            .map_or(&[], |(_, items)| items.as_slice())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Info)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
