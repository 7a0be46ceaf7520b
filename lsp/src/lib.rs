//! Language server client: supervises one server process per language,
//! keeps open documents in sync, and surfaces completions, hover and
//! pushed diagnostics through [`LspManager`].

pub mod codec;
pub mod config;
pub mod error;
pub mod launcher;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod dispatcher;
pub(crate) mod documents;
pub(crate) mod position;
pub(crate) mod protocol;
pub(crate) mod registry;
pub(crate) mod session;

mod manager;

pub use config::{ConfigError, LspConfig, ServerConfig, TimeoutConfig};
pub use error::{LspError, LspResult};
pub use launcher::{Launcher, ProcessLauncher, ServerIo};
pub use manager::LspManager;
pub use registry::LanguageDescriptor;
pub use types::{
    CompletionItem, CompletionItemKind, Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot,
    HoverFormat, HoverInfo, LspEvent, Position, Range, SessionState,
};
