//! Error taxonomy for the language server client.

use std::path::PathBuf;
use std::time::Duration;

/// Result type for LSP operations.
pub type LspResult<T> = Result<T, LspError>;

/// Errors surfaced to callers of [`crate::LspManager`].
///
/// Document sync never returns these for delivery problems; only launch
/// failures and interactive requests do.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LspError {
    /// Executable missing or the process could not be spawned.
    #[error("failed to launch language server for '{language}': {reason}")]
    LaunchFailure { language: String, reason: String },

    /// No response arrived within the request's bound.
    #[error("'{method}' timed out after {}ms", timeout.as_millis())]
    ProtocolTimeout {
        method: &'static str,
        timeout: Duration,
    },

    /// The session exited or was torn down while the request was pending.
    #[error("language server session for '{language}' was terminated")]
    SessionTerminated { language: String },

    /// The session is degraded and rejects new requests.
    #[error("language server for '{language}' is unavailable")]
    ServerUnavailable { language: String },

    /// A frame or response body that could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The server answered with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    ServerError { code: i64, message: String },

    /// The path cannot be expressed as a `file://` URI.
    #[error("cannot convert path to file URI: {}", .0.display())]
    InvalidPath(PathBuf),
}

impl LspError {
    pub(crate) fn launch_failure(language: &str, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            language: language.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn terminated(language: &str) -> Self {
        Self::SessionTerminated {
            language: language.to_string(),
        }
    }

    pub(crate) fn unavailable(language: &str) -> Self {
        Self::ServerUnavailable {
            language: language.to_string(),
        }
    }

    /// Whether the error comes from the session itself rather than this one request.
    #[must_use]
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailure { .. } | Self::SessionTerminated { .. } | Self::ServerUnavailable { .. }
        )
    }
}
