//! Language descriptors and request bounds, loaded once at startup.
//!
//! The file format is TOML:
//!
//! ```toml
//! enabled = true
//!
//! [timeouts]
//! completion = 1500
//!
//! [servers.typescript]
//! command = "typescript-language-server"
//! args = ["--stdio"]
//! file_extensions = ["ts", "tsx"]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Whether the LSP client is enabled. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-language server descriptors, keyed by language identifier.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Launch descriptor for a single language server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Passed verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

/// Request bounds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub initialize: u64,
    pub completion: u64,
    pub hover: u64,
    pub shutdown: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize: 30_000,
            completion: 2_000,
            hover: 2_000,
            shutdown: 2_000,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize)
    }

    #[must_use]
    pub fn completion(&self) -> Duration {
        Duration::from_millis(self.completion)
    }

    #[must_use]
    pub fn hover(&self) -> Duration {
        Duration::from_millis(self.hover)
    }

    #[must_use]
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

const fn default_true() -> bool {
    true
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: HashMap::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl LspConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `<config_dir>/kestrel/lsp.toml`, if the platform has a config dir.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kestrel").join("lsp.toml"))
    }

    /// Descriptors for commonly installed servers.
    #[must_use]
    pub fn builtin() -> Self {
        let server = |command: &str, args: &[&str], exts: &[&str]| ServerConfig {
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            file_extensions: exts.iter().map(|e| (*e).to_string()).collect(),
            initialization_options: None,
        };

        let servers = HashMap::from([
            (
                "typescript".to_string(),
                server(
                    "typescript-language-server",
                    &["--stdio"],
                    &["ts", "tsx", "mts", "cts"],
                ),
            ),
            (
                "javascript".to_string(),
                server(
                    "typescript-language-server",
                    &["--stdio"],
                    &["js", "jsx", "mjs", "cjs"],
                ),
            ),
            ("rust".to_string(), server("rust-analyzer", &[], &["rs"])),
            (
                "python".to_string(),
                server("pyright-langserver", &["--stdio"], &["py", "pyi"]),
            ),
            ("go".to_string(), server("gopls", &[], &["go"])),
        ]);

        Self {
            enabled: true,
            servers,
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Accessor used by the registry.
    #[must_use]
    pub fn servers(&self) -> &HashMap<String, ServerConfig> {
        &self.servers
    }
}
