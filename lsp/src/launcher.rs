//! Process-launch facility.
//!
//! A [`Launcher`] turns a [`LanguageDescriptor`] into a pair of byte streams
//! plus, for real processes, a child handle the session can kill. Spawning
//! is synchronous so a missing executable is reported to the caller that
//! triggered the start.

use std::env;
use std::path::Path;
use std::process::Stdio;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::LspError;
use crate::registry::LanguageDescriptor;

/// Environment variables never passed to language servers.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_KEY",
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_SECRET_*",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "GITHUB_TOKEN",
    "NPM_TOKEN",
];

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The streams of a launched server.
pub struct ServerIo {
    /// Server → client (the server's stdout).
    pub reader: BoxedReader,
    /// Client → server (the server's stdin).
    pub writer: BoxedWriter,
    pub process: Option<Child>,
}

impl ServerIo {
    /// Streams with no backing process, e.g. an in-memory pipe.
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        }
    }
}

pub trait Launcher: Send + Sync {
    fn launch(&self, descriptor: &LanguageDescriptor, root: &Path) -> Result<ServerIo, LspError>;
}

fn build_denylist(patterns: &[&str]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(&pattern.to_uppercase()) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!("Ignoring invalid env denylist pattern '{pattern}': {e}"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Failed to build env denylist: {e}");
        GlobSet::empty()
    })
}

/// Spawns real language server processes over stdio.
pub struct ProcessLauncher {
    denylist: GlobSet,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            denylist: build_denylist(ENV_SECRET_DENYLIST),
        }
    }

    fn is_denied(&self, key: &str) -> bool {
        self.denylist.is_match(key.to_uppercase())
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, descriptor: &LanguageDescriptor, root: &Path) -> Result<ServerIo, LspError> {
        let language = descriptor.language_id();
        let resolved_cmd = which::which(descriptor.command()).map_err(|_| {
            LspError::launch_failure(
                language,
                format!("{} not found in PATH", descriptor.command()),
            )
        })?;

        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(descriptor.args())
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, _) in env::vars_os() {
            if let Some(name) = key.to_str()
                && self.is_denied(name)
            {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            LspError::launch_failure(language, format!("spawning {}: {e}", descriptor.command()))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::launch_failure(language, "no stdout from child"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::launch_failure(language, "no stdin from child"))?;

        tracing::info!(
            language = %language,
            command = %resolved_cmd.display(),
            pid = child.id(),
            "Language server spawned"
        );

        Ok(ServerIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(child),
        })
    }
}
