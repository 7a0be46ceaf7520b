//! LspManager facade: the single entry point for the rest of the application.
//!
//! Sessions are created lazily, one per language, the first time a document
//! of that language is opened against the current workspace root. Changing
//! the root tears every session down; the next document open recreates it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::config::{LspConfig, TimeoutConfig};
use crate::diagnostics::DiagnosticsRouter;
use crate::error::LspResult;
use crate::launcher::{Launcher, ProcessLauncher};
use crate::protocol;
use crate::registry::{LanguageDescriptor, ServerRegistry};
use crate::session::ServerSession;
use crate::types::{
    CompletionItem, DiagnosticsSnapshot, HoverInfo, LspEvent, Position, SessionState,
};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Public facade for the LSP client subsystem.
///
/// All methods take `&self`; share it behind an `Arc` when several tasks
/// need it.
pub struct LspManager {
    registry: ServerRegistry,
    launcher: Arc<dyn Launcher>,
    router: Arc<DiagnosticsRouter>,
    timeouts: TimeoutConfig,
    workspace_root: RwLock<Option<PathBuf>>,
    sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
    /// Held for writing while sessions are torn down, so no document can
    /// start a session against a root that is being replaced.
    restart_gate: tokio::sync::RwLock<()>,
}

impl LspManager {
    /// A manager that spawns real server processes.
    #[must_use]
    pub fn new(config: &LspConfig) -> Self {
        Self::with_launcher(config, Arc::new(ProcessLauncher::new()))
    }

    #[must_use]
    pub fn with_launcher(config: &LspConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            registry: ServerRegistry::from_config(config),
            launcher,
            router: Arc::new(DiagnosticsRouter::new(EVENT_CHANNEL_CAPACITY)),
            timeouts: config.timeouts,
            workspace_root: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            restart_gate: tokio::sync::RwLock::new(()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, language: &str) -> Option<Arc<ServerSession>> {
        self.sessions().get(language).cloned()
    }

    #[must_use]
    pub fn workspace_root(&self) -> Option<PathBuf> {
        self.workspace_root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the root servers are initialized against.
    ///
    /// Every existing session is terminated first: initialization is
    /// root-scoped, so sessions are recreated lazily under the new root.
    /// Setting the current root again is a no-op.
    pub async fn set_workspace_root(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        let _gate = self.restart_gate.write().await;
        {
            let mut current = self
                .workspace_root
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() == Some(root.as_path()) {
                return;
            }
            tracing::info!(root = %root.display(), "Workspace root changed");
            *current = Some(root);
        }
        self.terminate_all().await;
    }

    /// Terminate every session and forget all diagnostics.
    pub async fn dispose_all(&self) {
        let _gate = self.restart_gate.write().await;
        self.terminate_all().await;
    }

    async fn terminate_all(&self) {
        let sessions: Vec<Arc<ServerSession>> =
            self.sessions().drain().map(|(_, session)| session).collect();
        for session in sessions {
            tracing::info!(
                language = %session.language(),
                root = %session.root().display(),
                documents = session.open_documents(),
                "Shutting down language server"
            );
            session.terminate().await;
        }
        self.router.clear();
    }

    /// Configured languages, sorted by identifier.
    #[must_use]
    pub fn languages(&self) -> Vec<&LanguageDescriptor> {
        self.registry.descriptors()
    }

    #[must_use]
    pub fn is_language_supported(&self, path: &Path) -> bool {
        self.registry.is_language_supported(path)
    }

    /// Open a document, starting its language's session if needed.
    ///
    /// Returns immediately after `didOpen` is queued. The only error a
    /// caller sees is a launch failure (once per session) or a path that
    /// cannot be turned into a URI.
    pub async fn open_document(&self, path: &Path, content: &str) -> LspResult<()> {
        let _gate = self.restart_gate.read().await;
        let Some((session, uri)) = self.session_for_sync(path)? else {
            return Ok(());
        };
        session.open_document(&uri, content);
        Ok(())
    }

    /// Sync new full content. A document the session has not seen yet is
    /// opened at version 1 instead.
    pub async fn change_document(&self, path: &Path, content: &str) -> LspResult<()> {
        let _gate = self.restart_gate.read().await;
        let Some((session, uri)) = self.session_for_sync(path)? else {
            return Ok(());
        };
        session.change_document(&uri, content);
        Ok(())
    }

    /// Close a document. Never starts a session.
    pub fn close_document(&self, path: &Path) {
        let Some(descriptor) = self.registry.resolve(path) else {
            return;
        };
        let Some(session) = self.session(descriptor.language_id()) else {
            return;
        };
        match protocol::path_to_file_uri(path) {
            Ok(uri) => session.close_document(uri.as_str()),
            Err(e) => tracing::debug!("Ignoring close for {}: {e}", path.display()),
        }
    }

    /// Completion items at a one-based `line`/`column`.
    ///
    /// Unsupported files, files whose language has no session, and
    /// superseded requests all yield an empty list.
    pub async fn completions(
        &self,
        path: &Path,
        line: u32,
        column: u32,
    ) -> LspResult<Vec<CompletionItem>> {
        let Some((session, uri)) = self.session_for_request(path).await? else {
            return Ok(Vec::new());
        };
        session
            .completion(&uri, Position::new(line, column))
            .await
    }

    /// Hover information at a one-based `line`/`column`.
    pub async fn hover(&self, path: &Path, line: u32, column: u32) -> LspResult<Option<HoverInfo>> {
        let Some((session, uri)) = self.session_for_request(path).await? else {
            return Ok(None);
        };
        session.hover(&uri, Position::new(line, column)).await
    }

    /// Receive diagnostics and session-state events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LspEvent> {
        self.router.subscribe()
    }

    /// Latest diagnostics for every file that has any.
    #[must_use]
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.router.snapshot()
    }

    #[must_use]
    pub fn session_state(&self, language: &str) -> Option<SessionState> {
        self.session(language).map(|session| session.state())
    }

    /// Languages with a session in the map, sorted.
    #[must_use]
    pub fn active_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.sessions().keys().cloned().collect();
        languages.sort();
        languages
    }

    /// Resolve the session a sync notification for `path` goes to, starting
    /// it when absent. `None` means the document is ignored.
    fn session_for_sync(&self, path: &Path) -> LspResult<Option<(Arc<ServerSession>, String)>> {
        let Some(descriptor) = self.registry.resolve(path) else {
            return Ok(None);
        };
        let Some(root) = self.workspace_root() else {
            tracing::debug!(
                path = %path.display(),
                "No workspace root yet, not syncing document"
            );
            return Ok(None);
        };
        let uri = protocol::path_to_file_uri(path)?;
        let session = self.ensure_session(descriptor, &root)?;
        Ok(Some((session, uri.to_string())))
    }

    async fn session_for_request(
        &self,
        path: &Path,
    ) -> LspResult<Option<(Arc<ServerSession>, String)>> {
        let Some(descriptor) = self.registry.resolve(path) else {
            return Ok(None);
        };
        // Wait out a restart in progress, but not the request itself.
        let session = {
            let _gate = self.restart_gate.read().await;
            self.session(descriptor.language_id())
        };
        let Some(session) = session else {
            return Ok(None);
        };
        let uri = protocol::path_to_file_uri(path)?;
        Ok(Some((session, uri.to_string())))
    }

    /// Return the language's session, launching one if the map has none or
    /// its server died after starting.
    ///
    /// A launch failure leaves a degraded placeholder in the map so later
    /// opens do not retry, and is reported to this caller only. The same
    /// holds for a failed handshake.
    fn ensure_session(
        &self,
        descriptor: &LanguageDescriptor,
        root: &Path,
    ) -> LspResult<Arc<ServerSession>> {
        let language = descriptor.language_id();
        let mut sessions = self.sessions();
        if let Some(session) = sessions.get(language).cloned() {
            if !session.needs_relaunch() {
                return Ok(session);
            }
            sessions.remove(language);
            tracing::info!(language = %language, "Replacing language server that stopped");
            // Torn down off the caller's path.
            tokio::spawn(async move { session.terminate().await });
        }

        tracing::info!(
            language = %language,
            command = %descriptor.command(),
            "Starting language server"
        );
        match ServerSession::start(
            descriptor,
            root,
            self.launcher.as_ref(),
            Arc::clone(&self.router),
            self.timeouts,
        ) {
            Ok(session) => {
                sessions.insert(language.to_string(), Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(language = %language, "Language server failed to start: {e}");
                let placeholder = ServerSession::failed(
                    language,
                    root,
                    Arc::clone(&self.router),
                    self.timeouts,
                    &e,
                );
                sessions.insert(language.to_string(), placeholder);
                Err(e)
            }
        }
    }
}
