//! Server session: owns one language server process and its JSON-RPC channel.
//!
//! Two tasks drive each session. The reader demultiplexes incoming frames;
//! the writer performs the `initialize` handshake and then drains the
//! outbox in FIFO order. Notifications queued while the session is still
//! starting are therefore sent after `initialized`, in the order they were
//! queued.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::TimeoutConfig;
use crate::diagnostics::DiagnosticsRouter;
use crate::dispatcher::{PendingResponse, RequestDispatcher, RequestKind};
use crate::documents::{DocumentSyncTracker, SyncMessage};
use crate::error::{LspError, LspResult};
use crate::launcher::{BoxedReader, BoxedWriter, Launcher};
use crate::position;
use crate::protocol::{self, Notification, PublishDiagnosticsParams, Request};
use crate::registry::LanguageDescriptor;
use crate::types::{CompletionItem, HoverInfo, Position, SessionState};

enum Outgoing {
    Frame(serde_json::Value),
    Close,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the session handle and its I/O tasks.
struct SessionShared {
    language: String,
    state: Mutex<SessionState>,
    /// Set once the handshake completed; a later `Degraded` means the
    /// server went away mid-session rather than failing to start.
    reached_ready: AtomicBool,
    dispatcher: Arc<RequestDispatcher>,
    router: Arc<DiagnosticsRouter>,
    documents: Mutex<DocumentSyncTracker>,
    process: tokio::sync::Mutex<Option<Child>>,
}

impl SessionShared {
    fn new(
        language: &str,
        initial: SessionState,
        router: Arc<DiagnosticsRouter>,
        process: Option<Child>,
    ) -> Self {
        Self {
            language: language.to_string(),
            state: Mutex::new(initial),
            reached_ready: AtomicBool::new(false),
            dispatcher: RequestDispatcher::new(language),
            router,
            documents: Mutex::new(DocumentSyncTracker::new()),
            process: tokio::sync::Mutex::new(process),
        }
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn documents(&self) -> MutexGuard<'_, DocumentSyncTracker> {
        lock(&self.documents)
    }

    /// Apply a lifecycle transition; returns false if it is not allowed
    /// from the current state.
    fn transition(&self, next: SessionState, reason: Option<String>) -> bool {
        {
            let mut state = lock(&self.state);
            let allowed = match (*state, next) {
                (SessionState::Starting, SessionState::Ready)
                | (SessionState::Starting | SessionState::Ready, SessionState::Degraded) => true,
                (current, SessionState::Terminated) => current != SessionState::Terminated,
                _ => false,
            };
            if !allowed {
                return false;
            }
            *state = next;
        }
        if next == SessionState::Ready {
            self.reached_ready.store(true, Ordering::Release);
        }

        match (next, &reason) {
            (SessionState::Degraded, Some(reason)) => {
                tracing::warn!(language = %self.language, %reason, "Language server degraded");
            }
            _ => tracing::info!(language = %self.language, state = next.label(), "Language server state changed"),
        }
        self.router.publish_state(&self.language, next, reason);
        true
    }

    /// Move to `Degraded` and fail everything in flight with `error`.
    fn degrade(&self, reason: String, error: &LspError) {
        if self.transition(SessionState::Degraded, Some(reason)) {
            self.dispatcher.close(error);
        }
    }

    async fn kill_process(&self) {
        if let Some(child) = self.process.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }

    /// Collect the exit status once the server's stdout is gone, killing it
    /// first if it is still running.
    async fn reap_process(&self) {
        let child = self.process.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        let _ = child.start_kill();
        match child.wait().await {
            Ok(status) => tracing::debug!("LSP '{}' process exited: {status}", self.language),
            Err(e) => tracing::debug!("Failed to reap LSP '{}' process: {e}", self.language),
        }
    }

    fn dispatch_frame(&self, frame: &serde_json::Value, outbox: &mpsc::UnboundedSender<Outgoing>) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame from '{}'", self.language);
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                self.dispatcher.resolve(id, body);
            }
            IncomingFrame::ServerRequest { id, method } => {
                // Servers may block until requests like workspace/configuration are answered.
                tracing::debug!(
                    "LSP '{}' sent request: {method}, replying method not found",
                    self.language
                );
                let _ = outbox.send(Outgoing::Frame(protocol::method_not_found(&id, &method)));
            }
            IncomingFrame::Notification { method, params } => {
                self.handle_notification(&method, params);
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<serde_json::Value>) {
        if method != protocol::PUBLISH_DIAGNOSTICS {
            tracing::trace!("Ignoring notification from '{}': {method}", self.language);
            return;
        }
        let Some(params) = params else { return };
        match serde_json::from_value::<PublishDiagnosticsParams>(params) {
            Ok(params) => {
                let docs = self.documents();
                self.router
                    .publish(&params.uri, params.diagnostics, docs.text(&params.uri));
            }
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed publishDiagnostics from '{}': {e}",
                    self.language
                );
            }
        }
    }
}

struct Handshake {
    frame: serde_json::Value,
    pending: PendingResponse,
    timeout: std::time::Duration,
}

async fn read_loop(
    shared: Arc<SessionShared>,
    reader: BoxedReader,
    outbox: mpsc::UnboundedSender<Outgoing>,
) {
    let mut reader = FrameReader::new(reader);
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => shared.dispatch_frame(&frame, &outbox),
            Ok(None) => {
                tracing::info!("LSP server '{}' closed stdout", shared.language);
                shared.degrade(
                    "server exited".to_string(),
                    &LspError::terminated(&shared.language),
                );
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Dropping malformed frame from '{}': {e}", shared.language);
            }
            Err(e) => {
                tracing::warn!("LSP reader error for '{}': {e}", shared.language);
                shared.degrade(
                    format!("read error: {e}"),
                    &LspError::terminated(&shared.language),
                );
                break;
            }
        }
    }
    // `terminate` waits for a graceful exit itself.
    if shared.state() != SessionState::Terminated {
        shared.reap_process().await;
    }
}

async fn handshake<W>(
    writer: &mut FrameWriter<W>,
    handshake: Handshake,
) -> Result<(), String>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer
        .write_frame(&handshake.frame)
        .await
        .map_err(|e| format!("writing initialize: {e}"))?;

    match handshake.pending.wait(handshake.timeout).await {
        Ok(_) => {}
        Err(e) => return Err(format!("initialize failed: {e}")),
    }

    let initialized = Notification::new(protocol::INITIALIZED, Some(serde_json::json!({})));
    let frame = serde_json::to_value(&initialized).map_err(|e| e.to_string())?;
    writer
        .write_frame(&frame)
        .await
        .map_err(|e| format!("writing initialized: {e}"))
}

async fn write_loop(
    shared: Arc<SessionShared>,
    writer: BoxedWriter,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    init: Handshake,
) {
    let mut writer = FrameWriter::new(writer);

    if let Err(reason) = handshake(&mut writer, init).await {
        shared.degrade(reason, &LspError::unavailable(&shared.language));
        shared.kill_process().await;
        return;
    }
    if !shared.transition(SessionState::Ready, None) {
        // Torn down while the handshake was in flight.
        return;
    }

    while let Some(msg) = outbox.recv().await {
        match msg {
            Outgoing::Frame(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("LSP write error for '{}': {e}", shared.language);
                    shared.degrade(
                        format!("write error: {e}"),
                        &LspError::unavailable(&shared.language),
                    );
                    shared.kill_process().await;
                    break;
                }
            }
            Outgoing::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

struct SessionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionTasks {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// One supervised connection to a language server.
pub(crate) struct ServerSession {
    shared: Arc<SessionShared>,
    root: PathBuf,
    timeouts: TimeoutConfig,
    /// Never reset, so ids are unique for the session's lifetime.
    next_id: AtomicU64,
    outbox: mpsc::UnboundedSender<Outgoing>,
    tasks: Mutex<Option<SessionTasks>>,
}

impl ServerSession {
    /// Launch the server and begin the handshake in the background.
    ///
    /// Returns once the process is spawned; the session is `Starting` until
    /// the server answers `initialize`.
    pub fn start(
        descriptor: &LanguageDescriptor,
        root: &Path,
        launcher: &dyn Launcher,
        router: Arc<DiagnosticsRouter>,
        timeouts: TimeoutConfig,
    ) -> LspResult<Arc<Self>> {
        let language = descriptor.language_id();
        let root_uri = protocol::path_to_file_uri(root)
            .map_err(|e| LspError::launch_failure(language, e.to_string()))?;
        let io = launcher.launch(descriptor, root)?;

        let shared = Arc::new(SessionShared::new(
            language,
            SessionState::Starting,
            Arc::clone(&router),
            io.process,
        ));
        router.publish_state(language, SessionState::Starting, None);

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let session = Self {
            shared: Arc::clone(&shared),
            root: root.to_path_buf(),
            timeouts,
            next_id: AtomicU64::new(1),
            outbox: outbox.clone(),
            tasks: Mutex::new(None),
        };

        let init_id = session.allocate_id();
        let pending = shared
            .dispatcher
            .register(init_id, RequestKind::Initialize, None)?;
        let params = protocol::initialize_params(root_uri.as_str(), descriptor.initialization_options());
        let frame = serde_json::to_value(Request::new(init_id, protocol::INITIALIZE, Some(params)))
            .map_err(|e| LspError::launch_failure(language, format!("serializing initialize: {e}")))?;
        let init = Handshake {
            frame,
            pending,
            timeout: RequestKind::Initialize.timeout(&timeouts),
        };

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), io.reader, outbox));
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), io.writer, outbox_rx, init));
        *lock(&session.tasks) = Some(SessionTasks { reader, writer });

        tracing::info!(language = %language, root = %root.display(), "Language server session starting");
        Ok(Arc::new(session))
    }

    /// A session whose launch failed. It stays `Degraded` so the manager does
    /// not retry on every open.
    pub fn failed(
        language: &str,
        root: &Path,
        router: Arc<DiagnosticsRouter>,
        timeouts: TimeoutConfig,
        error: &LspError,
    ) -> Arc<Self> {
        let shared = Arc::new(SessionShared::new(
            language,
            SessionState::Degraded,
            Arc::clone(&router),
            None,
        ));
        shared.dispatcher.close(&LspError::unavailable(language));
        router.publish_state(language, SessionState::Degraded, Some(error.to_string()));

        let (outbox, _) = mpsc::unbounded_channel();
        Arc::new(Self {
            shared,
            root: root.to_path_buf(),
            timeouts,
            next_id: AtomicU64::new(1),
            outbox,
            tasks: Mutex::new(None),
        })
    }

    pub fn language(&self) -> &str {
        &self.shared.language
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether the server died after a successful handshake. Such a session
    /// is replaced on the next document sync; one that never became ready
    /// stays degraded.
    pub fn needs_relaunch(&self) -> bool {
        self.state() == SessionState::Degraded && self.shared.reached_ready.load(Ordering::Acquire)
    }

    pub fn open_documents(&self) -> usize {
        self.shared.documents().len()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── document sync ──────────────────────────────────────────────────

    pub fn open_document(&self, uri: &str, content: &str) {
        let language = self.shared.language.clone();
        self.sync(uri, |docs| docs.open(uri, &language, content));
    }

    /// Sends didChange, or didOpen at version 1 if the session has not
    /// seen the document yet (e.g. after a restart).
    pub fn change_document(&self, uri: &str, content: &str) {
        let language = self.shared.language.clone();
        self.sync(uri, |docs| {
            if docs.is_open(uri) {
                docs.change(uri, content)
            } else {
                docs.open(uri, &language, content)
            }
        });
    }

    pub fn close_document(&self, uri: &str) {
        self.sync(uri, |docs| docs.close(uri));
    }

    /// Mutate the tracker and enqueue its message under the tracker lock,
    /// which is what keeps per-URI notifications in issue order.
    fn sync(&self, uri: &str, apply: impl FnOnce(&mut DocumentSyncTracker) -> Option<SyncMessage>) {
        let mut docs = self.shared.documents();
        if !self.state().accepts_requests() {
            tracing::trace!(language = %self.language(), uri = %uri, "Skipping sync on unavailable session");
            return;
        }
        let Some(msg) = apply(&mut docs) else {
            return;
        };
        let method = msg.method;
        tracing::debug!(
            language = %self.language(),
            uri = %uri,
            method,
            version = docs.version(uri),
            "Queueing document sync"
        );
        let frame = Notification::new(msg.method, Some(msg.params));
        let delivered = serde_json::to_value(&frame)
            .ok()
            .is_some_and(|frame| self.outbox.send(Outgoing::Frame(frame)).is_ok());
        drop(docs);
        if !delivered {
            self.shared.degrade(
                format!("could not queue {method}"),
                &LspError::unavailable(self.language()),
            );
        }
    }

    // ── requests ───────────────────────────────────────────────────────

    fn begin_request(
        &self,
        kind: RequestKind,
        params: serde_json::Value,
        document: Option<&str>,
    ) -> LspResult<PendingResponse> {
        if !self.state().accepts_requests() {
            return Err(LspError::unavailable(self.language()));
        }
        let id = self.allocate_id();
        let pending = self.shared.dispatcher.register(id, kind, document)?;
        let frame = serde_json::to_value(Request::new(id, kind.method(), Some(params)))
            .map_err(|e| LspError::MalformedMessage(e.to_string()))?;
        if self.outbox.send(Outgoing::Frame(frame)).is_err() {
            // Writer is gone; resolve now rather than wait out the timeout.
            self.shared
                .dispatcher
                .fail(id, LspError::unavailable(self.language()));
        }
        Ok(pending)
    }

    /// Completion at a one-based position. Superseded requests yield `[]`.
    pub async fn completion(&self, uri: &str, position: Position) -> LspResult<Vec<CompletionItem>> {
        let wire = position::to_wire(self.shared.documents().text(uri), position);
        let pending = self.begin_request(
            RequestKind::Completion,
            protocol::completion_params(uri, wire),
            Some(uri),
        )?;
        match pending
            .wait(RequestKind::Completion.timeout(&self.timeouts))
            .await?
        {
            Some(result) => protocol::parse_completion_response(result),
            None => Ok(Vec::new()),
        }
    }

    pub async fn hover(&self, uri: &str, position: Position) -> LspResult<Option<HoverInfo>> {
        let text = self.shared.documents().text(uri).map(str::to_owned);
        let wire = position::to_wire(text.as_deref(), position);
        let pending = self.begin_request(
            RequestKind::Hover,
            protocol::text_document_position_params(uri, wire),
            Some(uri),
        )?;
        match pending.wait(RequestKind::Hover.timeout(&self.timeouts)).await? {
            Some(result) => protocol::parse_hover_response(result, text.as_deref()),
            None => Ok(None),
        }
    }

    // ── teardown ───────────────────────────────────────────────────────

    /// Tear the session down: fail pending requests, ask the server to shut
    /// down, close the transport and kill the process.
    pub async fn terminate(&self) {
        let was_ready = self.state() == SessionState::Ready;
        if !self.shared.transition(SessionState::Terminated, None) {
            return;
        }
        let terminated = LspError::terminated(self.language());
        let failed = self.shared.dispatcher.fail_all(&terminated);
        let released = self.shared.documents().clear();
        tracing::info!(
            language = %self.language(),
            failed_requests = failed,
            released_documents = released,
            "Terminating language server session"
        );

        if was_ready {
            self.graceful_shutdown().await;
        }

        // Anything registered in the meantime fails too.
        self.shared.dispatcher.close(&terminated);
        let _ = self.outbox.send(Outgoing::Close);

        let tasks = lock(&self.tasks).take();
        if let Some(mut tasks) = tasks {
            // Let the writer flush `exit` and close the server's stdin.
            if tokio::time::timeout(self.timeouts.shutdown(), &mut tasks.writer)
                .await
                .is_err()
            {
                tracing::debug!("LSP '{}' writer did not drain in time", self.language());
            }
            tasks.abort();
        }

        if let Some(mut child) = self.shared.process.lock().await.take() {
            let exited = tokio::time::timeout(self.timeouts.shutdown(), child.wait()).await;
            if exited.is_err() {
                tracing::debug!("LSP '{}' didn't exit in time, killing", self.language());
                let _ = child.kill().await;
            }
        }
    }

    async fn graceful_shutdown(&self) {
        let id = self.allocate_id();
        let Ok(pending) = self
            .shared
            .dispatcher
            .register(id, RequestKind::Shutdown, None)
        else {
            return;
        };
        let request = Request::new(id, protocol::SHUTDOWN, None);
        let Ok(frame) = serde_json::to_value(&request) else {
            return;
        };
        if self.outbox.send(Outgoing::Frame(frame)).is_err() {
            return;
        }
        if pending
            .wait(RequestKind::Shutdown.timeout(&self.timeouts))
            .await
            .is_ok()
            && let Ok(exit) = serde_json::to_value(Notification::new(protocol::EXIT, None))
        {
            let _ = self.outbox.send(Outgoing::Frame(exit));
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.abort();
        }
    }
}
