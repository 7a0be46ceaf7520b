//! Correlates request ids with their responses.
//!
//! Every pending request holds a single-resolution slot that is filled
//! exactly once: with the response, with `Superseded`, or with a failure.
//! Timeouts and dropped futures remove the entry so nothing waits forever
//! and the map never grows without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::TimeoutConfig;
use crate::error::LspError;
use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Initialize,
    Completion,
    Hover,
    Shutdown,
}

impl RequestKind {
    pub fn method(self) -> &'static str {
        match self {
            Self::Initialize => protocol::INITIALIZE,
            Self::Completion => protocol::COMPLETION,
            Self::Hover => protocol::HOVER,
            Self::Shutdown => protocol::SHUTDOWN,
        }
    }

    pub fn timeout(self, timeouts: &TimeoutConfig) -> Duration {
        match self {
            Self::Initialize => timeouts.initialize(),
            Self::Completion => timeouts.completion(),
            Self::Hover => timeouts.hover(),
            Self::Shutdown => timeouts.shutdown(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Response(serde_json::Value),
    /// A newer completion for the same document replaced this one.
    Superseded,
    Failed(LspError),
}

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    created_at: Instant,
    document: Option<String>,
    slot: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct DispatcherState {
    pending: HashMap<u64, PendingRequest>,
    /// Latest completion request id per document URI.
    latest_completion: HashMap<String, u64>,
    /// Set once the session is gone; later registrations fail immediately.
    closed: Option<LspError>,
}

impl DispatcherState {
    fn take(&mut self, id: u64) -> Option<PendingRequest> {
        let request = self.pending.remove(&id)?;
        if let Some(uri) = &request.document
            && self.latest_completion.get(uri) == Some(&id)
        {
            self.latest_completion.remove(uri);
        }
        Some(request)
    }
}

#[derive(Debug)]
pub(crate) struct RequestDispatcher {
    language: String,
    state: Mutex<DispatcherState>,
}

impl RequestDispatcher {
    pub fn new(language: &str) -> Arc<Self> {
        Arc::new(Self {
            language: language.to_string(),
            state: Mutex::new(DispatcherState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a pending slot for `id`.
    ///
    /// A completion registered for `document` supersedes any completion
    /// still pending for the same document.
    pub fn register(
        self: &Arc<Self>,
        id: u64,
        kind: RequestKind,
        document: Option<&str>,
    ) -> Result<PendingResponse, LspError> {
        let (slot, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }

        let document = document.map(str::to_string);
        if kind == RequestKind::Completion
            && let Some(uri) = &document
            && let Some(previous) = state.latest_completion.insert(uri.clone(), id)
            && let Some(superseded) = state.pending.remove(&previous)
        {
            tracing::debug!(
                language = %self.language,
                id = previous,
                uri = %uri,
                "Completion superseded"
            );
            let _ = superseded.slot.send(Outcome::Superseded);
        }

        state.pending.insert(
            id,
            PendingRequest {
                kind,
                created_at: Instant::now(),
                document,
                slot,
            },
        );

        Ok(PendingResponse {
            id,
            kind,
            rx,
            dispatcher: Arc::clone(self),
        })
    }

    /// Deliver a response frame. Returns false for unknown (late or stale) ids.
    pub fn resolve(&self, id: u64, body: serde_json::Value) -> bool {
        let Some(request) = self.lock().take(id) else {
            tracing::trace!(language = %self.language, id, "Response for unknown request id");
            return false;
        };
        tracing::trace!(
            language = %self.language,
            id,
            method = request.kind.method(),
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "Response received"
        );
        let _ = request.slot.send(Outcome::Response(body));
        true
    }

    pub fn fail(&self, id: u64, error: LspError) {
        if let Some(request) = self.lock().take(id) {
            let _ = request.slot.send(Outcome::Failed(error));
        }
    }

    /// Fail every pending request; the dispatcher stays open.
    pub fn fail_all(&self, error: &LspError) -> usize {
        self.drain(error, false)
    }

    /// Fail every pending request and refuse new ones.
    ///
    /// Draining and closing happen under one lock, so no request can slip in
    /// between and be left unresolved.
    pub fn close(&self, error: &LspError) -> usize {
        self.drain(error, true)
    }

    fn drain(&self, error: &LspError, close: bool) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.lock();
            if close && state.closed.is_none() {
                state.closed = Some(error.clone());
            }
            state.latest_completion.clear();
            state.pending.drain().map(|(_, request)| request).collect()
        };
        let count = drained.len();
        for request in drained {
            let _ = request.slot.send(Outcome::Failed(error.clone()));
        }
        count
    }

    fn cancel(&self, id: u64) {
        self.lock().take(id);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// The caller's half of a pending request.
///
/// Dropping it discards local interest; no protocol cancel is sent.
#[derive(Debug)]
pub(crate) struct PendingResponse {
    id: u64,
    kind: RequestKind,
    rx: oneshot::Receiver<Outcome>,
    dispatcher: Arc<RequestDispatcher>,
}

impl PendingResponse {
    /// Wait for the outcome, bounded by `timeout`.
    ///
    /// `Ok(None)` means the request was superseded.
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<serde_json::Value>, LspError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Outcome::Response(body))) => protocol::response_result(body).map(Some),
            Ok(Ok(Outcome::Superseded)) => Ok(None),
            Ok(Ok(Outcome::Failed(err))) => Err(err),
            Ok(Err(_)) => Err(LspError::terminated(&self.dispatcher.language)),
            Err(_) => {
                self.dispatcher.cancel(self.id);
                Err(LspError::ProtocolTimeout {
                    method: self.kind.method(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.dispatcher.cancel(self.id);
    }
}
