//! Normalizes pushed diagnostics and fans them out.
//!
//! Each publish fully replaces the file's previous diagnostics. Subscribers
//! receive every publish (including empty ones, which mean "all clear");
//! the store keeps the latest non-empty set per file for late readers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::position;
use crate::protocol::{self, WireDiagnostic};
use crate::types::{Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, LspEvent, SessionState};

/// Convert wire diagnostics to display form.
///
/// `text` is the document as last synced, used for UTF-16 offset conversion.
pub(crate) fn normalize(raw: Vec<WireDiagnostic>, text: Option<&str>) -> Vec<Diagnostic> {
    raw.into_iter()
        .map(|d| {
            Diagnostic::new(
                DiagnosticSeverity::from_lsp(d.severity),
                position::range_from_wire(text, d.range.start, d.range.end),
                d.message,
                d.source,
                d.code.map(protocol::WireCode::into_string),
            )
        })
        .collect()
}

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<String, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    pub fn update(&mut self, uri: &str, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(uri);
        } else {
            self.data.insert(uri.to_string(), items);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(String, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        // Sort: files with errors first, then alphabetically
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[derive(Debug)]
pub(crate) struct DiagnosticsRouter {
    events: broadcast::Sender<LspEvent>,
    store: Mutex<DiagnosticsStore>,
}

impl DiagnosticsRouter {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            events,
            store: Mutex::new(DiagnosticsStore::default()),
        }
    }

    fn store(&self) -> MutexGuard<'_, DiagnosticsStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LspEvent> {
        self.events.subscribe()
    }

    /// Replace `uri`'s diagnostics and notify subscribers.
    pub fn publish(&self, uri: &str, raw: Vec<WireDiagnostic>, text: Option<&str>) {
        let items = normalize(raw, text);
        tracing::debug!(uri = %uri, count = items.len(), "Diagnostics updated");
        self.store().update(uri, items.clone());
        // No receivers is fine; the store still has the latest state.
        let _ = self.events.send(LspEvent::Diagnostics {
            uri: uri.to_string(),
            path: protocol::file_uri_to_path(uri),
            items,
        });
    }

    pub fn publish_state(&self, language: &str, state: SessionState, reason: Option<String>) {
        let _ = self.events.send(LspEvent::SessionState {
            language: language.to_string(),
            state,
            reason,
        });
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.store().snapshot()
    }

    pub fn clear(&self) {
        self.store().clear();
    }
}
