//! Per-URI document version and content state.
//!
//! The tracker is the single source of ordering truth for sync
//! notifications: each call mutates state and yields at most one message,
//! which the session enqueues before the tracker lock is released.

use std::collections::HashMap;
use sha2::{Digest, Sha256};

use crate::protocol;

type ContentHash = [u8; 32];

fn content_hash(text: &str) -> ContentHash {
    Sha256::digest(text.as_bytes()).into()
}

/// A sync notification ready to be framed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyncMessage {
    pub method: &'static str,
    pub params: serde_json::Value,
}

#[derive(Debug)]
struct OpenDocument {
    /// Starts at 1; bumped on every didChange sent.
    version: i32,
    content_hash: ContentHash,
    /// Last-synced text, used for offset conversion.
    text: String,
}

#[derive(Debug, Default)]
pub(crate) struct DocumentSyncTracker {
    docs: HashMap<String, OpenDocument>,
}

impl DocumentSyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `uri` at version 1. Re-opening an open document sends nothing.
    pub fn open(&mut self, uri: &str, language_id: &str, content: &str) -> Option<SyncMessage> {
        if self.docs.contains_key(uri) {
            return None;
        }
        let doc = OpenDocument {
            version: 1,
            content_hash: content_hash(content),
            text: content.to_string(),
        };
        let params = protocol::did_open_params(uri, language_id, doc.version, content);
        self.docs.insert(uri.to_string(), doc);
        Some(SyncMessage {
            method: protocol::DID_OPEN,
            params,
        })
    }

    /// Bump the version and emit the full new content, unless unchanged.
    ///
    /// Returns `None` for unknown URIs too; callers decide whether to open.
    pub fn change(&mut self, uri: &str, content: &str) -> Option<SyncMessage> {
        let doc = self.docs.get_mut(uri)?;
        let hash = content_hash(content);
        if hash == doc.content_hash {
            return None;
        }
        doc.version += 1;
        doc.content_hash = hash;
        doc.text = content.to_string();
        Some(SyncMessage {
            method: protocol::DID_CHANGE,
            params: protocol::did_change_params(uri, doc.version, content),
        })
    }

    /// Emit didClose and forget the document. Unknown URIs are a no-op.
    pub fn close(&mut self, uri: &str) -> Option<SyncMessage> {
        self.docs.remove(uri)?;
        Some(SyncMessage {
            method: protocol::DID_CLOSE,
            params: protocol::did_close_params(uri),
        })
    }

    pub fn version(&self, uri: &str) -> Option<i32> {
        self.docs.get(uri).map(|doc| doc.version)
    }

    pub fn is_open(&self, uri: &str) -> bool {
        self.docs.contains_key(uri)
    }

    pub fn text(&self, uri: &str) -> Option<&str> {
        self.docs.get(uri).map(|doc| doc.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Drop every entry without emitting anything; used on teardown.
    pub fn clear(&mut self) -> usize {
        let count = self.docs.len();
        self.docs.clear();
        count
    }
}
