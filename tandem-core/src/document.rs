//! Document boundary consumed by the sync layer.
//!
//! The sync engine never looks inside a document. It only needs to:
//! - capture the whole state as an opaque [`Snapshot`]
//! - replace the whole state from a received [`Snapshot`]
//! - hear about every mutation, tagged with its [`ChangeOrigin`]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque serialization of an entire document at one instant.
///
/// Every broadcast carries one of these; there is no partial form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Snapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Who caused a document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Direct user input (drawing, typing, dragging).
    User,
    /// Replay, snapshot application, or any other code-driven mutation.
    Programmatic,
}

/// A single "document changed" notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub origin: ChangeOrigin,
    /// Local document version after the change.
    pub version: u64,
}

/// Failure to apply a snapshot. The document is left untouched.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error("incompatible snapshot format {found} (expected {expected})")]
    Incompatible { found: u32, expected: u32 },
}

pub type ListenerId = u64;

/// Callback invoked for every change notification.
pub type ChangeListener = Box<dyn FnMut(&ChangeNotice) + Send>;

/// The contract between a shared document and whoever keeps it in sync.
pub trait SharedDocument {
    /// Serialize the complete current state.
    fn capture_snapshot(&self) -> Snapshot;

    /// Replace the complete state. On error the previous state is retained.
    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Register a change listener.
    fn subscribe(&mut self, listener: ChangeListener) -> ListenerId;

    /// Remove a change listener. Returns `false` if it was not registered.
    fn unsubscribe(&mut self, id: ListenerId) -> bool;
}

/// Listener registry shared by document implementations.
#[derive(Default)]
pub struct ChangeFeed {
    listeners: Vec<(ListenerId, ChangeListener)>,
    next_id: ListenerId,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: ChangeListener) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Deliver a notice to every listener, in subscription order.
    pub fn notify(&mut self, notice: ChangeNotice) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&notice);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
