//! Whole-snapshot document sync between exactly two peers.
//!
//! Protocol:
//! ```text
//!  joiner (outbound)                         host (inbound)
//!      │ ── Open ──► Handshake ─────────────────► │
//!      │                                          │ capture_snapshot()
//!      │ ◄───────────────── SnapshotUpdate ────── │
//!      │ arm echo window, apply_snapshot()        │
//!      │                                          │
//!      │ user edit ──► SnapshotUpdate ──────────► │ arm echo window, apply
//! ```
//!
//! Last snapshot received wins. Two edits made inside the same window on
//! both sides can overwrite each other; nothing detects that.

use std::time::{Duration, Instant};

use tandem_core::{ChangeOrigin, ListenerId, SharedDocument};

use crate::connection::Direction;
use crate::error::CollabError;
use crate::protocol::SyncMessage;
use crate::rendezvous::{EventSender, PeerEvent};

/// Set while a just-applied remote snapshot may still be echoing through
/// the document's change notifications.
#[derive(Debug, Clone, Copy)]
pub struct EchoSuppressionWindow {
    window: Duration,
    until: Option<Instant>,
}

impl EchoSuppressionWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            until: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn arm(&mut self, now: Instant) {
        self.until = Some(now + self.window);
    }

    pub fn is_armed(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Clear the flag once its deadline has passed. Returns true if cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.until {
            Some(until) if now >= until => {
                self.until = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.until
    }

    pub fn clear(&mut self) {
        self.until = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub handshakes_sent: u64,
    pub handshakes_received: u64,
    pub snapshots_sent: u64,
    pub snapshots_applied: u64,
    pub apply_failures: u64,
    pub echoes_suppressed: u64,
}

/// Drives the handshake + snapshot-broadcast protocol for one document.
#[derive(Debug)]
pub struct SyncEngine {
    suppression: EchoSuppressionWindow,
    subscription: Option<ListenerId>,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(echo_window: Duration) -> Self {
        Self {
            suppression: EchoSuppressionWindow::new(echo_window),
            subscription: None,
            stats: SyncStats::default(),
        }
    }

    /// Subscribe to `doc`'s change notifications, forwarding them as
    /// [`PeerEvent::DocumentChanged`].
    pub fn attach<D: SharedDocument>(&mut self, doc: &mut D, events: EventSender) {
        if self.subscription.is_some() {
            return;
        }
        let id = doc.subscribe(Box::new(move |notice| {
            let _ = events.send(PeerEvent::DocumentChanged(*notice));
        }));
        log::debug!("Document listener {id} attached");
        self.subscription = Some(id);
    }

    pub fn detach<D: SharedDocument>(&mut self, doc: &mut D) {
        if let Some(id) = self.subscription.take() {
            doc.unsubscribe(id);
            log::debug!("Document listener {id} detached");
        }
        self.suppression.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    /// The connection reached Open. Only the side that dialled asks for state.
    pub fn on_open(&mut self, direction: Direction) -> Option<SyncMessage> {
        match direction {
            Direction::Outbound => {
                self.stats.handshakes_sent += 1;
                Some(SyncMessage::Handshake)
            }
            Direction::Inbound => None,
        }
    }

    /// Handle a received message; returns the reply to send, if any.
    ///
    /// A snapshot that fails to apply leaves the document unchanged. The
    /// echo window is armed either way and expires on its timer.
    pub fn on_message<D: SharedDocument>(
        &mut self,
        doc: &mut D,
        msg: SyncMessage,
        now: Instant,
    ) -> Result<Option<SyncMessage>, CollabError> {
        match msg {
            SyncMessage::Handshake => {
                self.stats.handshakes_received += 1;
                self.stats.snapshots_sent += 1;
                Ok(Some(SyncMessage::SnapshotUpdate(doc.capture_snapshot())))
            }
            SyncMessage::SnapshotUpdate(snapshot) => {
                self.suppression.arm(now);
                match doc.apply_snapshot(&snapshot) {
                    Ok(()) => {
                        self.stats.snapshots_applied += 1;
                        log::debug!("Applied remote snapshot ({} bytes)", snapshot.len());
                        Ok(None)
                    }
                    Err(e) => {
                        self.stats.apply_failures += 1;
                        log::warn!("Discarding remote snapshot: {e}");
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// A local change happened. Broadcast only genuine user edits made
    /// outside the echo window on an active connection.
    pub fn on_local_change<D: SharedDocument>(
        &mut self,
        doc: &D,
        origin: ChangeOrigin,
        active: bool,
        now: Instant,
    ) -> Option<SyncMessage> {
        if origin != ChangeOrigin::User {
            return None;
        }
        if self.suppression.is_armed(now) {
            self.stats.echoes_suppressed += 1;
            log::trace!("Suppressed echo of remote snapshot");
            return None;
        }
        if !active {
            return None;
        }
        self.stats.snapshots_sent += 1;
        Some(SyncMessage::SnapshotUpdate(doc.capture_snapshot()))
    }

    /// Timer tick. Returns true if the echo window was just cleared.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        self.suppression.expire(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.suppression.deadline()
    }

    pub fn is_suppressing(&self, now: Instant) -> bool {
        self.suppression.is_armed(now)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }
}
