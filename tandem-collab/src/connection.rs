//! Connection lifecycle: one transport to one remote peer.
//!
//! ```text
//!            TransportReady        MessageReceived
//!  Pending ─────────────────► Open ───────────────► Active
//!     │                        │                      │
//!     │ RemoteClose            │ LocalClose           │ LocalClose
//!     ▼                        │ RemoteClose          │ RemoteClose
//!  Failed ◄── TransportError ──┴──────────┬───────────┘
//!                                         ▼
//!                                       Closed
//! ```
//!
//! `Closed` and `Failed` are terminal. A later session needs a new
//! [`Connection`].

use std::time::Instant;

use thiserror::Error;

use crate::media::MediaStream;
use crate::rendezvous::{Channel, LinkId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, awaiting transport negotiation.
    Pending,
    /// Transport ready, no application traffic yet.
    Open,
    /// Application traffic flowing.
    Active,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Open or Active.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    TransportReady,
    MessageReceived,
    LocalClose,
    RemoteClose,
    TransportError(String),
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::TransportReady => "TransportReady",
            Self::MessageReceived => "MessageReceived",
            Self::LocalClose => "LocalClose",
            Self::RemoteClose => "RemoteClose",
            Self::TransportError(_) => "TransportError",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("connection {link} is already {state:?}")]
    Terminal {
        link: LinkId,
        state: ConnectionState,
    },
    #[error("{event} is not valid while {state:?}")]
    Invalid {
        state: ConnectionState,
        event: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// True if this transition moved into `state`.
    pub fn entered(&self, state: ConnectionState) -> bool {
        self.from != state && self.to == state
    }
}

#[derive(Debug)]
pub struct Connection {
    link: LinkId,
    remote: SessionId,
    direction: Direction,
    channel: Channel,
    state: ConnectionState,
    created_at: Instant,
    opened_at: Option<Instant>,
    failure: Option<String>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
}

impl Connection {
    pub fn outbound(link: LinkId, remote: SessionId, channel: Channel) -> Self {
        Self::new(link, remote, Direction::Outbound, channel)
    }

    pub fn inbound(link: LinkId, remote: SessionId, channel: Channel) -> Self {
        Self::new(link, remote, Direction::Inbound, channel)
    }

    fn new(link: LinkId, remote: SessionId, direction: Direction, channel: Channel) -> Self {
        Self {
            link,
            remote,
            direction,
            channel,
            state: ConnectionState::Pending,
            created_at: Instant::now(),
            opened_at: None,
            failure: None,
            local_stream: None,
            remote_stream: None,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn remote(&self) -> &SessionId {
        &self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the transport became ready.
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Reason of the transport error that failed this connection.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn attach_local_stream(&mut self, stream: MediaStream) {
        self.local_stream = Some(stream);
    }

    pub fn attach_remote_stream(&mut self, stream: MediaStream) {
        self.remote_stream = Some(stream);
    }

    /// Apply one lifecycle event.
    ///
    /// Entering a terminal state stops every attached local media track
    /// before returning.
    pub fn transition(&mut self, event: ConnectionEvent) -> Result<Transition, TransitionError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let from = self.state;
        let to = match (from, &event) {
            (S::Closed | S::Failed, _) => {
                return Err(TransitionError::Terminal {
                    link: self.link,
                    state: from,
                })
            }
            (S::Pending, E::TransportReady) => S::Open,
            (S::Open | S::Active, E::TransportReady) => from,
            (S::Pending, E::MessageReceived) => {
                return Err(TransitionError::Invalid {
                    state: from,
                    event: event.name(),
                })
            }
            (S::Open | S::Active, E::MessageReceived) => S::Active,
            (_, E::LocalClose) => S::Closed,
            (S::Pending, E::RemoteClose) => S::Failed,
            (_, E::RemoteClose) => S::Closed,
            (_, E::TransportError(_)) => S::Failed,
        };

        if let E::TransportError(reason) = event {
            self.failure = Some(reason);
        }
        if from == S::Pending && to == S::Open {
            self.opened_at = Some(Instant::now());
        }
        self.state = to;

        if from != to {
            log::info!(
                "{:?} {:?} connection {} with {}: {from:?} -> {to:?}",
                self.direction,
                self.channel,
                self.link,
                self.remote
            );
        }
        if to.is_terminal() {
            self.release_media();
        }

        Ok(Transition { from, to })
    }

    fn release_media(&mut self) {
        if let Some(stream) = &self.local_stream {
            let stopped = stream.stop_all();
            if stopped > 0 {
                log::debug!("Stopped {stopped} tracks for connection {}", self.link);
            }
        }
        self.remote_stream = None;
    }
}

/// Owns the session's single connection.
///
/// A new connection always supersedes the previous one, which is closed
/// before the new one is installed. Events for any other link are stale.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    current: Option<Connection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Connection> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Connection> {
        self.current.as_mut()
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.current.as_ref().map(|c| c.state())
    }

    pub fn is_active(&self) -> bool {
        self.state() == Some(ConnectionState::Active)
    }

    /// The current connection if `link` is its link.
    pub fn get_mut(&mut self, link: LinkId) -> Option<&mut Connection> {
        self.current.as_mut().filter(|c| c.link() == link)
    }

    /// Install `next`, closing whatever was there first.
    ///
    /// Returns the superseded connection (already in a terminal state) so
    /// the caller can release its link.
    pub fn promote(&mut self, next: Connection) -> Option<Connection> {
        let superseded = self.current.take().map(|mut old| {
            if !old.state().is_terminal() {
                log::info!(
                    "Connection {} with {} superseded by {}",
                    old.link(),
                    old.remote(),
                    next.link()
                );
                // Non-terminal, so this cannot fail.
                let _ = old.transition(ConnectionEvent::LocalClose);
            }
            old
        });
        self.current = Some(next);
        superseded
    }

    /// Route `event` to the connection owning `link`.
    ///
    /// Returns `Ok(None)` for stale links.
    pub fn handle(
        &mut self,
        link: LinkId,
        event: ConnectionEvent,
    ) -> Result<Option<Transition>, TransitionError> {
        match self.get_mut(link) {
            Some(conn) => conn.transition(event).map(Some),
            None => {
                log::debug!("Ignoring {} for stale link {link}", event.name());
                Ok(None)
            }
        }
    }

    /// Locally close the current connection if it is not terminal yet.
    pub fn close_current(&mut self) -> Option<Transition> {
        let conn = self.current.as_mut()?;
        if conn.state().is_terminal() {
            return None;
        }
        conn.transition(ConnectionEvent::LocalClose).ok()
    }
}
