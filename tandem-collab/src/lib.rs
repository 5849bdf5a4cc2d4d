//! # tandem-collab: peer-to-peer pairing sessions for Tandem
//!
//! Two participants find each other through a rendezvous service, open one
//! direct connection, and then either keep a shared board in sync or hold a
//! video call over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Signaling    ┌──────────────┐
//! │ PeerSession  │ ◄────────────► │ PeerSession  │
//! │ (host)       │  LocalHub /    │ (joiner)     │
//! └──────┬───────┘  WS relay      └──────┬───────┘
//!        │                               │
//!        ├── ConnectionManager           ├── ConnectionManager
//!        ├── SyncEngine ── Board         ├── SyncEngine ── Board
//!        └── MediaSession                └── MediaSession
//! ```
//!
//! ## Modules
//!
//! - [`rendezvous`]: session identity and the signaling backend seam
//! - [`connection`]: connection lifecycle state machine
//! - [`sync`]: whole-snapshot sync with echo suppression
//! - [`media`]: local/remote media streams and call control
//! - [`room`]: host/joiner role and shareable room links
//! - [`session`]: the per-session owner that drives all of the above
//! - [`local`]: in-process rendezvous hub
//! - [`relay`]: WebSocket relay backend
//! - [`protocol`]: binary sync messages

pub mod config;
pub mod connection;
pub mod error;
pub mod local;
pub mod media;
pub mod protocol;
pub mod relay;
pub mod rendezvous;
pub mod room;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::{RelayConfig, SessionConfig, SessionMode};
pub use connection::{
    Connection, ConnectionEvent, ConnectionManager, ConnectionState, Direction, Transition,
    TransitionError,
};
pub use error::CollabError;
pub use local::{LocalRendezvous, LocalSignaling};
pub use media::{
    LoopbackDevices, MediaConstraints, MediaDevices, MediaSession, MediaStream, MediaTrack,
    TrackKind, TrackState,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use relay::{RelayFrame, RelaySignaling};
pub use rendezvous::{
    Channel, EventReceiver, EventSender, LinkId, PeerEvent, RendezvousClient, SessionId,
    Signaling, SignalingFactory,
};
pub use room::{Room, RoomAddress, RoomPlan, RoomRole, DEFAULT_ROOM_PARAM};
pub use session::{PeerSession, SessionStatus};
pub use sync::{EchoSuppressionWindow, SyncEngine, SyncStats};
