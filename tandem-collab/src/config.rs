//! Session and relay configuration.

use std::time::Duration;

use crate::media::MediaConstraints;
use crate::room::DEFAULT_ROOM_PARAM;

/// What a session carries once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Shared board over a data channel.
    #[default]
    Whiteboard,
    /// Audio/video over a media channel.
    Call,
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whiteboard or video call
    pub mode: SessionMode,
    /// Query parameter carrying the room id in shared links
    pub room_param: String,
    /// How long a just-applied remote snapshot suppresses local broadcasts
    pub echo_suppression: Duration,
    /// Upper bound on waiting for the rendezvous service to issue an id
    pub registration_timeout: Duration,
    /// Local media requested when placing or answering a call
    pub media: MediaConstraints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Whiteboard,
            room_param: DEFAULT_ROOM_PARAM.to_string(),
            echo_suppression: Duration::from_millis(50),
            registration_timeout: Duration::from_secs(5),
            media: MediaConstraints::default(),
        }
    }
}

impl SessionConfig {
    pub fn whiteboard() -> Self {
        Self::default()
    }

    pub fn call() -> Self {
        Self {
            mode: SessionMode::Call,
            ..Self::default()
        }
    }
}

/// WebSocket relay backend configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:9090/relay`
    pub url: String,
    /// Upper bound on connect + registration
    pub registration_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090/relay".to_string(),
            registration_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}
