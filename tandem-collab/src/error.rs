//! Error taxonomy for the pairing layer.
//!
//! Every variant is handled at the component boundary where it occurs and
//! turned into a status line via [`CollabError::status`]; none of them is
//! allowed to take down the host process.

use tandem_core::SnapshotError;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::rendezvous::SessionId;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Rendezvous service unreachable or refused registration.
    #[error("signaling service unavailable: {0}")]
    SignalingUnavailable(String),

    /// Transport-level failure after the connection was requested.
    #[error("connection to {remote} failed: {reason}")]
    ConnectionFailed { remote: String, reason: String },

    /// The remote peer closed the connection.
    #[error("peer {0} disconnected")]
    RemoteDisconnected(SessionId),

    /// A received snapshot could not be applied.
    #[error("snapshot could not be applied: {0}")]
    SnapshotApply(#[from] SnapshotError),

    /// Camera or microphone permission refused.
    #[error("media acquisition denied: {0}")]
    MediaAcquisitionDenied(String),

    #[error("refusing to connect to own session {0}")]
    SelfConnect(SessionId),

    #[error("no open connection")]
    NotConnected,

    #[error("invalid room address: {0}")]
    InvalidAddress(#[from] url::ParseError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Human-readable status line for display.
    pub fn status(&self) -> String {
        match self {
            Self::SignalingUnavailable(_) => {
                "Could not reach the pairing service. Reload to try again.".to_string()
            }
            Self::ConnectionFailed { remote, .. } => {
                format!("Connection to {remote} failed. Rejoin the room to retry.")
            }
            Self::RemoteDisconnected(_) => "Peer left".to_string(),
            Self::SnapshotApply(_) => "Received an unreadable board update".to_string(),
            Self::MediaAcquisitionDenied(_) => {
                "Camera or microphone access was denied".to_string()
            }
            Self::SelfConnect(_) => "This is your own room link".to_string(),
            Self::NotConnected => "Not connected".to_string(),
            Self::InvalidAddress(_) => "The room link is not valid".to_string(),
            Self::Protocol(e) => format!("Protocol error: {e}"),
        }
    }

    /// Whether the feature can continue after this error without a reload.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SignalingUnavailable(_) | Self::InvalidAddress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines() {
        let left = CollabError::RemoteDisconnected(SessionId::from("abc123"));
        assert_eq!(left.status(), "Peer left");

        let failed = CollabError::ConnectionFailed {
            remote: "abc123".into(),
            reason: "ice timeout".into(),
        };
        assert!(failed.status().contains("abc123"));
        assert!(failed.to_string().contains("ice timeout"));
    }

    #[test]
    fn test_recoverability() {
        assert!(!CollabError::SignalingUnavailable("down".into()).is_recoverable());
        assert!(CollabError::NotConnected.is_recoverable());
        assert!(CollabError::MediaAcquisitionDenied("no".into()).is_recoverable());
    }

    #[test]
    fn test_snapshot_error_converts() {
        let err: CollabError = SnapshotError::Malformed("eof".into()).into();
        assert!(matches!(err, CollabError::SnapshotApply(_)));
    }
}
