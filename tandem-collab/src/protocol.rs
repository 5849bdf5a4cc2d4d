//! Binary protocol spoken on an open data connection.
//!
//! Wire format (bincode standard config, serde adapter):
//! ```text
//! ┌─────────────┬──────────────────────────────┐
//! │ variant tag │ payload                      │
//! │ varint      │ Handshake: none              │
//! │             │ SnapshotUpdate: len + bytes  │
//! └─────────────┴──────────────────────────────┘
//! ```
//!
//! There is no acknowledgement, sequence number or version vector.
//! Ordering comes from the transport; conflicts resolve as last-writer-wins.

use serde::{Deserialize, Serialize};
use tandem_core::Snapshot;

/// Message kinds, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// "I am ready, send me your current state"
    Handshake = 1,
    /// Full document replacement
    SnapshotUpdate = 2,
}

/// Top-level sync message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    Handshake,
    SnapshotUpdate(Snapshot),
}

impl SyncMessage {
    pub fn snapshot_update(snapshot: Snapshot) -> Self {
        Self::SnapshotUpdate(snapshot)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Handshake => MessageType::Handshake,
            Self::SnapshotUpdate(_) => MessageType::SnapshotUpdate,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format. The whole buffer must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    TrailingBytes(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::TrailingBytes(n) => write!(f, "{n} unexpected trailing bytes"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let encoded = SyncMessage::Handshake.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded, SyncMessage::Handshake);
        assert_eq!(decoded.message_type(), MessageType::Handshake);
        // Tag only
        assert_eq!(encoded.len(), 1);
    }

    #[test]
    fn test_snapshot_update_roundtrip() {
        let snapshot = Snapshot::new(br#"{"format":1,"elements":[]}"#.to_vec());
        let msg = SyncMessage::snapshot_update(snapshot.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.message_type(), MessageType::SnapshotUpdate);
        assert_eq!(decoded, SyncMessage::SnapshotUpdate(snapshot));
    }

    #[test]
    fn test_large_snapshot() {
        // Busy whiteboard: 256KB of JSON
        let snapshot = Snapshot::new(vec![b'x'; 256 * 1024]);
        let msg = SyncMessage::snapshot_update(snapshot);
        let encoded = msg.encode().unwrap();

        match SyncMessage::decode(&encoded).unwrap() {
            SyncMessage::SnapshotUpdate(s) => assert_eq!(s.len(), 256 * 1024),
            other => panic!("Expected SnapshotUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = SyncMessage::Handshake.encode().unwrap();
        encoded.extend_from_slice(&[0, 0]);
        assert_eq!(SyncMessage::decode(&encoded), Err(ProtocolError::TrailingBytes(2)));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Handshake as u8, 1);
        assert_eq!(MessageType::SnapshotUpdate as u8, 2);
    }
}
