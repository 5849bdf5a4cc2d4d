//! WebSocket relay signaling backend.
//!
//! A relay server hands out session ids and forwards link setup and data
//! frames between registered clients. It carries data links only; media
//! needs a peer-to-peer transport.
//!
//! ```text
//! RelaySignaling ──► out_tx ──► writer task ──► WebSocket ──► relay
//!       ▲                                                        │
//!       └──── PeerEvent ◄── reader task ◄── WebSocket ◄──────────┘
//! ```
//!
//! Every frame is a bincode-encoded [`RelayFrame`] in one binary message.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::CollabError;
use crate::media::MediaStream;
use crate::protocol::ProtocolError;
use crate::rendezvous::{Channel, EventSender, LinkId, PeerEvent, SessionId, Signaling};

/// Frames exchanged with the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay: issue me an id.
    Register,
    /// Relay → client: your id.
    Registered { id: SessionId },
    /// Client → relay: open `link` to `to`.
    Connect {
        link: LinkId,
        to: SessionId,
        channel: Channel,
    },
    /// Relay → client: `from` wants `link`.
    Incoming {
        link: LinkId,
        from: SessionId,
        channel: Channel,
    },
    /// Client → relay: accept `link`.
    Accept { link: LinkId },
    /// Relay → both ends: `link` is usable.
    Ready { link: LinkId },
    /// Either direction: application payload on `link`.
    Data { link: LinkId, payload: Vec<u8> },
    /// Client → relay: close `link`.
    Close { link: LinkId },
    /// Relay → client: the other end closed `link`.
    Closed { link: LinkId },
    /// Relay → client: something went wrong, optionally on a link.
    Error {
        link: Option<LinkId>,
        reason: String,
    },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(frame)
    }

    /// The session event this frame means for a client, if any.
    fn into_event(self) -> Option<PeerEvent> {
        match self {
            Self::Incoming {
                link,
                from,
                channel,
            } => Some(PeerEvent::Incoming {
                link,
                remote: from,
                channel,
            }),
            Self::Ready { link } => Some(PeerEvent::Ready { link }),
            Self::Data { link, payload } => Some(PeerEvent::Frame { link, payload }),
            Self::Closed { link } => Some(PeerEvent::RemoteClosed { link }),
            Self::Error {
                link: Some(link),
                reason,
            } => Some(PeerEvent::LinkError { link, reason }),
            Self::Error { link: None, reason } => {
                log::warn!("Relay error: {reason}");
                None
            }
            other => {
                log::debug!("Ignoring unexpected relay frame {other:?}");
                None
            }
        }
    }
}

/// Signaling over a WebSocket relay server.
pub struct RelaySignaling {
    config: RelayConfig,
    outgoing: Option<mpsc::UnboundedSender<RelayFrame>>,
    reader: Option<JoinHandle<()>>,
    local_id: Option<SessionId>,
}

impl RelaySignaling {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            outgoing: None,
            reader: None,
            local_id: None,
        }
    }

    /// Factory for [`RendezvousClient`](crate::rendezvous::RendezvousClient).
    pub fn factory(config: RelayConfig) -> impl FnMut() -> Self + Send + 'static {
        move || Self::new(config.clone())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn local_id(&self) -> Option<&SessionId> {
        self.local_id.as_ref()
    }

    async fn connect_and_register(&mut self, events: EventSender) -> Result<SessionId, CollabError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| CollabError::SignalingUnavailable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(Message::Binary(RelayFrame::Register.encode()?.into()))
            .await
            .map_err(|e| CollabError::SignalingUnavailable(e.to_string()))?;

        let id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data)? {
                    RelayFrame::Registered { id } => break id,
                    RelayFrame::Error { reason, .. } => {
                        return Err(CollabError::SignalingUnavailable(reason))
                    }
                    other => log::debug!("Ignoring {other:?} before registration"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(CollabError::SignalingUnavailable(
                        "relay closed during registration".to_string(),
                    ))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(CollabError::SignalingUnavailable(e.to_string())),
            }
        };

        // Writer task: forward queued frames to the socket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping relay frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: turn relay frames into session events
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                        Ok(frame) => {
                            if let Some(event) = frame.into_event() {
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => log::warn!("Undecodable relay frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("Relay socket error: {e}");
                        break e.to_string();
                    }
                }
            };
            let _ = events.send(PeerEvent::SignalingLost { reason });
        });

        self.outgoing = Some(out_tx);
        self.reader = Some(reader);
        self.local_id = Some(id.clone());
        Ok(id)
    }

    fn queue(&self, frame: RelayFrame) -> Result<(), CollabError> {
        let outgoing = self.outgoing.as_ref().ok_or_else(|| {
            CollabError::SignalingUnavailable("relay is not connected".to_string())
        })?;
        outgoing
            .send(frame)
            .map_err(|_| CollabError::SignalingUnavailable("relay connection closed".to_string()))
    }
}

impl Signaling for RelaySignaling {
    async fn register(&mut self, events: EventSender) -> Result<SessionId, CollabError> {
        let timeout = self.config.registration_timeout;
        match tokio::time::timeout(timeout, self.connect_and_register(events)).await {
            Ok(result) => result,
            Err(_) => Err(CollabError::SignalingUnavailable(format!(
                "no answer from relay within {timeout:?}"
            ))),
        }
    }

    fn connect(
        &mut self,
        remote: &SessionId,
        channel: Channel,
        _stream: Option<MediaStream>,
    ) -> Result<LinkId, CollabError> {
        if channel == Channel::Media {
            return Err(CollabError::ConnectionFailed {
                remote: remote.to_string(),
                reason: "relay does not carry media".to_string(),
            });
        }
        let link = Uuid::new_v4();
        self.queue(RelayFrame::Connect {
            link,
            to: remote.clone(),
            channel,
        })?;
        Ok(link)
    }

    fn accept(&mut self, link: LinkId, stream: Option<MediaStream>) -> Result<(), CollabError> {
        if stream.is_some() {
            return Err(CollabError::ConnectionFailed {
                remote: link.to_string(),
                reason: "relay does not carry media".to_string(),
            });
        }
        self.queue(RelayFrame::Accept { link })
    }

    fn send(&mut self, link: LinkId, payload: Vec<u8>) -> Result<(), CollabError> {
        self.queue(RelayFrame::Data { link, payload })
    }

    fn close(&mut self, link: LinkId) {
        let _ = self.queue(RelayFrame::Close { link });
    }

    fn shutdown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing = None;
        if let Some(id) = self.local_id.take() {
            log::debug!("Relay session {id} shut down");
        }
    }
}

impl Drop for RelaySignaling {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_frame_encoding() {
        let frame = RelayFrame::Connect {
            link: Uuid::new_v4(),
            to: SessionId::from("abc123"),
            channel: Channel::Data,
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);

        let mut padded = bytes;
        padded.push(0);
        assert!(matches!(
            RelayFrame::decode(&padded),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_frames_map_to_events() {
        let link = Uuid::new_v4();
        assert!(matches!(
            RelayFrame::Incoming {
                link,
                from: SessionId::from("xyz789"),
                channel: Channel::Data,
            }
            .into_event(),
            Some(PeerEvent::Incoming { .. })
        ));
        assert!(matches!(
            RelayFrame::Closed { link }.into_event(),
            Some(PeerEvent::RemoteClosed { .. })
        ));
        assert!(matches!(
            RelayFrame::Error {
                link: Some(link),
                reason: "unknown peer".into(),
            }
            .into_event(),
            Some(PeerEvent::LinkError { .. })
        ));
        assert!(RelayFrame::Register.into_event().is_none());
    }

    #[test]
    fn test_media_is_refused() {
        let mut relay = RelaySignaling::new(RelayConfig::default());
        let result = relay.connect(&SessionId::from("abc123"), Channel::Media, None);
        assert!(matches!(result, Err(CollabError::ConnectionFailed { .. })));
    }

    #[test]
    fn test_operations_before_register_fail() {
        let mut relay = RelaySignaling::new(RelayConfig::default());
        let result = relay.connect(&SessionId::from("abc123"), Channel::Data, None);
        assert!(matches!(result, Err(CollabError::SignalingUnavailable(_))));
        assert!(relay.send(Uuid::new_v4(), vec![1]).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_relay() {
        // Port 9 (discard) is closed on any sane test host.
        let mut relay = RelaySignaling::new(RelayConfig {
            url: "ws://127.0.0.1:9/relay".to_string(),
            registration_timeout: Duration::from_secs(2),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            relay.register(tx).await,
            Err(CollabError::SignalingUnavailable(_))
        ));
        assert!(relay.local_id().is_none());
    }
}
