//! Rendezvous client: thin adapter over an external signaling service.
//!
//! The service hands out a [`SessionId`] per participant and relays the
//! connection setup between two peers. Everything it reports back
//! (incoming connections, link readiness, frames, closes, errors) arrives
//! as a [`PeerEvent`] on the channel passed to [`RendezvousClient::open`].

use std::future::Future;

use serde::{Deserialize, Serialize};
use tandem_core::ChangeNotice;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::CollabError;
use crate::media::MediaStream;

/// Opaque per-participant identity issued by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one transport link; both ends see the same id.
pub type LinkId = Uuid;

/// What a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Discrete sync messages (whiteboard).
    Data,
    /// A continuous media stream (video call).
    Media,
}

/// Everything that can happen to a session, delivered in order on one channel.
#[derive(Debug)]
pub enum PeerEvent {
    /// A remote peer asked to connect to us.
    Incoming {
        link: LinkId,
        remote: SessionId,
        channel: Channel,
    },
    /// The transport for `link` is ready.
    Ready { link: LinkId },
    /// An application frame arrived on `link`.
    Frame { link: LinkId, payload: Vec<u8> },
    /// The remote media stream for `link` is available.
    RemoteStream { link: LinkId, stream: MediaStream },
    /// The remote end closed `link`.
    RemoteClosed { link: LinkId },
    /// Transport error on `link`.
    LinkError { link: LinkId, reason: String },
    /// The signaling service went away.
    SignalingLost { reason: String },
    /// The local document changed.
    DocumentChanged(ChangeNotice),
}

pub type EventSender = mpsc::UnboundedSender<PeerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// A signaling backend.
///
/// Only `register` may wait on the network. Every other operation queues
/// its request and returns; results come back as [`PeerEvent`]s.
pub trait Signaling: Send {
    /// Obtain a session identity. Events for this identity go to `events`.
    fn register(
        &mut self,
        events: EventSender,
    ) -> impl Future<Output = Result<SessionId, CollabError>> + Send;

    /// Ask `remote` for a new link. `stream` is offered for media links.
    fn connect(
        &mut self,
        remote: &SessionId,
        channel: Channel,
        stream: Option<MediaStream>,
    ) -> Result<LinkId, CollabError>;

    /// Accept an incoming link, answering with `stream` for media links.
    fn accept(&mut self, link: LinkId, stream: Option<MediaStream>) -> Result<(), CollabError>;

    fn send(&mut self, link: LinkId, payload: Vec<u8>) -> Result<(), CollabError>;

    fn close(&mut self, link: LinkId);

    /// Release the identity and every link it owns.
    fn shutdown(&mut self);
}

pub type SignalingFactory<S> = Box<dyn FnMut() -> S + Send>;

/// Owns exactly one signaling backend per session.
///
/// The backend is built by the factory on every [`open`](Self::open), so a
/// failed registration never leaves partial state behind.
pub struct RendezvousClient<S: Signaling> {
    factory: SignalingFactory<S>,
    backend: Option<S>,
    local_id: Option<SessionId>,
}

impl<S: Signaling> RendezvousClient<S> {
    pub fn new(factory: impl FnMut() -> S + Send + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            backend: None,
            local_id: None,
        }
    }

    /// Register with the signaling service and return the local identity.
    pub async fn open(&mut self, events: EventSender) -> Result<SessionId, CollabError> {
        self.teardown();

        let mut backend = (self.factory)();
        match backend.register(events).await {
            Ok(id) => {
                log::info!("Registered with rendezvous service as {id}");
                self.local_id = Some(id.clone());
                self.backend = Some(backend);
                Ok(id)
            }
            Err(e) => {
                log::error!("Rendezvous registration failed: {e}");
                backend.shutdown();
                Err(e)
            }
        }
    }

    pub fn local_id(&self) -> Option<&SessionId> {
        self.local_id.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Outbound connect. Connecting to our own identity is refused before
    /// the backend is touched.
    pub fn connect_to(
        &mut self,
        remote: &SessionId,
        channel: Channel,
        stream: Option<MediaStream>,
    ) -> Result<LinkId, CollabError> {
        if self.local_id.as_ref() == Some(remote) {
            log::warn!("Refusing to connect to own session {remote}");
            return Err(CollabError::SelfConnect(remote.clone()));
        }
        let link = self.backend_mut()?.connect(remote, channel, stream)?;
        log::debug!("Requested {channel:?} link {link} to {remote}");
        Ok(link)
    }

    pub fn accept(&mut self, link: LinkId, stream: Option<MediaStream>) -> Result<(), CollabError> {
        self.backend_mut()?.accept(link, stream)
    }

    pub fn send(&mut self, link: LinkId, payload: Vec<u8>) -> Result<(), CollabError> {
        self.backend_mut()?.send(link, payload)
    }

    pub fn close(&mut self, link: LinkId) {
        if let Some(backend) = self.backend.as_mut() {
            backend.close(link);
        }
    }

    /// Drop the backend and forget the identity.
    pub fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
            if let Some(id) = self.local_id.as_ref() {
                log::info!("Released rendezvous identity {id}");
            }
        }
        self.local_id = None;
    }

    fn backend_mut(&mut self) -> Result<&mut S, CollabError> {
        self.backend.as_mut().ok_or_else(|| {
            CollabError::SignalingUnavailable("rendezvous client is not open".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Backend that records calls instead of talking to anything.
    struct RecordingSignaling {
        id: &'static str,
        fail_register: bool,
        connects: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Signaling for RecordingSignaling {
        async fn register(&mut self, _events: EventSender) -> Result<SessionId, CollabError> {
            if self.fail_register {
                Err(CollabError::SignalingUnavailable("offline".into()))
            } else {
                Ok(SessionId::from(self.id))
            }
        }

        fn connect(
            &mut self,
            _remote: &SessionId,
            _channel: Channel,
            _stream: Option<MediaStream>,
        ) -> Result<LinkId, CollabError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Uuid::new_v4())
        }

        fn accept(&mut self, _link: LinkId, _stream: Option<MediaStream>) -> Result<(), CollabError> {
            Ok(())
        }

        fn send(&mut self, _link: LinkId, _payload: Vec<u8>) -> Result<(), CollabError> {
            Ok(())
        }

        fn close(&mut self, _link: LinkId) {}

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client(
        fail_first: bool,
    ) -> (RendezvousClient<RecordingSignaling>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let (c, s) = (connects.clone(), shutdowns.clone());
        let mut attempts = 0;
        let client = RendezvousClient::new(move || {
            attempts += 1;
            RecordingSignaling {
                id: "abc123",
                fail_register: fail_first && attempts == 1,
                connects: c.clone(),
                shutdowns: s.clone(),
            }
        });
        (client, connects, shutdowns)
    }

    #[tokio::test]
    async fn test_open_assigns_identity() {
        let (mut client, _, _) = client(false);
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = client.open(tx).await.unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(client.local_id(), Some(&id));
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_self_connect_never_reaches_backend() {
        let (mut client, connects, _) = client(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = client.open(tx).await.unwrap();

        let result = client.connect_to(&id, Channel::Data, None);
        assert!(matches!(result, Err(CollabError::SelfConnect(_))));
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        client.connect_to(&SessionId::from("other"), Channel::Data, None).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reopen_after_failure_recreates_backend() {
        let (mut client, _, shutdowns) = client(true);
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = client.open(tx.clone()).await;
        assert!(matches!(first, Err(CollabError::SignalingUnavailable(_))));
        assert!(!client.is_open());
        assert!(client.local_id().is_none());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let id = client.open(tx).await.unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert!(client.is_open());
    }

    #[test]
    fn test_operations_require_open_client() {
        let (mut client, connects, _) = client(false);
        let result = client.connect_to(&SessionId::from("peer"), Channel::Data, None);
        assert!(matches!(result, Err(CollabError::SignalingUnavailable(_))));
        assert!(client.send(Uuid::new_v4(), vec![1]).is_err());
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_teardown_releases_backend() {
        let (mut client, _, shutdowns) = client(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        client.open(tx).await.unwrap();

        client.teardown();
        assert!(!client.is_open());
        assert!(client.local_id().is_none());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
