//! Session owner: one pairing session from `init` to `teardown`.
//!
//! ```text
//!   Signaling backend ──┐
//!   SharedDocument  ────┼──► PeerEvent channel ──► handle_event_at()
//!   (change listener)   │                              │
//!   echo timer ─────────┘              ┌───────────────┼────────────────┐
//!                                      ▼               ▼                ▼
//!                              ConnectionManager   SyncEngine      MediaSession
//! ```
//!
//! All session state is touched from the single handler; nothing here is
//! shared across tasks.

use std::time::Instant;

use tandem_core::{ChangeNotice, SharedDocument};
use tokio::sync::mpsc;

use crate::config::{SessionConfig, SessionMode};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionManager, ConnectionState, Transition, TransitionError,
};
use crate::error::CollabError;
use crate::media::{MediaConstraints, MediaDevices, MediaSession, MediaStream};
use crate::protocol::SyncMessage;
use crate::rendezvous::{
    Channel, EventReceiver, EventSender, LinkId, PeerEvent, RendezvousClient, SessionId, Signaling,
};
use crate::room::{Room, RoomAddress, RoomPlan, RoomRole};
use crate::sync::{SyncEngine, SyncStats};

/// What the user sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Registering,
    /// Host waiting for someone to open the shared link.
    Waiting { address: String },
    Connecting { remote: SessionId },
    Connected { remote: SessionId },
    PeerLeft,
    Closed,
    Error(String),
}

impl SessionStatus {
    fn from_error(error: &CollabError) -> Self {
        match error {
            CollabError::RemoteDisconnected(_) => Self::PeerLeft,
            other => Self::Error(other.status()),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Registering => f.write_str("Connecting to the pairing service"),
            Self::Waiting { address } => write!(f, "Waiting for a peer. Share {address}"),
            Self::Connecting { remote } => write!(f, "Connecting to {remote}"),
            Self::Connected { remote } => write!(f, "Connected to {remote}"),
            Self::PeerLeft => f.write_str("Peer left"),
            Self::Closed => f.write_str("Disconnected"),
            Self::Error(message) => f.write_str(message),
        }
    }
}

pub struct PeerSession<S: Signaling, D: SharedDocument, M: MediaDevices> {
    config: SessionConfig,
    rendezvous: RendezvousClient<S>,
    room: Room,
    connections: ConnectionManager,
    sync: SyncEngine,
    media: MediaSession,
    document: D,
    devices: M,
    events_tx: EventSender,
    events_rx: EventReceiver,
    status: SessionStatus,
    status_tx: mpsc::UnboundedSender<SessionStatus>,
    status_rx: Option<mpsc::UnboundedReceiver<SessionStatus>>,
    running: bool,
}

impl<S: Signaling, D: SharedDocument, M: MediaDevices> PeerSession<S, D, M> {
    /// Build a session for the page at `page_url`. Nothing touches the
    /// network until [`init`](Self::init).
    pub fn new(
        config: SessionConfig,
        factory: impl FnMut() -> S + Send + 'static,
        document: D,
        devices: M,
        page_url: &str,
    ) -> Result<Self, CollabError> {
        let room = Room::new(page_url, config.room_param.as_str())?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Ok(Self {
            sync: SyncEngine::new(config.echo_suppression),
            config,
            rendezvous: RendezvousClient::new(factory),
            room,
            connections: ConnectionManager::new(),
            media: MediaSession::new(),
            document,
            devices,
            events_tx,
            events_rx,
            status: SessionStatus::Idle,
            status_tx,
            status_rx: Some(status_rx),
            running: false,
        })
    }

    /// Register with the rendezvous service, derive the room address and,
    /// for a joiner, dial the host.
    ///
    /// A joiner whose link points at its own id stays registered but gets
    /// `SelfConnect`.
    pub async fn init(&mut self) -> Result<SessionId, CollabError> {
        self.set_status(SessionStatus::Registering);

        let timeout = self.config.registration_timeout;
        let registration =
            tokio::time::timeout(timeout, self.rendezvous.open(self.events_tx.clone())).await;
        let local = match registration {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => return Err(self.report(e)),
            Err(_) => {
                self.rendezvous.teardown();
                return Err(self.report(CollabError::SignalingUnavailable(format!(
                    "registration timed out after {timeout:?}"
                ))));
            }
        };
        self.running = true;

        match self.room.bind(&local) {
            Ok(RoomPlan::WaitForInbound) => self.resume_waiting(),
            Ok(RoomPlan::ConnectTo(target)) => {
                let dialled = match self.config.mode {
                    SessionMode::Whiteboard => self.connect_to(&target),
                    SessionMode::Call => self.place_call(&target),
                };
                dialled?;
            }
            Err(e) => return Err(self.report(e)),
        }
        Ok(local)
    }

    /// Open a data connection to `remote`, superseding any current one.
    pub fn connect_to(&mut self, remote: &SessionId) -> Result<LinkId, CollabError> {
        let result = self.dial(remote, Channel::Data);
        result.map_err(|e| self.report(e))
    }

    /// Call `remote` with local media per the configured constraints.
    pub fn place_call(&mut self, remote: &SessionId) -> Result<LinkId, CollabError> {
        let result = self.dial(remote, Channel::Media);
        result.map_err(|e| self.report(e))
    }

    /// Answer the pending incoming call.
    ///
    /// After a denied acquisition, call again with
    /// [`MediaConstraints::none`] to join without local media.
    pub fn answer_call(&mut self, constraints: MediaConstraints) -> Result<(), CollabError> {
        let result = self.answer_pending(constraints);
        result.map_err(|e| self.report(e))
    }

    fn dial(&mut self, remote: &SessionId, channel: Channel) -> Result<LinkId, CollabError> {
        if self.rendezvous.local_id() == Some(remote) {
            log::warn!("Refusing to dial own session {remote}");
            return Err(CollabError::SelfConnect(remote.clone()));
        }
        if !self.rendezvous.is_open() {
            return Err(CollabError::SignalingUnavailable(
                "session is not initialised".to_string(),
            ));
        }

        // Free the current connection, and any media it holds, first.
        self.retire_current();

        let (link, stream) = match channel {
            Channel::Data => (self.rendezvous.connect_to(remote, channel, None)?, None),
            Channel::Media => {
                let placed = self.media.place(
                    &mut self.rendezvous,
                    &mut self.devices,
                    remote,
                    &self.config.media,
                );
                match placed {
                    Ok(placed) => placed,
                    Err(e) => {
                        // Nothing will carry the captured stream.
                        self.media.release();
                        return Err(e);
                    }
                }
            }
        };
        let mut conn = Connection::outbound(link, remote.clone(), channel);
        if let Some(stream) = stream {
            conn.attach_local_stream(stream);
        }
        self.install(conn);
        self.set_status(SessionStatus::Connecting {
            remote: remote.clone(),
        });
        Ok(link)
    }

    fn answer_pending(&mut self, constraints: MediaConstraints) -> Result<(), CollabError> {
        let link = match self.connections.current() {
            Some(conn)
                if conn.channel() == Channel::Media
                    && conn.state() == ConnectionState::Pending
                    && conn.local_stream().is_none() =>
            {
                conn.link()
            }
            _ => return Err(CollabError::NotConnected),
        };
        let answered =
            self.media
                .answer(&mut self.rendezvous, &mut self.devices, link, &constraints);
        let stream = match answered {
            Ok(stream) => stream,
            Err(e) => {
                // The call was not accepted, so nothing carries the stream.
                self.media.release();
                return Err(e);
            }
        };
        if let (Some(stream), Some(conn)) = (stream, self.connections.get_mut(link)) {
            conn.attach_local_stream(stream);
        }
        Ok(())
    }

    /// Install `conn` as the session's connection.
    fn install(&mut self, conn: Connection) {
        self.retire_current();
        let channel = conn.channel();
        if let Some(old) = self.connections.promote(conn) {
            self.rendezvous.close(old.link());
        }
        if channel == Channel::Data {
            self.sync.attach(&mut self.document, self.events_tx.clone());
        }
    }

    /// Locally close the current connection, if live, and release what it held.
    fn retire_current(&mut self) {
        if let Some(link) = self.connections.current().map(|c| c.link()) {
            if let Some(t) = self.connections.close_current() {
                self.finish(link, t);
            }
        }
    }

    /// Dispatch one event. Errors end up in the session status.
    pub fn handle_event_at(&mut self, event: PeerEvent, now: Instant) {
        if let Err(e) = self.dispatch(event, now) {
            self.report(e);
        }
    }

    pub fn handle_event(&mut self, event: PeerEvent) {
        self.handle_event_at(event, Instant::now());
    }

    fn dispatch(&mut self, event: PeerEvent, now: Instant) -> Result<(), CollabError> {
        match event {
            PeerEvent::Incoming {
                link,
                remote,
                channel,
            } => self.on_incoming(link, remote, channel),
            PeerEvent::Ready { link } => {
                if let Some(t) = self.drive(link, ConnectionEvent::TransportReady) {
                    self.after_transition(link, t)?;
                }
                Ok(())
            }
            PeerEvent::Frame { link, payload } => self.on_frame(link, &payload, now),
            PeerEvent::RemoteStream { link, stream } => self.on_remote_stream(link, stream),
            PeerEvent::RemoteClosed { link } => self.on_link_end(link, ConnectionEvent::RemoteClose),
            PeerEvent::LinkError { link, reason } => {
                log::error!("Transport error on link {link}: {reason}");
                self.on_link_end(link, ConnectionEvent::TransportError(reason))
            }
            PeerEvent::SignalingLost { reason } => {
                log::error!("Lost the rendezvous service: {reason}");
                if let Some(link) = self.connections.current().map(|c| c.link()) {
                    if let Some(t) =
                        self.drive(link, ConnectionEvent::TransportError(reason.clone()))
                    {
                        self.finish(link, t);
                    }
                }
                self.shutdown_rendezvous();
                Err(CollabError::SignalingUnavailable(reason))
            }
            PeerEvent::DocumentChanged(notice) => self.on_document_changed(notice, now),
        }
    }

    fn on_incoming(
        &mut self,
        link: LinkId,
        remote: SessionId,
        channel: Channel,
    ) -> Result<(), CollabError> {
        let expected = match self.config.mode {
            SessionMode::Whiteboard => Channel::Data,
            SessionMode::Call => Channel::Media,
        };
        if channel != expected {
            log::warn!("Refusing {channel:?} link {link} from {remote} in {expected:?} session");
            self.rendezvous.close(link);
            return Ok(());
        }

        log::info!("Incoming {channel:?} connection {link} from {remote}");
        self.install(Connection::inbound(link, remote.clone(), channel));
        self.set_status(SessionStatus::Connecting { remote });

        match channel {
            Channel::Data => {
                if let Err(e) = self.rendezvous.accept(link, None) {
                    if let Some(t) = self.drive(link, ConnectionEvent::TransportError(e.to_string())) {
                        self.finish(link, t);
                    }
                    return Err(e);
                }
                Ok(())
            }
            // A denied acquisition leaves the call pending for answer_call.
            Channel::Media => self.answer_pending(self.config.media),
        }
    }

    fn on_frame(&mut self, link: LinkId, payload: &[u8], now: Instant) -> Result<(), CollabError> {
        let Some(channel) = self.connections.get_mut(link).map(|c| c.channel()) else {
            log::debug!("Dropping frame for stale link {link}");
            return Ok(());
        };
        if channel != Channel::Data {
            log::debug!("Dropping frame on media link {link}");
            return Ok(());
        }
        let msg = SyncMessage::decode(payload)?;
        log::debug!("Received {:?} ({} bytes) on {link}", msg.message_type(), payload.len());

        let Some(t) = self.drive(link, ConnectionEvent::MessageReceived) else {
            return Ok(());
        };
        self.after_transition(link, t)?;

        match self.sync.on_message(&mut self.document, msg, now) {
            Ok(Some(reply)) => self.send_message(link, &reply),
            Ok(None) => Ok(()),
            // Counted by the engine; the link is still healthy.
            Err(CollabError::SnapshotApply(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn on_remote_stream(&mut self, link: LinkId, stream: MediaStream) -> Result<(), CollabError> {
        let Some(conn) = self.connections.get_mut(link) else {
            log::debug!("Dropping remote stream for stale link {link}");
            return Ok(());
        };
        conn.attach_remote_stream(stream.clone());
        self.media.attach_remote(stream);

        // The remote stream is the first payload of a media link.
        if let Some(t) = self.drive(link, ConnectionEvent::MessageReceived) {
            self.after_transition(link, t)?;
        }
        Ok(())
    }

    fn on_link_end(&mut self, link: LinkId, event: ConnectionEvent) -> Result<(), CollabError> {
        let remote_close = event == ConnectionEvent::RemoteClose;
        let Some(t) = self.drive(link, event) else {
            return Ok(());
        };
        self.after_transition(link, t)?;

        let Some(conn) = self.connections.current() else {
            return Ok(());
        };
        match t.to {
            ConnectionState::Closed if remote_close => {
                let left = CollabError::RemoteDisconnected(conn.remote().clone());
                self.report(left);
                self.resume_waiting();
                Ok(())
            }
            ConnectionState::Failed => Err(CollabError::ConnectionFailed {
                remote: conn.remote().to_string(),
                reason: conn
                    .failure()
                    .unwrap_or("closed before the connection opened")
                    .to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn on_document_changed(&mut self, notice: ChangeNotice, now: Instant) -> Result<(), CollabError> {
        let Some(link) = self
            .connections
            .current()
            .filter(|c| c.channel() == Channel::Data && c.state().is_live())
            .map(|c| c.link())
        else {
            return Ok(());
        };
        let active = self.connections.is_active();
        if let Some(msg) = self
            .sync
            .on_local_change(&self.document, notice.origin, active, now)
        {
            log::debug!("Broadcasting local change v{}", notice.version);
            self.send_message(link, &msg)?;
        }
        Ok(())
    }

    /// Feed `event` to the connection on `link`. Stale links and rejected
    /// transitions are logged and dropped.
    fn drive(&mut self, link: LinkId, event: ConnectionEvent) -> Option<Transition> {
        match self.connections.handle(link, event) {
            Ok(t) => t,
            Err(e @ TransitionError::Terminal { .. }) => {
                log::debug!("{e}");
                None
            }
            Err(e) => {
                log::warn!("Dropping event on {link}: {e}");
                None
            }
        }
    }

    fn after_transition(&mut self, link: LinkId, t: Transition) -> Result<(), CollabError> {
        if !t.changed() {
            return Ok(());
        }
        if t.to.is_terminal() {
            self.finish(link, t);
            return Ok(());
        }
        if t.entered(ConnectionState::Open) {
            let Some(conn) = self.connections.current() else {
                return Ok(());
            };
            let (remote, direction, channel) =
                (conn.remote().clone(), conn.direction(), conn.channel());
            self.set_status(SessionStatus::Connected { remote });
            if channel == Channel::Data {
                if let Some(handshake) = self.sync.on_open(direction) {
                    self.send_message(link, &handshake)?;
                }
            }
        }
        Ok(())
    }

    /// Release everything a connection that just went terminal held.
    fn finish(&mut self, link: LinkId, t: Transition) {
        if !t.to.is_terminal() {
            return;
        }
        self.sync.detach(&mut self.document);
        self.media.release();
        self.rendezvous.close(link);
        if t.to == ConnectionState::Closed {
            self.set_status(SessionStatus::Closed);
        }
    }

    fn send_message(&mut self, link: LinkId, msg: &SyncMessage) -> Result<(), CollabError> {
        let bytes = msg.encode()?;
        log::debug!("Sending {:?} ({} bytes) on {link}", msg.message_type(), bytes.len());
        self.rendezvous.send(link, bytes)
    }

    /// Clear the echo window once its deadline has passed.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.sync.poll_expired(now) {
            log::trace!("Echo suppression window expired");
        }
    }

    /// Handle everything already queued, using `now` as the clock.
    /// Returns how many events were handled.
    pub fn drain_pending_at(&mut self, now: Instant) -> usize {
        self.poll_timers(now);
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event_at(event, now);
            handled += 1;
        }
        handled
    }

    pub fn drain_pending(&mut self) -> usize {
        self.drain_pending_at(Instant::now())
    }

    /// Wait for one event or the echo timer, whichever comes first.
    pub async fn step(&mut self) {
        let deadline = self.sync.next_deadline();
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            event = self.events_rx.recv() => {
                if let Some(event) = event {
                    self.handle_event(event);
                }
            }
            _ = timer => self.poll_timers(Instant::now()),
        }
    }

    /// Process events until the session is torn down or loses its
    /// rendezvous service.
    pub async fn run(&mut self) {
        while self.running {
            self.step().await;
        }
    }

    /// Close the current connection. The session stays registered.
    pub fn close(&mut self) {
        self.retire_current();
    }

    /// Close everything and release the session identity.
    pub fn teardown(&mut self) {
        self.retire_current();
        self.shutdown_rendezvous();
        self.set_status(SessionStatus::Closed);
    }

    /// Show the shareable address again. Only a registered host waits.
    fn resume_waiting(&mut self) {
        if !self.running || !self.room.role().is_host() {
            return;
        }
        if let Some(address) = self.room.address().map(|a| a.to_string()) {
            self.set_status(SessionStatus::Waiting { address });
        }
    }

    fn shutdown_rendezvous(&mut self) {
        self.sync.detach(&mut self.document);
        self.media.release();
        self.rendezvous.teardown();
        self.room.unbind();
        self.running = false;
    }

    pub fn toggle_audio(&mut self) -> bool {
        self.media.toggle_audio()
    }

    pub fn toggle_video(&mut self) -> bool {
        self.media.toggle_video()
    }

    fn set_status(&mut self, status: SessionStatus) {
        if status == self.status {
            return;
        }
        log::info!("Session status: {status}");
        self.status = status.clone();
        let _ = self.status_tx.send(status);
    }

    /// Record `error` in the status and hand it back.
    fn report(&mut self, error: CollabError) -> CollabError {
        if error.is_recoverable() {
            log::warn!("{error}");
        } else {
            log::error!("{error}");
        }
        self.set_status(SessionStatus::from_error(&error));
        error
    }

    /// Take the status stream (can only be called once).
    pub fn take_status_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionStatus>> {
        self.status_rx.take()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_id(&self) -> Option<&SessionId> {
        self.rendezvous.local_id()
    }

    pub fn role(&self) -> &RoomRole {
        self.room.role()
    }

    pub fn room_address(&self) -> Option<&RoomAddress> {
        self.room.address()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connections.current()
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connections.state()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    /// Edits made through this reference are broadcast once their change
    /// notices are handled.
    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    pub fn media(&self) -> &MediaSession {
        &self.media
    }

    pub fn devices(&self) -> &M {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut M {
        &mut self.devices
    }

    pub fn stats(&self) -> SyncStats {
        self.sync.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalRendezvous, LocalSignaling};
    use crate::media::LoopbackDevices;
    use tandem_core::{Board, Element, ShapeElement};

    type Session = PeerSession<LocalSignaling, Board, LoopbackDevices>;

    fn session(hub: &LocalRendezvous, id: &'static str, page: &str) -> Session {
        let hub = hub.clone();
        PeerSession::new(
            SessionConfig::default(),
            move || hub.client_with_id(id),
            Board::new(),
            LoopbackDevices::new(),
            page,
        )
        .unwrap()
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::PeerLeft.to_string(), "Peer left");
        assert_eq!(
            SessionStatus::Connected {
                remote: SessionId::from("abc123")
            }
            .to_string(),
            "Connected to abc123"
        );
        assert_eq!(
            SessionStatus::from_error(&CollabError::RemoteDisconnected(SessionId::from("x"))),
            SessionStatus::PeerLeft
        );
    }

    #[tokio::test]
    async fn test_host_init_waits_with_address() {
        let hub = LocalRendezvous::new();
        let mut host = session(&hub, "abc123", "https://prep.example/whiteboard");

        let id = host.init().await.unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert!(host.role().is_host());
        assert_eq!(
            host.status(),
            &SessionStatus::Waiting {
                address: "https://prep.example/whiteboard?room=abc123".to_string()
            }
        );
        assert!(host.connection().is_none());
        assert!(host.is_running());
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let hub = LocalRendezvous::new();
        let mut host = session(&hub, "abc123", "https://prep.example/whiteboard");
        host.init().await.unwrap();

        let stale = uuid::Uuid::new_v4();
        host.handle_event(PeerEvent::Ready { link: stale });
        host.handle_event(PeerEvent::Frame {
            link: stale,
            payload: vec![0xff],
        });
        host.handle_event(PeerEvent::RemoteClosed { link: stale });
        assert!(matches!(host.status(), SessionStatus::Waiting { .. }));
    }

    #[tokio::test]
    async fn test_local_edits_without_connection_are_not_sent() {
        let hub = LocalRendezvous::new();
        let mut host = session(&hub, "abc123", "https://prep.example/whiteboard");
        host.init().await.unwrap();

        host.document_mut()
            .add(Element::Rect(ShapeElement::new(0.0, 0.0, 1.0, 1.0))).unwrap();
        host.drain_pending();
        assert_eq!(host.stats().snapshots_sent, 0);
    }

    #[tokio::test]
    async fn test_answer_without_pending_call() {
        let hub = LocalRendezvous::new();
        let mut host = session(&hub, "abc123", "https://prep.example/call");
        host.init().await.unwrap();
        assert!(matches!(
            host.answer_call(MediaConstraints::none()),
            Err(CollabError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_signaling_lost_stops_session() {
        let hub = LocalRendezvous::new();
        let mut host = session(&hub, "abc123", "https://prep.example/whiteboard");
        host.init().await.unwrap();

        host.handle_event(PeerEvent::SignalingLost {
            reason: "socket reset".into(),
        });
        assert!(!host.is_running());
        assert!(host.local_id().is_none());
        assert!(matches!(host.status(), SessionStatus::Error(_)));
        assert_eq!(hub.peer_count(), 0);
    }
}
