//! In-process rendezvous hub.
//!
//! Every [`LocalSignaling`] handed out by the same [`LocalRendezvous`] can
//! reach the others. Links are wired straight through the hub: frames,
//! readiness, closes and media streams are delivered as [`PeerEvent`]s on
//! each participant's event channel, in the order they were produced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::CollabError;
use crate::media::MediaStream;
use crate::rendezvous::{Channel, EventSender, LinkId, PeerEvent, SessionId, Signaling};

#[derive(Debug)]
struct LinkEntry {
    caller: SessionId,
    callee: SessionId,
    channel: Channel,
    offered: Option<MediaStream>,
    accepted: bool,
}

impl LinkEntry {
    fn other(&self, id: &SessionId) -> Option<&SessionId> {
        if &self.caller == id {
            Some(&self.callee)
        } else if &self.callee == id {
            Some(&self.caller)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct HubState {
    available: bool,
    peers: HashMap<SessionId, EventSender>,
    links: HashMap<LinkId, LinkEntry>,
}

impl HubState {
    fn notify(&self, id: &SessionId, event: PeerEvent) {
        if let Some(events) = self.peers.get(id) {
            let _ = events.send(event);
        }
    }

    fn fresh_id(&self) -> SessionId {
        loop {
            let raw = Uuid::new_v4().simple().to_string();
            let id = SessionId::new(&raw[..8]);
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Shared hub. Cloning yields another handle to the same hub.
#[derive(Debug, Clone)]
pub struct LocalRendezvous {
    state: Arc<Mutex<HubState>>,
}

impl Default for LocalRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRendezvous {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                available: true,
                peers: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    /// A backend that gets a random id on registration.
    pub fn client(&self) -> LocalSignaling {
        LocalSignaling {
            hub: self.clone(),
            preferred: None,
            id: None,
        }
    }

    /// A backend that asks for `id` on registration.
    pub fn client_with_id(&self, id: &str) -> LocalSignaling {
        LocalSignaling {
            hub: self.clone(),
            preferred: Some(SessionId::from(id)),
            id: None,
        }
    }

    /// Take the service offline (or back online). Existing links keep working.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Fail `link` on both ends with a transport error.
    pub fn inject_error(&self, link: LinkId, reason: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.links.remove(&link) {
            log::debug!("Injecting transport error on link {link}: {reason}");
            for id in [&entry.caller, &entry.callee] {
                state.notify(
                    id,
                    PeerEvent::LinkError {
                        link,
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One participant's connection to a [`LocalRendezvous`].
#[derive(Debug)]
pub struct LocalSignaling {
    hub: LocalRendezvous,
    preferred: Option<SessionId>,
    id: Option<SessionId>,
}

impl LocalSignaling {
    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    fn register_now(&mut self, events: EventSender) -> Result<SessionId, CollabError> {
        let mut state = self.hub.lock();
        if !state.available {
            return Err(CollabError::SignalingUnavailable(
                "rendezvous service offline".to_string(),
            ));
        }
        let id = match self.preferred.clone() {
            Some(id) if state.peers.contains_key(&id) => {
                return Err(CollabError::SignalingUnavailable(format!(
                    "session id {id} is taken"
                )));
            }
            Some(id) => id,
            None => state.fresh_id(),
        };
        state.peers.insert(id.clone(), events);
        self.id = Some(id.clone());
        Ok(id)
    }

    fn registered(&self) -> Result<&SessionId, CollabError> {
        self.id.as_ref().ok_or_else(|| {
            CollabError::SignalingUnavailable("not registered with the hub".to_string())
        })
    }
}

impl Signaling for LocalSignaling {
    async fn register(&mut self, events: EventSender) -> Result<SessionId, CollabError> {
        self.register_now(events)
    }

    fn connect(
        &mut self,
        remote: &SessionId,
        channel: Channel,
        stream: Option<MediaStream>,
    ) -> Result<LinkId, CollabError> {
        let local = self.registered()?.clone();
        let link = Uuid::new_v4();
        let mut state = self.hub.lock();

        if !state.peers.contains_key(remote) {
            log::debug!("Hub has no peer {remote}");
            state.notify(
                &local,
                PeerEvent::LinkError {
                    link,
                    reason: format!("peer {remote} not found"),
                },
            );
            return Ok(link);
        }

        state.links.insert(
            link,
            LinkEntry {
                caller: local.clone(),
                callee: remote.clone(),
                channel,
                offered: stream,
                accepted: false,
            },
        );
        state.notify(
            remote,
            PeerEvent::Incoming {
                link,
                remote: local,
                channel,
            },
        );
        Ok(link)
    }

    fn accept(&mut self, link: LinkId, stream: Option<MediaStream>) -> Result<(), CollabError> {
        let local = self.registered()?.clone();
        let mut state = self.hub.lock();

        let entry = match state.links.get_mut(&link) {
            Some(entry) if entry.callee == local => entry,
            _ => {
                return Err(CollabError::ConnectionFailed {
                    remote: link.to_string(),
                    reason: "link no longer exists".to_string(),
                })
            }
        };
        entry.accepted = true;
        let caller = entry.caller.clone();
        let channel = entry.channel;
        let offered = entry.offered.take();

        state.notify(&caller, PeerEvent::Ready { link });
        state.notify(&local, PeerEvent::Ready { link });

        if channel == Channel::Media {
            if let Some(answer) = stream {
                state.notify(&caller, PeerEvent::RemoteStream { link, stream: answer });
            }
            if let Some(offer) = offered {
                state.notify(&local, PeerEvent::RemoteStream { link, stream: offer });
            }
        }
        Ok(())
    }

    fn send(&mut self, link: LinkId, payload: Vec<u8>) -> Result<(), CollabError> {
        let local = self.registered()?.clone();
        let state = self.hub.lock();

        let remote = state
            .links
            .get(&link)
            .filter(|entry| entry.accepted)
            .and_then(|entry| entry.other(&local))
            .ok_or(CollabError::NotConnected)?;
        state.notify(remote, PeerEvent::Frame { link, payload });
        Ok(())
    }

    fn close(&mut self, link: LinkId) {
        let Some(local) = self.id.clone() else {
            return;
        };
        let mut state = self.hub.lock();
        let owned = state
            .links
            .get(&link)
            .is_some_and(|entry| entry.other(&local).is_some());
        if !owned {
            return;
        }
        if let Some(entry) = state.links.remove(&link) {
            if let Some(remote) = entry.other(&local) {
                state.notify(remote, PeerEvent::RemoteClosed { link });
            }
        }
    }

    fn shutdown(&mut self) {
        let Some(local) = self.id.take() else {
            return;
        };
        let mut state = self.hub.lock();
        state.peers.remove(&local);

        let owned: Vec<LinkId> = state
            .links
            .iter()
            .filter(|(_, entry)| entry.other(&local).is_some())
            .map(|(link, _)| *link)
            .collect();
        for link in owned {
            if let Some(entry) = state.links.remove(&link) {
                if let Some(remote) = entry.other(&local) {
                    state.notify(remote, PeerEvent::RemoteClosed { link });
                }
            }
        }
        log::debug!("Hub released {local}");
    }
}

impl Drop for LocalSignaling {
    fn drop(&mut self) {
        self.shutdown();
    }
}
