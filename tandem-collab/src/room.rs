//! Room identity and shareable links.
//!
//! A page loaded without a `room` parameter hosts a room; a page loaded
//! with `?room=<id>` joins the session `<id>`. The role is decided once,
//! when the [`Room`] is built.

use url::Url;

use crate::error::CollabError;
use crate::rendezvous::SessionId;

pub const DEFAULT_ROOM_PARAM: &str = "room";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRole {
    /// Waits for the other peer to connect.
    Host,
    /// Connects to the given session.
    Joiner(SessionId),
}

impl RoomRole {
    pub fn from_url(url: &Url, param: &str) -> Self {
        url.query_pairs()
            .find(|(key, _)| key == param)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|value| RoomRole::Joiner(SessionId::new(value)))
            .unwrap_or(RoomRole::Host)
    }

    pub fn is_host(&self) -> bool {
        matches!(self, RoomRole::Host)
    }
}

/// User-facing link that lets someone else join this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomAddress(Url);

impl RoomAddress {
    /// `base` with the room parameter set to `local` and the fragment
    /// dropped. Other query parameters are kept.
    pub fn derive(base: &Url, local: &SessionId, param: &str) -> Self {
        let kept: Vec<(String, String)> = base
            .query_pairs()
            .filter(|(key, _)| key != param)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        let mut url = base.clone();
        url.set_fragment(None);
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.extend_pairs(kept);
            query.append_pair(param, local.as_str());
        }
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl std::fmt::Display for RoomAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// What to do once the local identity is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomPlan {
    WaitForInbound,
    ConnectTo(SessionId),
}

#[derive(Debug, Clone)]
pub struct Room {
    page: Url,
    param: String,
    role: RoomRole,
    address: Option<RoomAddress>,
}

impl Room {
    pub fn new(page_url: &str, param: impl Into<String>) -> Result<Self, CollabError> {
        let page = Url::parse(page_url)?;
        let param = param.into();
        let role = RoomRole::from_url(&page, &param);
        log::debug!("Room role for {page}: {role:?}");
        Ok(Self {
            page,
            param,
            role,
            address: None,
        })
    }

    pub fn role(&self) -> &RoomRole {
        &self.role
    }

    pub fn page(&self) -> &Url {
        &self.page
    }

    /// Shareable address, available once bound.
    pub fn address(&self) -> Option<&RoomAddress> {
        self.address.as_ref()
    }

    /// Attach the local identity, derive the shareable address and decide
    /// between waiting and dialling. Refuses to dial ourselves.
    pub fn bind(&mut self, local: &SessionId) -> Result<RoomPlan, CollabError> {
        let address = RoomAddress::derive(&self.page, local, &self.param);
        log::info!("Room address: {address}");
        self.address = Some(address);

        match &self.role {
            RoomRole::Host => Ok(RoomPlan::WaitForInbound),
            RoomRole::Joiner(target) if target == local => {
                log::warn!("Room link points at our own session {local}");
                Err(CollabError::SelfConnect(target.clone()))
            }
            RoomRole::Joiner(target) => Ok(RoomPlan::ConnectTo(target.clone())),
        }
    }

    pub fn unbind(&mut self) {
        self.address = None;
    }
}
