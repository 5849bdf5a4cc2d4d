//! Media streams and the call-side session manager.
//!
//! A [`MediaTrack`] is a shared handle: every clone observes the same
//! `enabled` flag and ready state, the way a browser track object is shared
//! between the capture side and the peer connection that carries it.
//!
//! ```text
//!  MediaDevices::acquire_local_media ──► MediaStream ──► MediaSession (local)
//!                                              │
//!                                              └──────► Connection (attached)
//!  Closed / Failed ──► MediaTrack::stop() on every local track
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollabError;
use crate::rendezvous::{Channel, LinkId, RendezvousClient, SessionId, Signaling};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// Shared handle to one audio or video track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Mute/unmute. Has no effect once the track has ended.
    pub fn set_enabled(&self, enabled: bool) {
        if self.state() == TrackState::Live {
            self.inner.enabled.store(enabled, Ordering::Release);
        }
    }

    pub fn state(&self) -> TrackState {
        if self.inner.ended.load(Ordering::Acquire) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    /// Release the underlying device. Irreversible.
    pub fn stop(&self) {
        self.inner.enabled.store(false, Ordering::Release);
        self.inner.ended.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// A stream is active while at least one track is live.
    pub fn active(&self) -> bool {
        self.tracks.iter().any(|t| t.state() == TrackState::Live)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track. Returns how many were still live.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for track in &self.tracks {
            if track.state() == TrackState::Live {
                stopped += 1;
            }
            track.stop();
        }
        stopped
    }
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    /// Join a call without any local media.
    pub fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Camera/microphone acquisition boundary.
pub trait MediaDevices {
    fn acquire_local_media(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CollabError>;
}

/// Synthetic devices: hand out fresh tracks, or refuse like a user who
/// clicked "Block" on the permission prompt.
#[derive(Debug, Default)]
pub struct LoopbackDevices {
    denied: bool,
    acquired: Vec<MediaStream>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            denied: true,
            acquired: Vec::new(),
        }
    }

    pub fn set_denied(&mut self, denied: bool) {
        self.denied = denied;
    }

    /// Every stream handed out so far.
    pub fn acquired(&self) -> &[MediaStream] {
        &self.acquired
    }
}

impl MediaDevices for LoopbackDevices {
    fn acquire_local_media(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CollabError> {
        if self.denied {
            return Err(CollabError::MediaAcquisitionDenied(
                "permission dismissed".to_string(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "loopback microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "loopback camera"));
        }
        let stream = MediaStream::new(tracks);
        self.acquired.push(stream.clone());
        Ok(stream)
    }
}

/// Call-side state: local capture, remote stream, mute/camera toggles.
#[derive(Debug)]
pub struct MediaSession {
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl Default for MediaSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSession {
    pub fn new() -> Self {
        Self {
            local: None,
            remote: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Acquire local media unless a live stream is already held.
    ///
    /// Empty constraints mean "no local media" and never touch the devices.
    pub fn ensure_local<M: MediaDevices>(
        &mut self,
        devices: &mut M,
        constraints: &MediaConstraints,
    ) -> Result<Option<MediaStream>, CollabError> {
        if constraints.is_empty() {
            return Ok(None);
        }
        if let Some(stream) = self.local.as_ref().filter(|s| s.active()) {
            return Ok(Some(stream.clone()));
        }

        let stream = devices.acquire_local_media(constraints)?;
        stream.set_enabled(TrackKind::Audio, self.audio_enabled);
        stream.set_enabled(TrackKind::Video, self.video_enabled);
        log::info!(
            "Acquired local media {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
        self.local = Some(stream.clone());
        Ok(Some(stream))
    }

    /// Outbound call: acquire media, then ask the rendezvous service for a
    /// media link to `remote`.
    pub fn place<S: Signaling, M: MediaDevices>(
        &mut self,
        rendezvous: &mut RendezvousClient<S>,
        devices: &mut M,
        remote: &SessionId,
        constraints: &MediaConstraints,
    ) -> Result<(LinkId, Option<MediaStream>), CollabError> {
        let stream = self.ensure_local(devices, constraints)?;
        let link = rendezvous.connect_to(remote, Channel::Media, stream.clone())?;
        Ok((link, stream))
    }

    /// Inbound call: acquire media, then accept `link` with it attached.
    pub fn answer<S: Signaling, M: MediaDevices>(
        &mut self,
        rendezvous: &mut RendezvousClient<S>,
        devices: &mut M,
        link: LinkId,
        constraints: &MediaConstraints,
    ) -> Result<Option<MediaStream>, CollabError> {
        let stream = self.ensure_local(devices, constraints)?;
        rendezvous.accept(link, stream.clone())?;
        Ok(stream)
    }

    pub fn attach_remote(&mut self, stream: MediaStream) {
        log::info!("Remote media {} attached", stream.id());
        self.remote = Some(stream);
    }

    pub fn local(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&MediaStream> {
        self.remote.as_ref()
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Mute/unmute locally. Returns the new state.
    pub fn toggle_audio(&mut self) -> bool {
        self.audio_enabled = !self.audio_enabled;
        if let Some(stream) = &self.local {
            stream.set_enabled(TrackKind::Audio, self.audio_enabled);
        }
        self.audio_enabled
    }

    /// Camera on/off locally. Returns the new state.
    pub fn toggle_video(&mut self) -> bool {
        self.video_enabled = !self.video_enabled;
        if let Some(stream) = &self.local {
            stream.set_enabled(TrackKind::Video, self.video_enabled);
        }
        self.video_enabled
    }

    /// Stop local capture and forget both streams. Remote tracks are not
    /// ours to stop.
    pub fn release(&mut self) -> usize {
        let stopped = self.local.take().map(|s| s.stop_all()).unwrap_or(0);
        self.remote = None;
        if stopped > 0 {
            log::info!("Released {stopped} local media tracks");
        }
        stopped
    }
}
