// libs/call-session-cell/src/services/media.rs
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{CallSessionError, CallSessionResult};
use crate::models::{MediaConstraints, MediaKind, MediaTrackState, StreamHandle};

pub type TrackEndedHandler = Box<dyn Fn(StreamHandle) + Send + Sync>;

/// Platform media access (getUserMedia / getDisplayMedia and track control).
///
/// Implementations must not leave a device open when an `open_*` future is
/// dropped before it resolves.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> CallSessionResult<Vec<(MediaKind, StreamHandle)>>;

    async fn open_display_media(&self) -> CallSessionResult<StreamHandle>;

    fn set_track_enabled(&self, handle: StreamHandle, enabled: bool);

    fn stop_track(&self, handle: StreamHandle);

    /// Called when the platform ends a track on its own (device unplugged,
    /// user stopped sharing from the browser bar).
    fn on_track_ended(&self, handler: TrackEndedHandler);
}

/// Outgoing video slot of a live peer connection.
#[async_trait]
pub trait VideoSender: Send + Sync {
    async fn replace_video_track(&self, handle: StreamHandle) -> CallSessionResult<()>;
}

struct MediaState {
    tracks: Vec<MediaTrackState>,
    released: HashSet<StreamHandle>,
    preferences: HashMap<MediaKind, bool>,
    sender: Option<Arc<dyn VideoSender>>,
    shut_down: bool,
}

impl MediaState {
    fn preference(&self, kind: MediaKind) -> bool {
        self.preferences.get(&kind).copied().unwrap_or(true)
    }

    fn outgoing_video(&self) -> Option<MediaTrackState> {
        self.tracks.iter().find(|t| t.kind.is_video()).copied()
    }
}

/// Sole owner of the local camera, microphone and screen tracks.
///
/// Every handle that passes through the controller is stopped on the backend
/// exactly once, whether it is released explicitly, replaced, or arrives after
/// the controller has been shut down.
pub struct MediaSourceController {
    backend: Arc<dyn MediaBackend>,
    state: Mutex<MediaState>,
}

impl MediaSourceController {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(MediaState {
                tracks: Vec::new(),
                released: HashSet::new(),
                preferences: HashMap::new(),
                sender: None,
                shut_down: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MediaState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_track_ended(&self, handler: TrackEndedHandler) {
        self.backend.on_track_ended(handler);
    }

    pub async fn acquire(&self, constraints: MediaConstraints) -> CallSessionResult<Vec<MediaTrackState>> {
        if self.lock().shut_down {
            return Err(CallSessionError::Cancelled);
        }

        debug!("Requesting user media: {:?}", constraints);
        let opened = self.backend.open_user_media(constraints).await?;

        let (acquired, late) = {
            let mut state = self.lock();
            if state.shut_down {
                (Vec::new(), opened)
            } else {
                let acquired: Vec<MediaTrackState> = opened
                    .into_iter()
                    .map(|(kind, stream_handle)| MediaTrackState {
                        kind,
                        enabled: state.preference(kind),
                        stream_handle,
                    })
                    .collect();
                state.tracks.extend(acquired.iter().copied());
                (acquired, Vec::new())
            }
        };

        if !late.is_empty() {
            info!("Media arrived after shutdown, releasing {} track(s)", late.len());
            for (_, handle) in late {
                self.release(handle);
            }
            return Err(CallSessionError::Cancelled);
        }

        for track in acquired.iter().filter(|t| !t.enabled) {
            self.backend.set_track_enabled(track.stream_handle, false);
        }

        info!("Acquired {} local track(s)", acquired.len());
        Ok(acquired)
    }

    /// Stops `handle` on the backend unless it was already released.
    /// Returns whether this call performed the release.
    pub fn release(&self, handle: StreamHandle) -> bool {
        {
            let mut state = self.lock();
            if !state.released.insert(handle) {
                return false;
            }
            state.tracks.retain(|t| t.stream_handle != handle);
        }
        self.backend.stop_track(handle);
        debug!("Released track {}", handle);
        true
    }

    /// Releases every owned track and refuses further acquisitions.
    pub fn release_all(&self) -> usize {
        let handles: Vec<StreamHandle> = {
            let mut state = self.lock();
            state.shut_down = true;
            state.sender = None;
            state.tracks.iter().map(|t| t.stream_handle).collect()
        };

        handles.into_iter().filter(|handle| self.release(*handle)).count()
    }

    pub fn tracks(&self) -> Vec<MediaTrackState> {
        self.lock().tracks.clone()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.lock().tracks.iter().any(|t| t.kind == MediaKind::Screen)
    }

    pub fn is_screen_track(&self, handle: StreamHandle) -> bool {
        self.lock()
            .tracks
            .iter()
            .any(|t| t.kind == MediaKind::Screen && t.stream_handle == handle)
    }

    pub fn attach_sender(&self, sender: Arc<dyn VideoSender>) {
        self.lock().sender = Some(sender);
    }

    pub fn has_sender(&self) -> bool {
        self.lock().sender.is_some()
    }

    /// Sets the enabled flag for every track of `kind`. The preference also
    /// applies to tracks acquired later.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        let handles: Vec<StreamHandle> = {
            let mut state = self.lock();
            state.preferences.insert(kind, enabled);
            state
                .tracks
                .iter_mut()
                .filter(|t| t.kind == kind)
                .map(|t| {
                    t.enabled = enabled;
                    t.stream_handle
                })
                .collect()
        };

        for handle in handles {
            self.backend.set_track_enabled(handle, enabled);
        }
    }

    /// Flips audio/video, or starts/stops screen sharing. Returns the new state.
    pub async fn toggle(&self, kind: MediaKind) -> CallSessionResult<bool> {
        match kind {
            MediaKind::Screen => {
                if self.is_screen_sharing() {
                    self.stop_screen_share().await?;
                } else {
                    self.start_screen_share().await?;
                }
                Ok(self.is_screen_sharing())
            }
            MediaKind::Audio | MediaKind::Video => {
                let enabled = !self.lock().preference(kind);
                self.set_enabled(kind, enabled);
                Ok(enabled)
            }
        }
    }

    /// Swaps the outgoing video track without touching the peer connection.
    /// Takes ownership of `new_track`: it is released if the swap fails, and
    /// the previous outgoing video track is released if it succeeds.
    pub async fn replace_video_source(&self, new_track: MediaTrackState) -> CallSessionResult<()> {
        let sender = {
            let state = self.lock();
            if state.shut_down {
                None
            } else {
                state.sender.clone()
            }
        };

        let Some(sender) = sender else {
            self.release(new_track.stream_handle);
            return Err(CallSessionError::NoActiveVideoSender);
        };

        if let Err(e) = sender.replace_video_track(new_track.stream_handle).await {
            warn!("Failed to replace outgoing video track: {}", e);
            self.release(new_track.stream_handle);
            return Err(e);
        }

        let previous = {
            let mut state = self.lock();
            if state.shut_down {
                drop(state);
                self.release(new_track.stream_handle);
                return Err(CallSessionError::Cancelled);
            }
            let previous = state.outgoing_video();
            if let Some(previous) = previous {
                state.tracks.retain(|t| t.stream_handle != previous.stream_handle);
            }
            state.tracks.push(new_track);
            previous
        };

        if let Some(previous) = previous {
            self.release(previous.stream_handle);
        }

        info!("Outgoing video switched to {:?} track", new_track.kind);
        Ok(())
    }

    pub async fn start_screen_share(&self) -> CallSessionResult<()> {
        if self.is_screen_sharing() {
            return Ok(());
        }
        if !self.has_sender() {
            return Err(CallSessionError::NoActiveVideoSender);
        }

        let handle = self.backend.open_display_media().await?;
        self.replace_video_source(MediaTrackState {
            kind: MediaKind::Screen,
            enabled: true,
            stream_handle: handle,
        })
        .await
    }

    /// Returns to the camera by reacquiring it.
    pub async fn stop_screen_share(&self) -> CallSessionResult<()> {
        if !self.is_screen_sharing() {
            return Ok(());
        }
        if !self.has_sender() {
            return Err(CallSessionError::NoActiveVideoSender);
        }

        let opened = self
            .backend
            .open_user_media(MediaConstraints::video_only())
            .await?;

        let mut camera = None;
        for (kind, handle) in opened {
            if kind == MediaKind::Video && camera.is_none() {
                camera = Some(handle);
            } else {
                self.release(handle);
            }
        }

        let handle = camera.ok_or_else(|| CallSessionError::DeviceUnavailable {
            message: "no camera track returned".to_string(),
        })?;

        let enabled = self.lock().preference(MediaKind::Video);
        if !enabled {
            self.backend.set_track_enabled(handle, false);
        }

        self.replace_video_source(MediaTrackState {
            kind: MediaKind::Video,
            enabled,
            stream_handle: handle,
        })
        .await
    }
}
