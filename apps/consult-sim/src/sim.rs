// apps/consult-sim/src/sim.rs
//! In-process stand-ins for the browser media and WebRTC stacks.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use call_session_cell::{
    CallSessionError, CallSessionResult, IceCandidate, IceConnectionState, MediaBackend,
    MediaConstraints, MediaKind, RtcEngine, RtcEngineEvent, RtcEventHandler, SdpType,
    SessionDescription, StreamHandle, TrackEndedHandler,
};

const SIGNAL_LATENCY: Duration = Duration::from_millis(40);

pub struct SimulatedMedia {
    label: String,
    deny: bool,
    live: Mutex<Vec<(MediaKind, StreamHandle)>>,
    track_ended: Mutex<Option<TrackEndedHandler>>,
}

impl SimulatedMedia {
    pub fn new(label: &str, deny: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            deny,
            live: Mutex::new(Vec::new()),
            track_ended: Mutex::new(None),
        })
    }

    pub fn live_tracks(&self) -> usize {
        self.live.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Ends the current screen track as if the user clicked "Stop sharing".
    pub fn stop_sharing_from_browser(&self) {
        let screen = self
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|(kind, _)| *kind == MediaKind::Screen)
            .map(|(_, handle)| *handle);

        let handler = self.track_ended.lock().unwrap_or_else(|p| p.into_inner());
        if let (Some(handle), Some(handler)) = (screen, handler.as_ref()) {
            handler(handle);
        }
    }

    fn open(&self, kind: MediaKind) -> StreamHandle {
        let handle = StreamHandle::new();
        self.live.lock().unwrap_or_else(|p| p.into_inner()).push((kind, handle));
        debug!("[{}] opened {:?} track {}", self.label, kind, handle);
        handle
    }
}

#[async_trait]
impl MediaBackend for SimulatedMedia {
    async fn open_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> CallSessionResult<Vec<(MediaKind, StreamHandle)>> {
        sleep(Duration::from_millis(150)).await;
        if self.deny {
            return Err(CallSessionError::PermissionDenied);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push((MediaKind::Audio, self.open(MediaKind::Audio)));
        }
        if constraints.video {
            tracks.push((MediaKind::Video, self.open(MediaKind::Video)));
        }
        Ok(tracks)
    }

    async fn open_display_media(&self) -> CallSessionResult<StreamHandle> {
        sleep(Duration::from_millis(100)).await;
        Ok(self.open(MediaKind::Screen))
    }

    fn set_track_enabled(&self, handle: StreamHandle, enabled: bool) {
        debug!("[{}] track {} enabled={}", self.label, handle, enabled);
    }

    fn stop_track(&self, handle: StreamHandle) {
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(_, h)| *h != handle);
        debug!("[{}] stopped track {}", self.label, handle);
    }

    fn on_track_ended(&self, handler: TrackEndedHandler) {
        *self.track_ended.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }
}

/// Reports ICE `Connected` once an answer is applied on either side. While
/// the link is severed, ICE restarts fail.
pub struct SimulatedEngine {
    label: String,
    ice_servers: Vec<String>,
    severed: AtomicBool,
    handler: Mutex<Option<RtcEventHandler>>,
}

impl SimulatedEngine {
    pub fn new(label: &str, ice_servers: &[String]) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            ice_servers: ice_servers.to_vec(),
            severed: AtomicBool::new(false),
            handler: Mutex::new(None),
        })
    }

    pub fn sever_link(&self) {
        info!("[{}] network link severed", self.label);
        self.severed.store(true, Ordering::SeqCst);
        self.emit(RtcEngineEvent::IceStateChanged(IceConnectionState::Disconnected));
    }

    pub fn restore_link(&self) {
        info!("[{}] network link restored", self.label);
        self.severed.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: RtcEngineEvent) {
        if let Some(handler) = self.handler.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            handler(event);
        }
    }

    fn answer_applied(&self) {
        if self.severed.load(Ordering::SeqCst) {
            return;
        }
        self.emit(RtcEngineEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.10 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
        // One server-reflexive candidate per configured STUN/TURN server.
        for (index, server) in self.ice_servers.iter().enumerate() {
            debug!("[{}] gathered reflexive candidate via {}", self.label, server);
            self.emit(RtcEngineEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 1686052607 203.0.113.{} 54400 typ srflx raddr 192.0.2.10 rport 54400",
                    index + 2,
                    index + 7
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        }
        self.emit(RtcEngineEvent::IceStateChanged(IceConnectionState::Checking));
        self.emit(RtcEngineEvent::IceStateChanged(IceConnectionState::Connected));
    }

    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: format!("v=0\r\no={} 0 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.label),
        }
    }
}

#[async_trait]
impl RtcEngine for SimulatedEngine {
    async fn add_track(&self, kind: MediaKind, handle: StreamHandle) -> CallSessionResult<()> {
        debug!("[{}] sending {:?} track {}", self.label, kind, handle);
        Ok(())
    }

    async fn create_offer(&self) -> CallSessionResult<SessionDescription> {
        sleep(SIGNAL_LATENCY).await;
        Ok(self.description(SdpType::Offer))
    }

    async fn create_answer(&self) -> CallSessionResult<SessionDescription> {
        sleep(SIGNAL_LATENCY).await;
        Ok(self.description(SdpType::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallSessionResult<()> {
        if description.sdp_type == SdpType::Answer {
            self.answer_applied();
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallSessionResult<()> {
        if description.sdp_type == SdpType::Answer {
            self.answer_applied();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallSessionResult<()> {
        debug!("[{}] remote candidate {}", self.label, candidate.candidate);
        Ok(())
    }

    async fn replace_video_track(&self, handle: StreamHandle) -> CallSessionResult<()> {
        debug!("[{}] outgoing video now {}", self.label, handle);
        Ok(())
    }

    async fn restart_ice(&self) -> CallSessionResult<()> {
        sleep(SIGNAL_LATENCY).await;
        if self.severed.load(Ordering::SeqCst) {
            return Err(CallSessionError::signaling("no route to peer"));
        }
        Ok(())
    }

    async fn close(&self) {
        debug!("[{}] peer connection closed", self.label);
    }

    fn on_event(&self, handler: RtcEventHandler) {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_candidates(engine: &SimulatedEngine) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_event(Box::new(move |event| {
            if let RtcEngineEvent::LocalCandidate(candidate) = event {
                sink.lock().unwrap().push(candidate.candidate);
            }
        }));
        seen
    }

    #[tokio::test]
    async fn test_gathers_reflexive_candidate_per_ice_server() {
        let servers = vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun.clinic.example:3478".to_string(),
        ];
        let engine = SimulatedEngine::new("provider", &servers);
        let seen = collect_candidates(&engine);

        engine
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp: "v=0".to_string(),
            })
            .await
            .unwrap();

        let candidates = seen.lock().unwrap().clone();
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].ends_with("typ host"));
        assert_eq!(candidates.iter().filter(|c| c.contains("typ srflx")).count(), 2);
    }

    #[tokio::test]
    async fn test_no_ice_servers_gathers_host_candidate_only() {
        let engine = SimulatedEngine::new("patient", &[]);
        let seen = collect_candidates(&engine);

        engine
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp: "v=0".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
