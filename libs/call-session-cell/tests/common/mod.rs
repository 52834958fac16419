// =====================================================================================
// CALL SESSION TEST DOUBLES
// Scripted media backend, RTC engine and remote participant
// =====================================================================================
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use call_session_cell::{
    CallSessionError, CallSessionManager, CallSessionResult, ConnectionState, IceCandidate,
    IceConnectionState, LoopbackSignaling, MediaBackend, MediaConstraints, MediaKind,
    ParticipantInfo, RtcEngine, RtcEngineEvent, RtcEventHandler, SdpType, SessionDescription,
    SessionEvent, SessionHandle, SessionId, SessionStatus, SignalingChannel, SignalingMessage,
    SignalingMessageType, StreamHandle, Subscription, TrackEndedHandler,
};
use shared_models::{LocalParticipant, ParticipantRole};
use shared_utils::test_utils::{TestConfig, TestParticipant};

pub const SESSION_ID: &str = "consult-42";

pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// =====================================================================================
// MEDIA BACKEND
// =====================================================================================

#[derive(Default)]
pub struct FakeMediaBackend {
    deny: AtomicBool,
    hold: AtomicBool,
    gate: Notify,
    open_calls: AtomicUsize,
    opened: Mutex<Vec<(MediaKind, StreamHandle)>>,
    stopped: Mutex<Vec<StreamHandle>>,
    enabled_calls: Mutex<Vec<(StreamHandle, bool)>>,
    track_ended: Mutex<Option<TrackEndedHandler>>,
}

impl FakeMediaBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        let backend = Self::default();
        backend.deny.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    /// `open_user_media` blocks until `release_acquisition` is called.
    pub fn held() -> Arc<Self> {
        let backend = Self::default();
        backend.hold.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn release_acquisition(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<(MediaKind, StreamHandle)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn opened_of(&self, kind: MediaKind) -> Vec<StreamHandle> {
        self.opened()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, handle)| handle)
            .collect()
    }

    pub fn stopped(&self) -> Vec<StreamHandle> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn stop_count(&self, handle: StreamHandle) -> usize {
        self.stopped().iter().filter(|h| **h == handle).count()
    }

    /// Handles opened and not yet stopped.
    pub fn live_tracks(&self) -> Vec<StreamHandle> {
        let stopped = self.stopped();
        self.opened()
            .into_iter()
            .map(|(_, handle)| handle)
            .filter(|handle| !stopped.contains(handle))
            .collect()
    }

    pub fn enabled_calls(&self) -> Vec<(StreamHandle, bool)> {
        self.enabled_calls.lock().unwrap().clone()
    }

    /// Simulates the platform ending a track (e.g. "Stop sharing" in the browser).
    pub fn end_track(&self, handle: StreamHandle) {
        if let Some(handler) = self.track_ended.lock().unwrap().as_ref() {
            handler(handle);
        }
    }

    fn open(&self, kind: MediaKind) -> StreamHandle {
        let handle = StreamHandle::new();
        self.opened.lock().unwrap().push((kind, handle));
        handle
    }
}

#[async_trait]
impl MediaBackend for FakeMediaBackend {
    async fn open_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> CallSessionResult<Vec<(MediaKind, StreamHandle)>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.deny.load(Ordering::SeqCst) {
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
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallSessionError::PermissionDenied);
        }
        Ok(self.open(MediaKind::Screen))
    }

    fn set_track_enabled(&self, handle: StreamHandle, enabled: bool) {
        self.enabled_calls.lock().unwrap().push((handle, enabled));
    }

    fn stop_track(&self, handle: StreamHandle) {
        self.stopped.lock().unwrap().push(handle);
    }

    fn on_track_ended(&self, handler: TrackEndedHandler) {
        *self.track_ended.lock().unwrap() = Some(handler);
    }
}

// =====================================================================================
// RTC ENGINE
// =====================================================================================

/// Reports ICE `Connected` whenever an answer is applied, locally or remotely.
pub struct FakeRtcEngine {
    handler: Mutex<Option<RtcEventHandler>>,
    auto_connect: AtomicBool,
    fail_restart: AtomicBool,
    fail_offers: AtomicBool,
    offers: AtomicUsize,
    restarts: AtomicUsize,
    closes: AtomicUsize,
    tracks: Mutex<Vec<(MediaKind, StreamHandle)>>,
    replaced: Mutex<Vec<StreamHandle>>,
}

impl FakeRtcEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            auto_connect: AtomicBool::new(true),
            fail_restart: AtomicBool::new(false),
            fail_offers: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
        })
    }

    pub fn silent() -> Arc<Self> {
        let engine = Self::new();
        engine.auto_connect.store(false, Ordering::SeqCst);
        engine
    }

    pub fn emit(&self, event: RtcEngineEvent) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(event);
        }
    }

    pub fn set_ice(&self, state: IceConnectionState) {
        self.emit(RtcEngineEvent::IceStateChanged(state));
    }

    /// When off, answers are applied but ICE never reports `Connected`.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<(MediaKind, StreamHandle)> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn replaced(&self) -> Vec<StreamHandle> {
        self.replaced.lock().unwrap().clone()
    }

    fn answer_applied(&self) {
        if self.auto_connect.load(Ordering::SeqCst) {
            self.set_ice(IceConnectionState::Connected);
        }
    }
}

fn description(sdp_type: SdpType) -> SessionDescription {
    SessionDescription {
        sdp_type,
        sdp: format!("v=0 {:?}", sdp_type),
    }
}

#[async_trait]
impl RtcEngine for FakeRtcEngine {
    async fn add_track(&self, kind: MediaKind, handle: StreamHandle) -> CallSessionResult<()> {
        self.tracks.lock().unwrap().push((kind, handle));
        Ok(())
    }

    async fn create_offer(&self) -> CallSessionResult<SessionDescription> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(CallSessionError::signaling("createOffer rejected"));
        }
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(description(SdpType::Offer))
    }

    async fn create_answer(&self) -> CallSessionResult<SessionDescription> {
        Ok(description(SdpType::Answer))
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

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> CallSessionResult<()> {
        Ok(())
    }

    async fn replace_video_track(&self, handle: StreamHandle) -> CallSessionResult<()> {
        self.replaced.lock().unwrap().push(handle);
        Ok(())
    }

    async fn restart_ice(&self) -> CallSessionResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(CallSessionError::signaling("no route to peer"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_event(&self, handler: RtcEventHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

// =====================================================================================
// REMOTE PARTICIPANT
// =====================================================================================

/// The other end of the signaling channel. Answers every offer it receives.
pub struct RemoteParty {
    pub participant_id: String,
    session_id: SessionId,
    signaling: Arc<LoopbackSignaling>,
    received: Arc<Mutex<Vec<SignalingMessage>>>,
}

impl RemoteParty {
    pub fn attach(signaling: Arc<LoopbackSignaling>, session_id: &str, participant_id: &str) -> Self {
        let session_id = SessionId::from(session_id);
        let received = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let sink = Arc::clone(&received);
        signaling.on_message(Arc::new(move |message: SignalingMessage| {
            sink.lock().unwrap().push(message.clone());
            let _ = tx.send(message);
        }));

        let responder = Arc::clone(&signaling);
        let reply_session = session_id.clone();
        let reply_sender = participant_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if message.message_type != SignalingMessageType::Offer {
                    continue;
                }
                if let Ok(answer) = SignalingMessage::answer(&reply_session, &reply_sender, &description(SdpType::Answer)) {
                    let _ = responder.send(answer).await;
                }
            }
        });

        Self {
            participant_id: participant_id.to_string(),
            session_id,
            signaling,
            received,
        }
    }

    pub fn received(&self) -> Vec<SignalingMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_of(&self, message_type: SignalingMessageType) -> Vec<SignalingMessage> {
        self.received()
            .into_iter()
            .filter(|m| m.message_type == message_type)
            .collect()
    }

    pub async fn announce(&self, display_name: &str) {
        let me = ParticipantInfo {
            participant_id: self.participant_id.clone(),
            display_name: display_name.to_string(),
            role: ParticipantRole::Patient,
            joined_at: Utc::now(),
            connection_state: ConnectionState::Connected,
        };
        let join = SignalingMessage::join(&self.session_id, &me).unwrap();
        self.signaling.send(join).await.unwrap();
    }

    pub async fn send_chat(&self, content: &str) {
        let message = call_session_cell::ChatMessage {
            message_id: uuid::Uuid::new_v4(),
            sender_id: self.participant_id.clone(),
            content: content.to_string(),
            sent_at: Utc::now(),
            sequence: 0,
        };
        let chat = SignalingMessage::chat(&self.session_id, &message).unwrap();
        self.signaling.send(chat).await.unwrap();
    }

    /// Drops the signaling transport; later sends from either side fail.
    pub fn disconnect(&self) {
        self.signaling.close();
    }

    pub async fn hang_up(&self) {
        let bye = SignalingMessage::bye(&self.session_id, &self.participant_id);
        self.signaling.send(bye).await.unwrap();
    }
}

// =====================================================================================
// HARNESS
// =====================================================================================

pub struct Harness {
    pub manager: CallSessionManager,
    pub media: Arc<FakeMediaBackend>,
    pub engine: Arc<FakeRtcEngine>,
    pub remote: RemoteParty,
    pub local: LocalParticipant,
}

impl Harness {
    /// A provider (offerer) session against a remote patient that answers.
    pub fn provider() -> Self {
        Self::build(TestConfig::default(), FakeMediaBackend::new(), FakeRtcEngine::new())
    }

    pub fn build(config: TestConfig, media: Arc<FakeMediaBackend>, engine: Arc<FakeRtcEngine>) -> Self {
        let (local_signaling, remote_signaling) = LoopbackSignaling::pair();
        let manager = CallSessionManager::new(
            config.to_call_config(),
            media.clone(),
            engine.clone(),
            local_signaling,
        );
        let local = TestParticipant::doctor("Dr. Mensah")
            .with_id("provider-1")
            .to_local_participant();

        Self {
            manager,
            media,
            engine,
            remote: RemoteParty::attach(remote_signaling, SESSION_ID, "patient-1"),
            local,
        }
    }

    pub fn start(&self) -> SessionHandle {
        self.manager.start(SESSION_ID, self.local.clone()).unwrap()
    }

    pub async fn connect(&self) -> SessionHandle {
        let mut handle = self.start();
        let status = handle
            .wait_for(|s| *s == SessionStatus::Connected || s.is_terminal())
            .await;
        assert_eq!(status, SessionStatus::Connected);
        handle
    }
}

// =====================================================================================
// EVENT RECORDING
// =====================================================================================

pub struct Recorder {
    pub subscription: Subscription,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Recorder {
    pub fn attach(manager: &CallSessionManager) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = manager
            .events()
            .subscribe_all(move |event| sink.lock().unwrap().push(event.clone()));
        Self { subscription, events }
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.events().iter().filter_map(SessionEvent::status).collect()
    }
}
