// libs/call-session-cell/src/services/peer.rs
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{CallSessionError, CallSessionResult};
use crate::models::{
    IceCandidate, IceConnectionState, MediaKind, MediaTrackState, NegotiationRole, SdpType,
    SessionDescription, SessionId, StreamHandle,
};
use crate::services::media::VideoSender;
use crate::services::signaling::{SignalingChannel, SignalingMessage, SignalingMessageType};

#[derive(Debug, Clone, PartialEq)]
pub enum RtcEngineEvent {
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    RemoteTrack(MediaKind),
}

pub type RtcEventHandler = Box<dyn Fn(RtcEngineEvent) + Send + Sync>;

/// Platform peer connection (RTCPeerConnection). The adapter drives it; the
/// engine never owns the media tracks it is given.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn add_track(&self, kind: MediaKind, handle: StreamHandle) -> CallSessionResult<()>;
    async fn create_offer(&self) -> CallSessionResult<SessionDescription>;
    async fn create_answer(&self) -> CallSessionResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> CallSessionResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> CallSessionResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallSessionResult<()>;
    async fn replace_video_track(&self, handle: StreamHandle) -> CallSessionResult<()>;
    async fn restart_ice(&self) -> CallSessionResult<()>;
    async fn close(&self);
    fn on_event(&self, handler: RtcEventHandler);
}

/// What the adapter reports to the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceStateChanged(IceConnectionState),
    RemoteTrack(MediaKind),
    /// Session-level signaling (JOIN, LEAVE, CHAT, BYE) for the state machine.
    Signal(SignalingMessage),
    NegotiationError(String),
}

#[derive(Debug, Clone)]
pub struct NegotiationContext {
    pub session_id: SessionId,
    pub local_participant_id: String,
    pub role: NegotiationRole,
}

#[derive(Debug, Clone, PartialEq)]
enum Link {
    Ice(IceConnectionState),
    Error(String),
}

enum PumpInput {
    Signal(SignalingMessage),
    Engine(RtcEngineEvent),
}

struct PeerShared {
    engine: Arc<dyn RtcEngine>,
    signaling: Arc<dyn SignalingChannel>,
    events: mpsc::UnboundedSender<PeerEvent>,
    link: watch::Sender<Link>,
    context: OnceLock<NegotiationContext>,
    closed: AtomicBool,
}

/// Offer/answer/ICE negotiation over a signaling channel.
///
/// Inbound signaling and engine callbacks are funneled through one pump task,
/// so remote descriptions and candidates are applied in arrival order.
pub struct PeerConnectionAdapter {
    shared: Arc<PeerShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnectionAdapter {
    pub fn new(
        engine: Arc<dyn RtcEngine>,
        signaling: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (link, _) = watch::channel(Link::Ice(IceConnectionState::New));
        Self {
            shared: Arc::new(PeerShared {
                engine,
                signaling,
                events,
                link,
                context: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Hands the local tracks to the engine. Only the handles are borrowed.
    pub async fn add_local_tracks(&self, tracks: &[MediaTrackState]) -> CallSessionResult<()> {
        for track in tracks {
            self.shared.engine.add_track(track.kind, track.stream_handle).await?;
        }
        Ok(())
    }

    /// Negotiates the connection and resolves once ICE is connected.
    #[instrument(skip(self), fields(session_id = %context.session_id))]
    pub async fn connect(&self, context: NegotiationContext) -> CallSessionResult<()> {
        self.ensure_open()?;
        self.shared.link.send_replace(Link::Ice(IceConnectionState::New));
        self.install(context)?;

        if self.role() == Some(NegotiationRole::Offerer) {
            self.send_offer().await?;
        }

        self.wait_until_connected().await
    }

    /// ICE restart after a connection drop. The offerer re-offers; the answerer
    /// waits for the new offer.
    pub async fn reconnect(&self) -> CallSessionResult<()> {
        self.ensure_open()?;
        if self.shared.context.get().is_none() {
            return Err(CallSessionError::invalid_state("not connected"));
        }

        self.shared.link.send_replace(Link::Ice(IceConnectionState::Checking));
        self.shared
            .engine
            .restart_ice()
            .await
            .map_err(|e| CallSessionError::signaling(format!("ICE restart failed: {}", e)))?;

        if self.role() == Some(NegotiationRole::Offerer) {
            self.send_offer().await?;
        }

        self.wait_until_connected().await
    }

    /// Sends a fresh offer on the live connection. Failures are reported as
    /// `RenegotiationFailed` and do not affect the connection state.
    pub async fn renegotiate(&self) -> CallSessionResult<()> {
        if self.is_closed() || self.shared.context.get().is_none() {
            return Err(CallSessionError::RenegotiationFailed {
                message: "no active peer connection".to_string(),
            });
        }

        self.send_offer()
            .await
            .map_err(|e| CallSessionError::RenegotiationFailed { message: e.to_string() })
    }

    /// Sends a session-level message over the signaling channel.
    pub async fn send_signal(&self, message: SignalingMessage) -> CallSessionResult<()> {
        self.shared.signaling.send(message).await
    }

    /// Idempotent. Sends BYE if a session was negotiated, then closes the engine.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(context) = self.shared.context.get() {
            let bye = SignalingMessage::bye(&context.session_id, &context.local_participant_id);
            if let Err(e) = self.shared.signaling.send(bye).await {
                warn!("Failed to send BYE for session {}: {}", context.session_id, e);
            }
        }

        self.shared.engine.close().await;

        let pump = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(pump) = pump {
            pump.abort();
        }

        self.shared.link.send_replace(Link::Ice(IceConnectionState::Closed));
        info!("Peer connection closed");
    }

    fn ensure_open(&self) -> CallSessionResult<()> {
        if self.is_closed() {
            return Err(CallSessionError::signaling("peer connection closed"));
        }
        Ok(())
    }

    fn role(&self) -> Option<NegotiationRole> {
        self.shared.context.get().map(|c| c.role)
    }

    /// Wires signaling and engine callbacks into the pump. Runs once per adapter.
    fn install(&self, context: NegotiationContext) -> CallSessionResult<()> {
        let mut pump = self.pump.lock().unwrap_or_else(|p| p.into_inner());
        if pump.is_some() {
            return Ok(());
        }

        if self.shared.context.set(context).is_err() {
            return Err(CallSessionError::invalid_state("negotiation context already set"));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let signal_tx = tx.clone();
        self.shared.signaling.on_message(Arc::new(move |message| {
            let _ = signal_tx.send(PumpInput::Signal(message));
        }));

        let engine_tx = tx;
        self.shared.engine.on_event(Box::new(move |event| {
            let _ = engine_tx.send(PumpInput::Engine(event));
        }));

        *pump = Some(tokio::spawn(run_pump(Arc::clone(&self.shared), rx)));
        Ok(())
    }

    async fn send_offer(&self) -> CallSessionResult<()> {
        let context = self
            .shared
            .context
            .get()
            .ok_or_else(|| CallSessionError::invalid_state("not negotiating"))?;

        let offer = self.shared.engine.create_offer().await?;
        self.shared.engine.set_local_description(offer.clone()).await?;
        let message = SignalingMessage::offer(&context.session_id, &context.local_participant_id, &offer)?;
        self.shared.signaling.send(message).await?;
        debug!("Offer sent for session {}", context.session_id);
        Ok(())
    }

    async fn wait_until_connected(&self) -> CallSessionResult<()> {
        let mut link = self.shared.link.subscribe();
        let outcome = link
            .wait_for(|state| match state {
                Link::Ice(ice) => ice.is_connected() || *ice == IceConnectionState::Failed || *ice == IceConnectionState::Closed,
                Link::Error(_) => true,
            })
            .await
            .map(|state| state.clone())
            .map_err(|_| CallSessionError::signaling("peer connection dropped"))?;

        match outcome {
            Link::Ice(ice) if ice.is_connected() => Ok(()),
            Link::Ice(ice) => Err(CallSessionError::signaling(format!("ICE {:?}", ice))),
            Link::Error(message) => Err(CallSessionError::signaling(message)),
        }
    }
}

#[async_trait]
impl VideoSender for PeerConnectionAdapter {
    async fn replace_video_track(&self, handle: StreamHandle) -> CallSessionResult<()> {
        if self.is_closed() {
            return Err(CallSessionError::NoActiveVideoSender);
        }
        self.shared.engine.replace_video_track(handle).await
    }
}

async fn run_pump(shared: Arc<PeerShared>, mut inputs: mpsc::UnboundedReceiver<PumpInput>) {
    let Some(context) = shared.context.get().cloned() else {
        return;
    };

    while let Some(input) = inputs.recv().await {
        match input {
            PumpInput::Signal(message) => handle_signal(&shared, &context, message).await,
            PumpInput::Engine(event) => handle_engine_event(&shared, &context, event).await,
        }
    }
    debug!("Peer pump for session {} stopped", context.session_id);
}

async fn handle_signal(shared: &PeerShared, context: &NegotiationContext, message: SignalingMessage) {
    if message.session_id != context.session_id {
        debug!("Ignoring signaling for foreign session {}", message.session_id);
        return;
    }
    if message.sender_id == context.local_participant_id {
        return;
    }

    match message.message_type {
        SignalingMessageType::Offer => {
            if let Err(e) = answer_offer(shared, context, &message).await {
                report_error(shared, format!("failed to answer offer: {}", e));
            }
        }
        SignalingMessageType::Answer => {
            let applied = match message.decode_payload::<SessionDescription>() {
                Ok(answer) if answer.sdp_type == SdpType::Answer => {
                    shared.engine.set_remote_description(answer).await
                }
                Ok(_) => Err(CallSessionError::signaling("ANSWER carried a non-answer description")),
                Err(e) => Err(e),
            };
            if let Err(e) = applied {
                report_error(shared, format!("failed to apply answer: {}", e));
            }
        }
        SignalingMessageType::IceCandidate => match message.decode_payload::<IceCandidate>() {
            Ok(candidate) => {
                if let Err(e) = shared.engine.add_ice_candidate(candidate).await {
                    warn!("Dropping remote ICE candidate: {}", e);
                }
            }
            Err(e) => warn!("Malformed ICE candidate: {}", e),
        },
        SignalingMessageType::Bye
        | SignalingMessageType::Join
        | SignalingMessageType::Leave
        | SignalingMessageType::Chat => {
            let _ = shared.events.send(PeerEvent::Signal(message));
        }
    }
}

async fn answer_offer(
    shared: &PeerShared,
    context: &NegotiationContext,
    message: &SignalingMessage,
) -> CallSessionResult<()> {
    let offer: SessionDescription = message.decode_payload()?;
    if offer.sdp_type != SdpType::Offer {
        return Err(CallSessionError::signaling("OFFER carried a non-offer description"));
    }

    shared.engine.set_remote_description(offer).await?;
    let answer = shared.engine.create_answer().await?;
    shared.engine.set_local_description(answer.clone()).await?;
    let reply = SignalingMessage::answer(&context.session_id, &context.local_participant_id, &answer)?;
    shared.signaling.send(reply).await
}

async fn handle_engine_event(shared: &PeerShared, context: &NegotiationContext, event: RtcEngineEvent) {
    match event {
        RtcEngineEvent::LocalCandidate(candidate) => {
            let sent = match SignalingMessage::ice_candidate(
                &context.session_id,
                &context.local_participant_id,
                &candidate,
            ) {
                Ok(message) => shared.signaling.send(message).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("Failed to send local ICE candidate: {}", e);
            }
        }
        RtcEngineEvent::IceStateChanged(state) => {
            debug!("ICE state for session {}: {:?}", context.session_id, state);
            shared.link.send_replace(Link::Ice(state));
            let _ = shared.events.send(PeerEvent::IceStateChanged(state));
        }
        RtcEngineEvent::RemoteTrack(kind) => {
            let _ = shared.events.send(PeerEvent::RemoteTrack(kind));
        }
    }
}

fn report_error(shared: &PeerShared, message: String) {
    warn!("Negotiation error: {}", message);
    shared.link.send_replace(Link::Error(message.clone()));
    let _ = shared.events.send(PeerEvent::NegotiationError(message));
}
