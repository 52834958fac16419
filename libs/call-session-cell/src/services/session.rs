// libs/call-session-cell/src/services/session.rs
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::CallSessionConfig;
use shared_models::participant::LocalParticipant;

use crate::error::{CallSessionError, CallSessionResult};
use crate::models::{
    ChatMessage, ConnectionState, FailureReason, IceConnectionState, MediaConstraints, MediaKind,
    MediaTrackState, NegotiationRole, ParticipantInfo, SessionId, SessionStatus, StreamHandle,
};
use crate::services::events::{EventPayload, SessionEvent, SessionEventBus};
use crate::services::media::{MediaBackend, MediaSourceController, VideoSender};
use crate::services::peer::{NegotiationContext, PeerConnectionAdapter, PeerEvent, RtcEngine};
use crate::services::signaling::{SignalingChannel, SignalingMessage, SignalingMessageType};

enum Command {
    Retry,
}

struct DriverInputs {
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ended_tracks: mpsc::UnboundedReceiver<StreamHandle>,
    commands: mpsc::UnboundedReceiver<Command>,
}

struct SessionState {
    status: SessionStatus,
    session_id: SessionId,
    local: Option<LocalParticipant>,
    participants: Vec<ParticipantInfo>,
    chat: Vec<ChatMessage>,
    next_sequence: u64,
}

impl SessionState {
    fn event(&self, payload: EventPayload) -> SessionEvent {
        SessionEvent::new(self.session_id.clone(), payload)
    }

    fn local_id(&self) -> Option<&str> {
        self.local.as_ref().map(|l| l.participant_id.as_str())
    }
}

/// What a peer event means for the phase currently running.
enum Observed {
    Nothing,
    Ice(IceConnectionState),
    Hangup,
}

struct SessionShared {
    config: CallSessionConfig,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    bus: SessionEventBus,
    media: Arc<MediaSourceController>,
    peer: Arc<PeerConnectionAdapter>,
    cancel: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<Command>,
    inputs: Mutex<Option<DriverInputs>>,
    torn_down: AtomicBool,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Applies `next` and queues its events while the caller holds the state
    /// lock, so no caller can observe a half-applied transition.
    fn apply_transition(&self, state: &mut SessionState, next: SessionStatus) -> bool {
        let previous = state.status;
        if !previous.can_transition_to(&next) {
            debug!("Ignoring transition {} -> {} for session {}", previous, next, state.session_id);
            return false;
        }

        state.status = next;
        self.status_tx.send_replace(next);

        let mut events = vec![state.event(EventPayload::StatusChanged {
            previous,
            current: next,
        })];

        let connection_state = match next {
            SessionStatus::Negotiating => Some(ConnectionState::Connecting),
            SessionStatus::Connected => Some(ConnectionState::Connected),
            SessionStatus::Reconnecting => Some(ConnectionState::Disconnected),
            SessionStatus::Failed { .. } => Some(ConnectionState::Failed),
            SessionStatus::Ended => Some(ConnectionState::Closed),
            SessionStatus::Idle | SessionStatus::AcquiringMedia => None,
        };

        if let (Some(connection_state), Some(local_id)) = (connection_state, state.local_id().map(str::to_string)) {
            if let Some(me) = state
                .participants
                .iter_mut()
                .find(|p| p.participant_id == local_id && p.connection_state != connection_state)
            {
                me.connection_state = connection_state;
                let participant = me.clone();
                events.push(state.event(EventPayload::ParticipantUpdated { participant }));
            }
        }

        self.bus.enqueue(events);
        info!("Session {} status {} -> {}", state.session_id, previous, next);
        true
    }

    fn transition(&self, next: SessionStatus) -> bool {
        let applied = {
            let mut state = self.lock();
            self.apply_transition(&mut state, next)
        };
        self.bus.flush();
        applied
    }

    fn publish(&self, payload: EventPayload) {
        {
            let state = self.lock();
            self.bus.enqueue(vec![state.event(payload)]);
        }
        self.bus.flush();
    }

    fn record_chat(&self, mut message: ChatMessage) -> ChatMessage {
        {
            let mut state = self.lock();
            message.sequence = state.next_sequence;
            state.next_sequence += 1;
            state.chat.push(message.clone());
            let event = state.event(EventPayload::ChatReceived {
                message: message.clone(),
            });
            self.bus.enqueue(vec![event]);
        }
        self.bus.flush();
        message
    }

    fn upsert_participant(&self, mut participant: ParticipantInfo) {
        participant.connection_state = ConnectionState::Connected;
        {
            let mut state = self.lock();
            let payload = match state
                .participants
                .iter()
                .position(|p| p.participant_id == participant.participant_id)
            {
                Some(index) => {
                    state.participants[index] = participant.clone();
                    EventPayload::ParticipantUpdated { participant }
                }
                None => {
                    state.participants.push(participant.clone());
                    EventPayload::ParticipantJoined { participant }
                }
            };
            let event = state.event(payload);
            self.bus.enqueue(vec![event]);
        }
        self.bus.flush();
    }

    fn remove_participant(&self, participant_id: &str) {
        {
            let mut state = self.lock();
            let before = state.participants.len();
            state.participants.retain(|p| p.participant_id != participant_id);
            if state.participants.len() == before {
                return;
            }
            let event = state.event(EventPayload::ParticipantLeft {
                participant_id: participant_id.to_string(),
            });
            self.bus.enqueue(vec![event]);
        }
        self.bus.flush();
    }

    fn handle_peer_event(&self, event: PeerEvent) -> Observed {
        match event {
            PeerEvent::IceStateChanged(state) => {
                self.publish(EventPayload::IceStateChanged { state });
                Observed::Ice(state)
            }
            PeerEvent::RemoteTrack(kind) => {
                debug!("Remote {:?} track received", kind);
                self.publish(EventPayload::RemoteTrackAdded { kind });
                Observed::Nothing
            }
            PeerEvent::NegotiationError(message) => {
                self.publish(EventPayload::Error {
                    message,
                    recoverable: true,
                });
                Observed::Nothing
            }
            PeerEvent::Signal(message) => self.handle_signal(message),
        }
    }

    fn handle_signal(&self, message: SignalingMessage) -> Observed {
        match message.message_type {
            SignalingMessageType::Join => match message.decode_payload::<ParticipantInfo>() {
                Ok(participant) => {
                    info!("Participant {} joined", participant.participant_id);
                    self.upsert_participant(participant);
                }
                Err(e) => warn!("Malformed JOIN from {}: {}", message.sender_id, e),
            },
            SignalingMessageType::Leave => {
                info!("Participant {} left", message.sender_id);
                self.remove_participant(&message.sender_id);
            }
            SignalingMessageType::Chat => match message.decode_payload::<ChatMessage>() {
                Ok(chat) => {
                    self.record_chat(chat);
                }
                Err(e) => warn!("Malformed CHAT from {}: {}", message.sender_id, e),
            },
            SignalingMessageType::Bye => {
                info!("Participant {} hung up", message.sender_id);
                self.remove_participant(&message.sender_id);
                return Observed::Hangup;
            }
            SignalingMessageType::Offer
            | SignalingMessageType::Answer
            | SignalingMessageType::IceCandidate => {}
        }
        Observed::Nothing
    }

    async fn handle_track_ended(&self, handle: StreamHandle) {
        if self.media.is_screen_track(handle) {
            info!("Screen share ended by the platform");
            match self.media.stop_screen_share().await {
                Ok(()) => self.publish(EventPayload::ScreenShareChanged { active: false }),
                Err(e) => self.publish(EventPayload::Error {
                    message: format!("failed to return to camera: {}", e),
                    recoverable: true,
                }),
            }
            return;
        }

        let Some(kind) = self
            .media
            .tracks()
            .into_iter()
            .find(|t| t.stream_handle == handle)
            .map(|t| t.kind)
        else {
            return;
        };

        if self.media.release(handle) {
            warn!("Local {:?} track {} ended unexpectedly", kind, handle);
            self.publish(EventPayload::MediaChanged { kind, enabled: false });
            self.publish(EventPayload::Error {
                message: format!("local {:?} track ended by the device", kind),
                recoverable: true,
            });
        }
    }

    /// Releases media and closes the peer connection. Runs at most once.
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let released = self.media.release_all();
        self.peer.close().await;
        let session_id = {
            let mut state = self.lock();
            state.participants.clear();
            state.session_id.clone()
        };
        info!("Session {} torn down, released {} track(s)", session_id, released);
    }

    /// Reports `cause`, tears down unless the failure is retryable, and moves
    /// to `Failed`. Returns whether the transition was taken.
    async fn fail(&self, reason: FailureReason, cause: &CallSessionError) -> bool {
        if self.status().is_terminal() {
            return false;
        }

        error!("Session failed ({:?}): {}", reason, cause);
        let retryable = reason == FailureReason::ConnectionLost;
        self.publish(EventPayload::Error {
            message: cause.to_string(),
            recoverable: retryable,
        });

        if !retryable {
            self.teardown().await;
        }
        self.transition(SessionStatus::Failed { reason })
    }

    async fn end_by_remote(&self) {
        self.transition(SessionStatus::Ended);
        self.cancel.send_replace(true);
        self.teardown().await;
    }

    async fn announce(&self) {
        let (session_id, me) = {
            let state = self.lock();
            let me = state
                .local_id()
                .and_then(|id| state.participants.iter().find(|p| p.participant_id == id))
                .cloned();
            (state.session_id.clone(), me)
        };

        let Some(me) = me else {
            return;
        };

        let sent = match SignalingMessage::join(&session_id, &me) {
            Ok(message) => self.peer.send_signal(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Failed to announce participant {}: {}", me.participant_id, e);
            self.publish(EventPayload::Error {
                message: e.to_string(),
                recoverable: true,
            });
        }
    }
}

/// Observes the status of a started session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Resolves with the first status (current one included) matching
    /// `predicate`. Short-lived intermediate states may be skipped; use the
    /// event bus to see every transition.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> SessionStatus
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let observed = self
            .status
            .wait_for(|status| predicate(status))
            .await
            .map(|status| *status);
        match observed {
            Ok(status) => status,
            Err(_) => *self.status.borrow(),
        }
    }

    pub async fn wait_terminal(&mut self) -> SessionStatus {
        self.wait_for(SessionStatus::is_terminal).await
    }
}

/// Lifecycle of one audio/video consultation.
///
/// The manager is the only writer of [`SessionStatus`]. A single driver task,
/// spawned by [`start`](Self::start), sequences media acquisition, negotiation
/// and reconnection; every change is published on [`events`](Self::events).
/// One instance serves one call.
pub struct CallSessionManager {
    shared: Arc<SessionShared>,
}

impl CallSessionManager {
    pub fn new(
        config: CallSessionConfig,
        media: Arc<dyn MediaBackend>,
        engine: Arc<dyn RtcEngine>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (track_tx, ended_tracks) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let media = Arc::new(MediaSourceController::new(media));
        media.on_track_ended(Box::new(move |handle| {
            let _ = track_tx.send(handle);
        }));

        let peer = Arc::new(PeerConnectionAdapter::new(engine, signaling, peer_tx));
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        let (cancel, _) = watch::channel(false);

        Self {
            shared: Arc::new(SessionShared {
                config,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Idle,
                    session_id: SessionId::default(),
                    local: None,
                    participants: Vec::new(),
                    chat: Vec::new(),
                    next_sequence: 0,
                }),
                status_tx,
                bus: SessionEventBus::new(),
                media,
                peer,
                cancel,
                commands,
                inputs: Mutex::new(Some(DriverInputs {
                    peer_events,
                    ended_tracks,
                    commands: command_rx,
                })),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.shared.bus
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        let state = self.shared.lock();
        state.local.as_ref().map(|_| state.session_id.clone())
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.shared.lock().participants.clone()
    }

    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.shared.lock().chat.clone()
    }

    pub fn media_tracks(&self) -> Vec<MediaTrackState> {
        self.shared.media.tracks()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.shared.media.is_screen_sharing()
    }

    /// Begins the call and returns immediately; progress is reported on the
    /// event bus. Must be called from within a Tokio runtime.
    #[instrument(skip_all, fields(participant_id = %local.participant_id))]
    pub fn start(
        &self,
        session_id: impl Into<SessionId>,
        local: LocalParticipant,
    ) -> CallSessionResult<SessionHandle> {
        let session_id = session_id.into();

        let inputs = {
            let mut state = self.shared.lock();
            if state.status != SessionStatus::Idle {
                return Err(CallSessionError::AlreadyStarted);
            }
            let inputs = self
                .shared
                .inputs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .ok_or(CallSessionError::AlreadyStarted)?;

            let me = ParticipantInfo::from_local(&local);
            state.session_id = session_id.clone();
            state.local = Some(local.clone());
            state.participants.push(me.clone());

            self.shared.apply_transition(&mut state, SessionStatus::AcquiringMedia);
            let joined = state.event(EventPayload::ParticipantJoined { participant: me });
            self.shared.bus.enqueue(vec![joined]);
            inputs
        };
        self.shared.bus.flush();

        info!("Starting session {} as {}", session_id, local.role);

        let driver = SessionDriver {
            shared: Arc::clone(&self.shared),
            inputs,
            cancel: self.shared.cancel.subscribe(),
            context: NegotiationContext {
                session_id: session_id.clone(),
                local_participant_id: local.participant_id.clone(),
                role: NegotiationRole::for_participant(local.role),
            },
            announced: false,
        };
        tokio::spawn(driver.run());

        Ok(SessionHandle {
            session_id,
            status: self.shared.status_tx.subscribe(),
        })
    }

    /// Idempotent. Ends the call, cancelling whatever the driver is waiting
    /// on, and releases all media and the peer connection.
    pub async fn end(&self) {
        let release = {
            let mut state = self.shared.lock();
            let current = state.status;
            match current {
                SessionStatus::Failed {
                    reason: FailureReason::ConnectionLost,
                } => true,
                status if status.is_terminal() => false,
                _ => self.shared.apply_transition(&mut state, SessionStatus::Ended),
            }
        };

        if release {
            self.shared.cancel.send_replace(true);
            self.shared.teardown().await;
        }
        self.shared.bus.flush();
    }

    /// Audio/video: flips the enabled flag. Screen: starts or stops sharing.
    /// Returns the new state.
    pub async fn toggle_media(&self, kind: MediaKind) -> CallSessionResult<bool> {
        let status = self.status();
        if !status.is_active() {
            return Err(CallSessionError::invalid_state(status));
        }

        let enabled = self.shared.media.toggle(kind).await?;
        let payload = match kind {
            MediaKind::Screen => EventPayload::ScreenShareChanged { active: enabled },
            MediaKind::Audio | MediaKind::Video => EventPayload::MediaChanged { kind, enabled },
        };
        self.shared.publish(payload);
        Ok(enabled)
    }

    /// Manual retry from `Reconnecting` or `Failed(ConnectionLost)`.
    pub fn retry_connection(&self) -> CallSessionResult<()> {
        {
            let mut state = self.shared.lock();
            if !state.status.can_retry() {
                return Err(CallSessionError::invalid_state(state.status));
            }
            self.shared.apply_transition(&mut state, SessionStatus::Negotiating);
        }
        self.shared.bus.flush();

        info!("Manual reconnect requested");
        let _ = self.shared.commands.send(Command::Retry);
        Ok(())
    }

    /// Sends an in-call chat message and appends it to the local history.
    pub async fn send_chat(&self, content: &str) -> CallSessionResult<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CallSessionError::EmptyMessage);
        }

        let (session_id, sender_id) = {
            let state = self.shared.lock();
            if !state.status.is_active() {
                return Err(CallSessionError::invalid_state(state.status));
            }
            let sender_id = state.local_id().unwrap_or_default().to_string();
            (state.session_id.clone(), sender_id)
        };

        let message = ChatMessage {
            message_id: Uuid::new_v4(),
            sender_id,
            content: content.to_string(),
            sent_at: Utc::now(),
            sequence: 0,
        };

        // Only delivered messages enter the history.
        let outbound = SignalingMessage::chat(&session_id, &message)?;
        if let Err(e) = self.shared.peer.send_signal(outbound).await {
            warn!("Chat message {} was not delivered: {}", message.message_id, e);
            self.shared.publish(EventPayload::Error {
                message: e.to_string(),
                recoverable: true,
            });
            return Err(e);
        }

        Ok(self.shared.record_chat(message))
    }

    /// Re-offers on the live connection. A failure is published as a
    /// recoverable error and leaves the status untouched.
    pub async fn renegotiate(&self) -> CallSessionResult<()> {
        let status = self.status();
        if status != SessionStatus::Connected {
            return Err(CallSessionError::invalid_state(status));
        }

        if let Err(e) = self.shared.peer.renegotiate().await {
            self.shared.publish(EventPayload::Error {
                message: e.to_string(),
                recoverable: true,
            });
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for CallSessionManager {
    fn drop(&mut self) {
        if self.shared.torn_down.load(Ordering::Acquire) || self.status() == SessionStatus::Idle {
            return;
        }

        warn!("Call session dropped without end(), releasing resources");
        self.shared.cancel.send_replace(true);
        self.shared.torn_down.store(true, Ordering::Release);
        self.shared.media.release_all();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let peer = Arc::clone(&self.shared.peer);
            runtime.spawn(async move { peer.close().await });
        }
    }
}

// ==============================================================================
// SESSION DRIVER
// ==============================================================================

enum Phase {
    AcquireMedia,
    Negotiate { restart: bool },
    Connected,
    Reconnect,
    AwaitRetry,
    Done,
}

enum Wake<T> {
    Ready(T),
    Ice(IceConnectionState),
    Retry,
    /// `end()` was called or the remote side hung up.
    Stopped,
}

#[derive(Clone, Copy)]
struct Interest {
    ice: Option<fn(&IceConnectionState) -> bool>,
    retry: bool,
}

impl Interest {
    const NONE: Interest = Interest { ice: None, retry: false };
    const INTERRUPTION: Interest = Interest {
        ice: Some(IceConnectionState::is_interrupted),
        retry: false,
    };
    const RECOVERY: Interest = Interest {
        ice: Some(IceConnectionState::is_connected),
        retry: true,
    };
    const RETRY: Interest = Interest { ice: None, retry: true };

    fn wants_ice(&self, state: &IceConnectionState) -> bool {
        self.ice.map_or(false, |matches| matches(state))
    }
}

struct SessionDriver {
    shared: Arc<SessionShared>,
    inputs: DriverInputs,
    cancel: watch::Receiver<bool>,
    context: NegotiationContext,
    announced: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut phase = Phase::AcquireMedia;
        loop {
            phase = match phase {
                Phase::AcquireMedia => self.acquire_media().await,
                Phase::Negotiate { restart } => self.negotiate(restart).await,
                Phase::Connected => self.stay_connected().await,
                Phase::Reconnect => self.reconnect().await,
                Phase::AwaitRetry => self.await_retry().await,
                Phase::Done => break,
            };
        }
        debug!("Session driver for {} finished", self.context.session_id);
    }

    /// Polls `fut` while servicing peer events, platform track endings,
    /// cancellation and (if `interest.retry`) manual retries.
    async fn wait<F: Future>(&mut self, fut: F, interest: Interest) -> Wake<F::Output> {
        tokio::pin!(fut);

        loop {
            if *self.cancel.borrow() {
                return Wake::Stopped;
            }

            tokio::select! {
                biased;

                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return Wake::Stopped;
                    }
                }
                Some(command) = self.inputs.commands.recv(), if interest.retry => {
                    match command {
                        Command::Retry if self.shared.status() == SessionStatus::Negotiating => {
                            return Wake::Retry;
                        }
                        Command::Retry => debug!("Discarding stale retry request"),
                    }
                }
                Some(event) = self.inputs.peer_events.recv() => {
                    match self.shared.handle_peer_event(event) {
                        Observed::Hangup => {
                            self.shared.end_by_remote().await;
                            return Wake::Stopped;
                        }
                        Observed::Ice(state) if interest.wants_ice(&state) => return Wake::Ice(state),
                        Observed::Ice(_) | Observed::Nothing => {}
                    }
                }
                Some(handle) = self.inputs.ended_tracks.recv() => {
                    self.shared.handle_track_ended(handle).await;
                }
                output = &mut fut => return Wake::Ready(output),
            }
        }
    }

    async fn acquire_media(&mut self) -> Phase {
        let media = Arc::clone(&self.shared.media);
        let acquisition = tokio::spawn(async move { media.acquire(MediaConstraints::default()).await });

        let tracks = match self.wait(acquisition, Interest::NONE).await {
            Wake::Ready(Ok(Ok(tracks))) => tracks,
            Wake::Ready(Ok(Err(CallSessionError::Cancelled))) => return Phase::Done,
            Wake::Ready(Ok(Err(e))) => {
                let reason = match e.failure_reason() {
                    Some(FailureReason::MediaDenied) => FailureReason::MediaDenied,
                    _ => FailureReason::MediaUnavailable,
                };
                self.shared.fail(reason, &e).await;
                return Phase::Done;
            }
            Wake::Ready(Err(join_error)) => {
                let e = CallSessionError::DeviceUnavailable {
                    message: join_error.to_string(),
                };
                self.shared.fail(FailureReason::MediaUnavailable, &e).await;
                return Phase::Done;
            }
            Wake::Ice(_) | Wake::Retry | Wake::Stopped => return Phase::Done,
        };

        if !self.shared.transition(SessionStatus::Negotiating) {
            return Phase::Done;
        }

        if let Err(e) = self.shared.peer.add_local_tracks(&tracks).await {
            self.shared.fail(FailureReason::SignalingError, &e).await;
            return Phase::Done;
        }

        Phase::Negotiate { restart: false }
    }

    async fn negotiate(&mut self, restart: bool) -> Phase {
        let peer = Arc::clone(&self.shared.peer);
        let context = self.context.clone();
        let limit = self.shared.config.negotiation_timeout;

        let attempt = async move {
            if restart {
                peer.reconnect().await
            } else {
                peer.connect(context).await
            }
        };

        match self.wait(timeout(limit, attempt), Interest::NONE).await {
            Wake::Ready(Ok(Ok(()))) => self.on_connected().await,
            Wake::Ready(Ok(Err(e))) => {
                self.shared.fail(FailureReason::SignalingError, &e).await;
                Phase::Done
            }
            Wake::Ready(Err(_)) => {
                let e = CallSessionError::signaling(format!("negotiation timed out after {:?}", limit));
                self.shared.fail(FailureReason::SignalingError, &e).await;
                Phase::Done
            }
            Wake::Ice(_) | Wake::Retry | Wake::Stopped => Phase::Done,
        }
    }

    async fn on_connected(&mut self) -> Phase {
        let sender: Arc<dyn VideoSender> = self.shared.peer.clone();
        self.shared.media.attach_sender(sender);

        if !self.shared.transition(SessionStatus::Connected) {
            return Phase::Done;
        }

        if !self.announced {
            self.announced = true;
            self.shared.announce().await;
        }
        Phase::Connected
    }

    async fn stay_connected(&mut self) -> Phase {
        match self.wait(std::future::pending::<()>(), Interest::INTERRUPTION).await {
            Wake::Ice(state) => {
                warn!("ICE {:?} on session {}, reconnecting", state, self.context.session_id);
                if self.shared.transition(SessionStatus::Reconnecting) {
                    Phase::Reconnect
                } else {
                    Phase::Done
                }
            }
            Wake::Ready(()) => Phase::Connected,
            Wake::Retry | Wake::Stopped => Phase::Done,
        }
    }

    async fn reconnect(&mut self) -> Phase {
        let policy = self.shared.config.reconnect.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for_attempt(attempt);
            info!(
                "Reconnect attempt {}/{} for session {} in {:?}",
                attempt, policy.max_attempts, self.context.session_id, delay
            );
            self.shared.publish(EventPayload::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            match self.wait(sleep(delay), Interest::RECOVERY).await {
                Wake::Ready(()) => {}
                Wake::Ice(_) => return self.on_recovered(),
                Wake::Retry => return Phase::Negotiate { restart: true },
                Wake::Stopped => return Phase::Done,
            }

            let peer = Arc::clone(&self.shared.peer);
            let try_reconnect = timeout(policy.attempt_timeout, async move { peer.reconnect().await });
            match self.wait(try_reconnect, Interest::RECOVERY).await {
                Wake::Ready(Ok(Ok(()))) | Wake::Ice(_) => return self.on_recovered(),
                Wake::Ready(Ok(Err(e))) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                Wake::Ready(Err(_)) => warn!("Reconnect attempt {} timed out", attempt),
                Wake::Retry => return Phase::Negotiate { restart: true },
                Wake::Stopped => return Phase::Done,
            }
        }

        if self
            .shared
            .fail(FailureReason::ConnectionLost, &CallSessionError::ConnectionLost)
            .await
        {
            Phase::AwaitRetry
        } else if self.shared.status() == SessionStatus::Negotiating {
            Phase::Negotiate { restart: true }
        } else {
            Phase::Done
        }
    }

    fn on_recovered(&mut self) -> Phase {
        if self.shared.transition(SessionStatus::Connected) {
            info!("Session {} recovered", self.context.session_id);
            Phase::Connected
        } else {
            Phase::Done
        }
    }

    async fn await_retry(&mut self) -> Phase {
        match self.wait(std::future::pending::<()>(), Interest::RETRY).await {
            Wake::Retry => Phase::Negotiate { restart: true },
            Wake::Ready(()) => Phase::AwaitRetry,
            Wake::Ice(_) | Wake::Stopped => Phase::Done,
        }
    }
}
