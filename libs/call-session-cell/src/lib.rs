// libs/call-session-cell/src/lib.rs
//! # Call Session Cell
//!
//! Client-side lifecycle of a patient/provider video consultation: local
//! media, WebRTC negotiation over a signaling channel, automatic
//! reconnection, in-call chat and a typed event bus for the UI layer.
//!
//! ## Features
//!
//! - **Session State Machine**: one writer for `SessionStatus`, explicit transition table
//! - **Media Ownership**: camera, microphone and screen tracks released exactly once
//! - **Screen Sharing**: outgoing video swapped in place, camera restored afterwards
//! - **Reconnection**: bounded exponential backoff, manual retry after the budget is spent
//! - **Chat**: trimmed, non-empty messages with a gap-free local sequence
//! - **Event Bus**: ordered, non-reentrant delivery with per-kind subscriptions
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                 Call Session Cell                   |
//! +-----------------------------------------------------+
//! |  models.rs      |  Status, participants, media, SDP |
//! |  error.rs       |  CallSessionError                 |
//! |  services/      |  Session logic                    |
//! |    session.rs   |  CallSessionManager + driver task |
//! |    media.rs     |  MediaSourceController            |
//! |    peer.rs      |  PeerConnectionAdapter            |
//! |    signaling.rs |  Signaling wire format + loopback |
//! |    events.rs    |  SessionEventBus                  |
//! +-----------------------------------------------------+
//! ```
//!
//! Platform access is injected through three traits: [`MediaBackend`]
//! (getUserMedia/getDisplayMedia), [`RtcEngine`] (RTCPeerConnection) and
//! [`SignalingChannel`] (transport to the other participant).
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use call_session_cell::{CallSessionManager, EventKind, LoopbackSignaling, MediaBackend, RtcEngine};
//! use shared_config::CallSessionConfig;
//! use shared_models::{LocalParticipant, ParticipantRole};
//! use std::sync::Arc;
//!
//! # async fn example(media: Arc<dyn MediaBackend>, engine: Arc<dyn RtcEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let (signaling, _remote) = LoopbackSignaling::pair();
//! let manager = CallSessionManager::new(CallSessionConfig::from_env(), media, engine, signaling);
//!
//! let _status = manager.events().subscribe(EventKind::Status, |event| {
//!     println!("status: {:?}", event.status());
//! });
//!
//! let local = LocalParticipant::new("dr-1", "Dr. Mensah", ParticipantRole::Provider);
//! let mut handle = manager.start("consult-42", local)?;
//! let status = handle.wait_terminal().await;
//! println!("call finished as {}", status);
//! manager.end().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See [`shared_config::CallSessionConfig::from_env`] for the `CALL_*`
//! environment variables (negotiation timeout, backoff, ICE servers).

pub mod error;
pub mod models;
pub mod services;

pub use error::{CallSessionError, CallSessionResult};
pub use shared_models::{LocalParticipant, ParticipantRole};

pub use models::{
    ChatMessage, ConnectionState, FailureReason, IceCandidate, IceConnectionState, MediaConstraints,
    MediaKind, MediaTrackState, NegotiationRole, ParticipantInfo, SdpType, SessionDescription,
    SessionId, SessionStatus, StreamHandle,
};

pub use services::{
    CallSessionManager, EventKind, EventPayload, LoopbackSignaling, MediaBackend,
    MediaSourceController, MessageHandler, PeerConnectionAdapter, PeerEvent, RtcEngine,
    RtcEngineEvent, RtcEventHandler, SessionEvent, SessionEventBus, SessionHandle, SignalingChannel,
    SignalingMessage, SignalingMessageType, Subscription, TrackEndedHandler, VideoSender,
};
