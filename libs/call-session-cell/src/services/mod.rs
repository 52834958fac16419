// libs/call-session-cell/src/services/mod.rs

pub mod events;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use events::{EventKind, EventPayload, SessionEvent, SessionEventBus, Subscription};
pub use media::{MediaBackend, MediaSourceController, TrackEndedHandler, VideoSender};
pub use peer::{
    NegotiationContext, PeerConnectionAdapter, PeerEvent, RtcEngine, RtcEngineEvent,
    RtcEventHandler,
};
pub use session::{CallSessionManager, SessionHandle};
pub use signaling::{
    LoopbackSignaling, MessageHandler, SignalingChannel, SignalingMessage, SignalingMessageType,
};
