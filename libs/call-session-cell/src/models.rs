// libs/call-session-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use shared_models::participant::{LocalParticipant, ParticipantRole};

// ==============================================================================
// SESSION IDENTITY
// ==============================================================================

/// Opaque identifier of one consultation, created by the caller of `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ==============================================================================
// SESSION STATUS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    MediaDenied,
    MediaUnavailable,
    SignalingError,
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Idle,
    AcquiringMedia,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
    Failed { reason: FailureReason },
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Failed { .. })
    }

    /// States between `start()` and teardown in which media controls apply.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::AcquiringMedia
                | SessionStatus::Negotiating
                | SessionStatus::Connected
                | SessionStatus::Reconnecting
        )
    }

    /// Whether `retry_connection()` is accepted from this state.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            SessionStatus::Reconnecting
                | SessionStatus::Failed {
                    reason: FailureReason::ConnectionLost
                }
        )
    }

    pub fn can_transition_to(&self, next: &SessionStatus) -> bool {
        use SessionStatus::*;

        match (self, next) {
            (Idle, AcquiringMedia) => true,
            (AcquiringMedia, Negotiating) => true,
            (AcquiringMedia, Failed { reason }) => {
                matches!(reason, FailureReason::MediaDenied | FailureReason::MediaUnavailable)
            }
            (Negotiating, Connected) => true,
            (Negotiating, Failed { reason }) => *reason == FailureReason::SignalingError,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connected) => true,
            (Reconnecting, Negotiating) => true,
            (Reconnecting, Failed { reason }) => *reason == FailureReason::ConnectionLost,
            (Failed { reason: FailureReason::ConnectionLost }, Negotiating) => true,
            (current, Ended) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "IDLE"),
            SessionStatus::AcquiringMedia => write!(f, "ACQUIRING_MEDIA"),
            SessionStatus::Negotiating => write!(f, "NEGOTIATING"),
            SessionStatus::Connected => write!(f, "CONNECTED"),
            SessionStatus::Reconnecting => write!(f, "RECONNECTING"),
            SessionStatus::Ended => write!(f, "ENDED"),
            SessionStatus::Failed { reason } => write!(f, "FAILED({:?})", reason),
        }
    }
}

// ==============================================================================
// PARTICIPANTS
// ==============================================================================

/// WebRTC connection states as seen by participants
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub connection_state: ConnectionState,
}

impl ParticipantInfo {
    pub fn from_local(local: &LocalParticipant) -> Self {
        Self {
            participant_id: local.participant_id.clone(),
            display_name: local.display_name.clone(),
            role: local.role,
            joined_at: Utc::now(),
            connection_state: ConnectionState::Connecting,
        }
    }
}

// ==============================================================================
// MEDIA
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    /// Camera and screen tracks both go out on the video sender.
    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Screen)
    }
}

/// Ownership token for one OS/browser media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamHandle(Uuid);

impl StreamHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaTrackState {
    pub kind: MediaKind,
    pub enabled: bool,
    pub stream_handle: StreamHandle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
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
    pub fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

// ==============================================================================
// CHAT
// ==============================================================================

/// In-call chat message. `sequence` is assigned locally when the message is
/// appended to the session log; it is not a cross-participant order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub sender_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
}

// ==============================================================================
// WEBRTC NEGOTIATION
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, IceConnectionState::Disconnected | IceConnectionState::Failed)
    }
}

impl From<IceConnectionState> for ConnectionState {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New | IceConnectionState::Checking => ConnectionState::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => ConnectionState::Connected,
            IceConnectionState::Disconnected => ConnectionState::Disconnected,
            IceConnectionState::Failed => ConnectionState::Failed,
            IceConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// Which side of the offer/answer exchange this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

impl NegotiationRole {
    /// Providers place the call; patients answer it.
    pub fn for_participant(role: ParticipantRole) -> Self {
        match role {
            ParticipantRole::Provider => NegotiationRole::Offerer,
            ParticipantRole::Patient => NegotiationRole::Answerer,
        }
    }
}
