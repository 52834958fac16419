// libs/call-session-cell/src/services/signaling.rs
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{CallSessionError, CallSessionResult};
use crate::models::{ChatMessage, IceCandidate, ParticipantInfo, SessionDescription, SessionId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalingMessageType {
    Offer,
    Answer,
    IceCandidate,
    Bye,
    Join,
    Leave,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub message_type: SignalingMessageType,
    pub session_id: SessionId,
    pub sender_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl SignalingMessage {
    fn with_payload<T: Serialize>(
        message_type: SignalingMessageType,
        session_id: &SessionId,
        sender_id: &str,
        payload: &T,
    ) -> CallSessionResult<Self> {
        Ok(Self {
            message_type,
            session_id: session_id.clone(),
            sender_id: sender_id.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn offer(session_id: &SessionId, sender_id: &str, description: &SessionDescription) -> CallSessionResult<Self> {
        Self::with_payload(SignalingMessageType::Offer, session_id, sender_id, description)
    }

    pub fn answer(session_id: &SessionId, sender_id: &str, description: &SessionDescription) -> CallSessionResult<Self> {
        Self::with_payload(SignalingMessageType::Answer, session_id, sender_id, description)
    }

    pub fn ice_candidate(session_id: &SessionId, sender_id: &str, candidate: &IceCandidate) -> CallSessionResult<Self> {
        Self::with_payload(SignalingMessageType::IceCandidate, session_id, sender_id, candidate)
    }

    pub fn join(session_id: &SessionId, participant: &ParticipantInfo) -> CallSessionResult<Self> {
        Self::with_payload(
            SignalingMessageType::Join,
            session_id,
            &participant.participant_id,
            participant,
        )
    }

    pub fn chat(session_id: &SessionId, message: &ChatMessage) -> CallSessionResult<Self> {
        Self::with_payload(SignalingMessageType::Chat, session_id, &message.sender_id, message)
    }

    pub fn bye(session_id: &SessionId, sender_id: &str) -> Self {
        Self {
            message_type: SignalingMessageType::Bye,
            session_id: session_id.clone(),
            sender_id: sender_id.to_string(),
            payload: Value::Null,
        }
    }

    pub fn leave(session_id: &SessionId, sender_id: &str) -> Self {
        Self {
            message_type: SignalingMessageType::Leave,
            session_id: session_id.clone(),
            sender_id: sender_id.to_string(),
            payload: Value::Null,
        }
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> CallSessionResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

pub type MessageHandler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;

/// Message transport between the two ends of a consultation (e.g. a socket).
/// Delivery is not assumed to be reliable; send failures surface as
/// `SignalingError`.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> CallSessionResult<()>;

    /// Installs the handler for inbound messages, replacing any previous one.
    fn on_message(&self, handler: MessageHandler);
}

#[derive(Default)]
struct Endpoint {
    handler: Mutex<Option<MessageHandler>>,
    backlog: Mutex<Vec<SignalingMessage>>,
    closed: AtomicBool,
}

impl Endpoint {
    fn handler(&self) -> MutexGuard<'_, Option<MessageHandler>> {
        self.handler.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backlog(&self) -> MutexGuard<'_, Vec<SignalingMessage>> {
        self.backlog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, message: SignalingMessage) {
        let handler = self.handler();
        match handler.as_ref() {
            Some(handler) => handler(message),
            None => self.backlog().push(message),
        }
    }
}

/// In-process signaling: two connected ends, each delivering to the other.
/// Messages sent before the far end installs its handler are buffered.
pub struct LoopbackSignaling {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
}

impl LoopbackSignaling {
    pub fn pair() -> (Arc<LoopbackSignaling>, Arc<LoopbackSignaling>) {
        let a = Arc::new(Endpoint::default());
        let b = Arc::new(Endpoint::default());
        (
            Arc::new(LoopbackSignaling {
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
            }),
            Arc::new(LoopbackSignaling { local: b, remote: a }),
        )
    }

    /// Simulates the transport going away: further sends on either end fail.
    pub fn close(&self) {
        self.local.closed.store(true, Ordering::Release);
        self.remote.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.local.closed.load(Ordering::Acquire) || self.remote.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SignalingChannel for LoopbackSignaling {
    async fn send(&self, message: SignalingMessage) -> CallSessionResult<()> {
        if self.is_closed() {
            return Err(CallSessionError::signaling("loopback channel closed"));
        }
        debug!("Loopback signaling {:?} from {}", message.message_type, message.sender_id);
        self.remote.deliver(message);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        let mut slot = self.local.handler();
        let pending: Vec<SignalingMessage> = self.local.backlog().drain(..).collect();
        for message in pending {
            handler(message);
        }
        *slot = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SdpType;

    fn collecting_handler() -> (MessageHandler, Arc<Mutex<Vec<SignalingMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |message| sink.lock().unwrap().push(message));
        (handler, seen)
    }

    #[test]
    fn test_message_wire_format() {
        let description = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "v=0".to_string(),
        };
        let message = SignalingMessage::offer(&SessionId::from("s1"), "p1", &description).unwrap();
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "OFFER");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["payload"]["type"], "offer");

        let decoded: SessionDescription = message.decode_payload().unwrap();
        assert_eq!(decoded, description);
    }

    #[tokio::test]
    async fn test_loopback_buffers_until_handler_installed() {
        let (a, b) = LoopbackSignaling::pair();
        let session = SessionId::from("s1");

        a.send(SignalingMessage::bye(&session, "p1")).await.unwrap();
        a.send(SignalingMessage::leave(&session, "p1")).await.unwrap();

        let (handler, seen) = collecting_handler();
        b.on_message(handler);
        a.send(SignalingMessage::bye(&session, "p1")).await.unwrap();

        let types: Vec<SignalingMessageType> = seen.lock().unwrap().iter().map(|m| m.message_type).collect();
        assert_eq!(
            types,
            vec![
                SignalingMessageType::Bye,
                SignalingMessageType::Leave,
                SignalingMessageType::Bye
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_loopback_reports_signaling_error() {
        let (a, b) = LoopbackSignaling::pair();
        b.close();
        let result = a.send(SignalingMessage::bye(&SessionId::from("s1"), "p1")).await;
        assert!(matches!(result, Err(CallSessionError::SignalingError { .. })));
    }
}
