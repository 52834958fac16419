// libs/call-session-cell/src/services/events.rs
//! Typed publish/subscribe channel between the session and presentation code.
//!
//! Delivery is synchronous and strictly ordered: events are queued and drained
//! by whichever `publish` call finds the bus idle, so a handler is never run
//! concurrently with itself and a publish issued from inside a handler is
//! delivered after the event currently being dispatched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::{
    ChatMessage, IceConnectionState, MediaKind, ParticipantInfo, SessionId, SessionStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Participant,
    Chat,
    Media,
    Connection,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    StatusChanged {
        previous: SessionStatus,
        current: SessionStatus,
    },
    ParticipantJoined {
        participant: ParticipantInfo,
    },
    ParticipantUpdated {
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        participant_id: String,
    },
    ChatReceived {
        message: ChatMessage,
    },
    MediaChanged {
        kind: MediaKind,
        enabled: bool,
    },
    ScreenShareChanged {
        active: bool,
    },
    RemoteTrackAdded {
        kind: MediaKind,
    },
    IceStateChanged {
        state: IceConnectionState,
    },
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::StatusChanged { .. } => EventKind::Status,
            EventPayload::ParticipantJoined { .. }
            | EventPayload::ParticipantUpdated { .. }
            | EventPayload::ParticipantLeft { .. } => EventKind::Participant,
            EventPayload::ChatReceived { .. } => EventKind::Chat,
            EventPayload::MediaChanged { .. }
            | EventPayload::ScreenShareChanged { .. }
            | EventPayload::RemoteTrackAdded { .. } => EventKind::Media,
            EventPayload::IceStateChanged { .. } | EventPayload::ReconnectScheduled { .. } => {
                EventKind::Connection
            }
            EventPayload::Error { .. } => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, payload: EventPayload) -> Self {
        Self {
            session_id,
            emitted_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The new status, if this is a status change.
    pub fn status(&self) -> Option<SessionStatus> {
        match &self.payload {
            EventPayload::StatusChanged { current, .. } => Some(*current),
            _ => None,
        }
    }
}

type Handler = Box<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscriber {
    id: Uuid,
    filter: Option<EventKind>,
    active: Arc<AtomicBool>,
    handler: Handler,
}

impl Subscriber {
    fn accepts(&self, event: &SessionEvent) -> bool {
        self.filter.map_or(true, |kind| kind == event.kind())
    }
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Arc<Subscriber>>,
    pending: VecDeque<Vec<SessionEvent>>,
    dispatching: bool,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle returned by `subscribe`; dropping it keeps the subscription alive.
#[derive(Clone)]
pub struct Subscription {
    id: Uuid,
    active: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stops delivery immediately, including for the rest of an in-flight publish.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().subscribers.retain(|s| s.id != self.id);
        }
        debug!("Subscription {} removed", self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct SessionEventBus {
    inner: Arc<BusInner>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.add_subscriber(Some(kind), Box::new(handler))
    }

    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.add_subscriber(None, Box::new(handler))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn publish(&self, event: SessionEvent) {
        self.publish_batch(vec![event]);
    }

    /// Delivers `events` in order. A subscriber that unsubscribes while
    /// handling one of them receives none of the remaining ones.
    pub fn publish_batch(&self, events: Vec<SessionEvent>) {
        self.enqueue(events);
        self.flush();
    }

    /// Queues events without delivering them; used by the state machine so the
    /// queue order matches the order of transitions taken under its lock.
    pub(crate) fn enqueue(&self, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        self.inner.lock().pending.push_back(events);
    }

    /// Drains the queue unless another call is already draining it.
    pub(crate) fn flush(&self) {
        {
            let mut state = self.inner.lock();
            if state.dispatching || state.pending.is_empty() {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let (batch, subscribers) = {
                let mut state = self.inner.lock();
                match state.pending.pop_front() {
                    Some(batch) => (batch, state.subscribers.clone()),
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };

            for event in &batch {
                for subscriber in &subscribers {
                    if !subscriber.active.load(Ordering::Acquire) || !subscriber.accepts(event) {
                        continue;
                    }
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event)));
                    if outcome.is_err() {
                        error!(
                            "Event handler {} panicked while handling {:?} event",
                            subscriber.id,
                            event.kind()
                        );
                    }
                }
            }
        }
    }

    fn add_subscriber(&self, filter: Option<EventKind>, handler: Handler) -> Subscription {
        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Arc::new(Subscriber {
            id,
            filter,
            active: Arc::clone(&active),
            handler,
        });
        self.inner.lock().subscribers.push(subscriber);
        debug!("Subscription {} added for {:?}", id, filter);

        Subscription {
            id,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn status_event(current: SessionStatus) -> SessionEvent {
        SessionEvent::new(
            SessionId::from("s1"),
            EventPayload::StatusChanged {
                previous: SessionStatus::Idle,
                current,
            },
        )
    }

    fn chat_event(content: &str) -> SessionEvent {
        SessionEvent::new(
            SessionId::from("s1"),
            EventPayload::ChatReceived {
                message: ChatMessage {
                    message_id: Uuid::new_v4(),
                    sender_id: "p1".to_string(),
                    content: content.to_string(),
                    sent_at: Utc::now(),
                    sequence: 0,
                },
            },
        )
    }

    #[test]
    fn test_delivers_in_emission_order() {
        let bus = SessionEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::Status, move |event| {
            sink.lock().unwrap().push(event.status().unwrap());
        });

        bus.publish(status_event(SessionStatus::AcquiringMedia));
        bus.publish(status_event(SessionStatus::Negotiating));
        bus.publish(status_event(SessionStatus::Connected));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionStatus::AcquiringMedia,
                SessionStatus::Negotiating,
                SessionStatus::Connected
            ]
        );
    }

    #[test]
    fn test_filters_by_kind() {
        let bus = SessionEventBus::new();
        let chats = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&chats);
        bus.subscribe(EventKind::Chat, move |_| *sink.lock().unwrap() += 1);

        bus.publish(status_event(SessionStatus::AcquiringMedia));
        bus.publish(chat_event("hello"));

        assert_eq!(*chats.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe_inside_handler_stops_rest_of_batch() {
        let bus = SessionEventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let handle: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let sink = Arc::clone(&seen);
        let own = Arc::clone(&handle);
        let subscription = bus.subscribe_all(move |_| {
            *sink.lock().unwrap() += 1;
            if let Some(subscription) = own.get() {
                subscription.unsubscribe();
            }
        });
        handle.set(subscription).unwrap();

        bus.publish_batch(vec![
            status_event(SessionStatus::AcquiringMedia),
            status_event(SessionStatus::Negotiating),
            status_event(SessionStatus::Connected),
        ]);
        bus.publish(status_event(SessionStatus::Ended));

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_reentrant_publish_is_queued() {
        let bus = SessionEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        bus.subscribe(EventKind::Status, move |event| {
            if event.status() == Some(SessionStatus::AcquiringMedia) {
                inner_bus.publish(chat_event("from handler"));
            }
        });
        let sink = Arc::clone(&seen);
        bus.subscribe_all(move |event| sink.lock().unwrap().push(event.kind()));

        bus.publish(status_event(SessionStatus::AcquiringMedia));

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Status, EventKind::Chat]);
    }

    #[test]
    fn test_panicking_handler_does_not_block_bus() {
        let bus = SessionEventBus::new();
        let seen = Arc::new(Mutex::new(0));
        bus.subscribe_all(|_| panic!("handler failure"));
        let sink = Arc::clone(&seen);
        bus.subscribe_all(move |_| *sink.lock().unwrap() += 1);

        bus.publish(status_event(SessionStatus::AcquiringMedia));
        bus.publish(status_event(SessionStatus::Negotiating));

        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = SessionEventBus::new();
        let subscription = bus.subscribe_all(|_| {});
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
