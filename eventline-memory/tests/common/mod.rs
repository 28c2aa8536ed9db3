//! Shared fixtures for the engine integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use eventline::store::{Criteria, Store};
use eventline::{
    async_trait, DefaultSubscriptionEngine, Event, EventId, FrozenClock, HandledEvents, Message,
    RunMode, StreamName, Subscriber, SubscriberDescriptor, SubscriberError, SubscriberId,
    SubscriberRegistry, SubscriberResult, Subscription, SubscriptionStore,
};
use eventline_memory::{InMemoryStore, InMemorySubscriptionStore};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileEvent {
    Created { name: String },
    Renamed { name: String },
    /// Makes [`RecordingSubscriber`] fail while it is unhealthy.
    Poisoned,
}

impl Event for ProfileEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "profile.created",
            Self::Renamed { .. } => "profile.renamed",
            Self::Poisoned => "profile.poisoned",
        }
    }
}

pub fn created(name: &str) -> ProfileEvent {
    ProfileEvent::Created {
        name: name.to_string(),
    }
}

pub fn renamed(name: &str) -> ProfileEvent {
    ProfileEvent::Renamed {
        name: name.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot project poisoned profile")]
pub struct PoisonedProfile;

#[derive(Debug, thiserror::Error)]
#[error("read model table is missing")]
pub struct MissingTable;

/// Subscriber that records every delivered message.
///
/// While unhealthy it fails on [`ProfileEvent::Poisoned`]; healing it
/// simulates deploying a fix.
pub struct RecordingSubscriber {
    handled: HandledEvents,
    seen: Mutex<Vec<EventId>>,
    healthy: AtomicBool,
    setup_fails: AtomicBool,
    teardown_fails: AtomicBool,
    pub setup_calls: AtomicUsize,
    pub teardown_calls: AtomicUsize,
    pub handle_calls: AtomicUsize,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self {
            handled: HandledEvents::All,
            seen: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(false),
            setup_fails: AtomicBool::new(false),
            teardown_fails: AtomicBool::new(false),
            setup_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
            handle_calls: AtomicUsize::new(0),
        }
    }

    pub fn handling(mut self, handled: HandledEvents) -> Self {
        self.handled = handled;
        self
    }

    pub fn with_setup(mut self, fails: bool) -> Self {
        self.setup_fails = AtomicBool::new(fails);
        self
    }

    pub fn with_teardown(mut self, fails: bool) -> Self {
        self.teardown_fails = AtomicBool::new(fails);
        self
    }

    pub fn heal(&self) {
        self.healthy.store(true, Ordering::SeqCst);
        self.setup_fails.store(false, Ordering::SeqCst);
        self.teardown_fails.store(false, Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<EventId> {
        self.seen.lock().clone()
    }

    pub fn handle_count(&self) -> usize {
        self.handle_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber<ProfileEvent> for RecordingSubscriber {
    fn handled_events(&self) -> HandledEvents {
        self.handled.clone()
    }

    async fn handle(&self, message: &Message<ProfileEvent>) -> SubscriberResult<()> {
        self.handle_calls.fetch_add(1, Ordering::SeqCst);
        if *message.event() == ProfileEvent::Poisoned && !self.healthy.load(Ordering::SeqCst) {
            return Err(PoisonedProfile.into());
        }
        self.seen.lock().push(message.headers().event_id);
        Ok(())
    }

    async fn setup(&self) -> SubscriberResult<()> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        if self.setup_fails.load(Ordering::SeqCst) {
            return Err(MissingTable.into());
        }
        Ok(())
    }

    async fn teardown(&self) -> SubscriberResult<()> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        if self.teardown_fails.load(Ordering::SeqCst) {
            return Err(SubscriberError::new("could not drop read model table"));
        }
        Ok(())
    }
}

pub fn id(raw: &str) -> SubscriberId {
    SubscriberId::try_new(raw).unwrap()
}

pub fn message(stream: &str, playhead: u64, event: ProfileEvent) -> Message<ProfileEvent> {
    Message::new(event)
        .with_stream(StreamName::try_new(stream).unwrap())
        .with_playhead(playhead)
}

pub fn descriptor(
    raw_id: &str,
    subscriber: &Arc<RecordingSubscriber>,
) -> SubscriberDescriptor<ProfileEvent> {
    SubscriberDescriptor::new(id(raw_id), subscriber.clone())
}

pub fn once(raw_id: &str, subscriber: &Arc<RecordingSubscriber>) -> SubscriberDescriptor<ProfileEvent> {
    descriptor(raw_id, subscriber).with_run_mode(RunMode::Once)
}

pub fn registry(
    descriptors: Vec<SubscriberDescriptor<ProfileEvent>>,
) -> SubscriberRegistry<ProfileEvent> {
    let mut registry = SubscriberRegistry::new();
    for descriptor in descriptors {
        registry.register(descriptor).unwrap();
    }
    registry
}

/// Shared stores plus a controllable clock. Engines built from one harness
/// behave like workers sharing one database.
pub struct Harness {
    pub store: InMemoryStore<ProfileEvent>,
    pub subscriptions: InMemorySubscriptionStore,
    pub clock: Arc<FrozenClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }

    pub fn with_store(store: InMemoryStore<ProfileEvent>) -> Self {
        Self {
            store,
            subscriptions: InMemorySubscriptionStore::new(),
            clock: Arc::new(FrozenClock::default()),
        }
    }

    pub fn engine(
        &self,
        registry: SubscriberRegistry<ProfileEvent>,
    ) -> DefaultSubscriptionEngine<ProfileEvent> {
        DefaultSubscriptionEngine::new(
            Arc::new(self.store.clone()),
            Arc::new(self.subscriptions.clone()),
            Arc::new(registry),
        )
        .with_clock(self.clock.clone())
    }

    /// Appends `events` to `stream`, continuing its playhead.
    pub async fn append(&self, stream: &str, events: Vec<ProfileEvent>) {
        let existing = self
            .store
            .count(&Criteria::new().stream_name(stream))
            .await
            .unwrap();
        let messages = events
            .into_iter()
            .zip(existing + 1..)
            .map(|(event, playhead)| message(stream, playhead, event))
            .collect();
        self.store.save(messages).await.unwrap();
    }

    pub async fn subscription(&self, raw_id: &str) -> Subscription {
        self.subscriptions
            .get(&id(raw_id))
            .await
            .unwrap()
            .expect("subscription should exist")
    }

    pub async fn exists(&self, raw_id: &str) -> bool {
        self.subscriptions.get(&id(raw_id)).await.unwrap().is_some()
    }

    /// Event ids stored at indices greater than `after`, in index order.
    pub fn event_ids_after(&self, after: u64) -> Vec<EventId> {
        self.store
            .messages()
            .into_iter()
            .filter(|(index, _)| *index > after)
            .map(|(_, message)| message.headers().event_id)
            .collect()
    }
}
