//! In-memory adapters for `eventline`
//!
//! This crate provides in-memory implementations of the [`Store`] and
//! [`SubscriptionStore`] traits, useful for tests and development where
//! persistence is not required. Both are cheap to clone; clones share the
//! same underlying data, so two engines built on clones behave like two
//! workers sharing one database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use eventline::errors::{
    StoreError, StoreResult, SubscriptionStoreError, SubscriptionStoreResult,
};
use eventline::store::{
    ensure_persistable, Criteria, Criterion, LoadOptions, MessageStream, Store, StreamPattern,
    VecMessageStream,
};
use eventline::subscription::{
    LockableSubscriptionStore, Subscription, SubscriptionCriteria, SubscriptionStore,
};
use eventline::types::{EventId, StreamName, SubscriberId, Timestamp};
use eventline::{Event, Message};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

struct Log<E> {
    messages: Vec<(u64, Message<E>)>,
    next_index: u64,
}

/// Thread-safe in-memory event log.
///
/// Indices start at 1 and increase by one per saved message.
pub struct InMemoryStore<E> {
    log: Arc<RwLock<Log<E>>>,
}

impl<E> Clone for InMemoryStore<E> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
        }
    }
}

impl<E: Event> InMemoryStore<E> {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            log: Arc::new(RwLock::new(Log {
                messages: Vec::new(),
                next_index: 1,
            })),
        }
    }

    /// Create a store pre-filled with messages at explicit indices.
    ///
    /// Indices may have gaps; they are sorted on insertion. Later saves
    /// continue after the highest seeded index.
    pub fn with_messages_at(mut messages: Vec<(u64, Message<E>)>) -> Self {
        messages.sort_by_key(|(index, _)| *index);
        let next_index = messages.last().map_or(1, |(index, _)| index + 1);
        Self {
            log: Arc::new(RwLock::new(Log {
                messages,
                next_index,
            })),
        }
    }

    /// Every stored message with its index, in index order.
    pub fn messages(&self) -> Vec<(u64, Message<E>)> {
        self.log.read().messages.clone()
    }

    fn select(&self, criteria: &Criteria) -> StoreResult<Vec<(u64, Message<E>)>> {
        for criterion in criteria.iter() {
            if let Criterion::StreamName(raw) = criterion {
                StreamPattern::parse(raw)?;
            }
        }
        let log = self.log.read();
        let mut selected = Vec::new();
        for (index, message) in &log.messages {
            if criteria.matches(*index, message)? {
                selected.push((*index, message.clone()));
            }
        }
        Ok(selected)
    }
}

impl<E: Event> Default for InMemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Event> Store<E> for InMemoryStore<E> {
    async fn load(
        &self,
        criteria: &Criteria,
        options: LoadOptions,
    ) -> StoreResult<Box<dyn MessageStream<E>>> {
        let mut selected = self.select(criteria)?;
        if options.backwards {
            selected.reverse();
        }
        let selected: Vec<_> = selected
            .into_iter()
            .skip(options.offset.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        debug!(count = selected.len(), "[memory.load] loaded messages");
        Ok(Box::new(VecMessageStream::new(selected)))
    }

    async fn count(&self, criteria: &Criteria) -> StoreResult<u64> {
        Ok(self.select(criteria)?.len() as u64)
    }

    async fn save(&self, messages: Vec<Message<E>>) -> StoreResult<()> {
        ensure_persistable(&messages)?;

        let mut log = self.log.write();

        let mut positions: HashSet<(StreamName, u64)> = HashSet::new();
        let mut ids: HashSet<EventId> = HashSet::new();
        for (_, stored) in &log.messages {
            if let (Some(stream), Some(playhead)) =
                (&stored.headers().stream_name, stored.headers().playhead)
            {
                positions.insert((stream.clone(), playhead));
            }
            ids.insert(stored.headers().event_id);
        }
        for message in &messages {
            let stream = message.stream_name()?.clone();
            let playhead = message.playhead()?;
            if !positions.insert((stream.clone(), playhead)) {
                return Err(StoreError::UniqueConstraintViolation(format!(
                    "stream '{stream}' already has playhead {playhead}"
                )));
            }
            if !ids.insert(message.headers().event_id) {
                return Err(StoreError::UniqueConstraintViolation(format!(
                    "event id {} already stored",
                    message.headers().event_id
                )));
            }
        }

        let now = Timestamp::now();
        for message in messages {
            let message = if message.headers().recorded_on.is_some() {
                message
            } else {
                message.with_recorded_on(now)
            };
            if message.headers().new_stream_start {
                let stream = message.stream_name()?.clone();
                for (_, stored) in &mut log.messages {
                    if stored.headers().stream_name.as_ref() == Some(&stream)
                        && !stored.headers().archived
                    {
                        *stored = stored.clone().with_archived(true);
                    }
                }
            }
            let index = log.next_index;
            log.next_index += 1;
            log.messages.push((index, message));
        }
        debug!(next_index = log.next_index, "[memory.save] appended messages");
        Ok(())
    }
}

/// Thread-safe in-memory subscription store with an exclusive lock.
#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    records: Arc<RwLock<BTreeMap<SubscriberId, Subscription>>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    held: Arc<Mutex<Option<OwnedMutexGuard<()>>>>,
}

impl InMemorySubscriptionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some engine currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.lock().is_some()
    }
}

impl std::fmt::Debug for InMemorySubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySubscriptionStore")
            .field("subscriptions", &self.records.read().len())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, id: &SubscriberId) -> SubscriptionStoreResult<Option<Subscription>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn find(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> SubscriptionStoreResult<Vec<Subscription>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|subscription| criteria.matches(subscription))
            .cloned()
            .collect())
    }

    async fn add(&self, subscription: &Subscription) -> SubscriptionStoreResult<()> {
        let mut records = self.records.write();
        if records.contains_key(subscription.id()) {
            return Err(SubscriptionStoreError::AlreadyExists(
                subscription.id().clone(),
            ));
        }
        records.insert(subscription.id().clone(), subscription.clone());
        Ok(())
    }

    async fn update(&self, subscription: &Subscription) -> SubscriptionStoreResult<()> {
        let mut records = self.records.write();
        match records.get_mut(subscription.id()) {
            Some(stored) => {
                *stored = subscription.clone();
                Ok(())
            }
            None => Err(SubscriptionStoreError::NotFound(subscription.id().clone())),
        }
    }

    async fn remove(&self, subscription: &Subscription) -> SubscriptionStoreResult<()> {
        self.records.write().remove(subscription.id());
        Ok(())
    }

    fn as_lockable(&self) -> Option<&dyn LockableSubscriptionStore> {
        Some(self)
    }
}

#[async_trait]
impl LockableSubscriptionStore for InMemorySubscriptionStore {
    async fn acquire_lock(&self) -> SubscriptionStoreResult<()> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        *self.held.lock() = Some(guard);
        Ok(())
    }

    async fn release_lock(&self) -> SubscriptionStoreResult<()> {
        self.held.lock().take().map(drop).ok_or_else(|| {
            SubscriptionStoreError::LockFailed("lock is not held".to_string())
        })
    }
}
