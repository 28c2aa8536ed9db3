//! Unit of work over the subscription store for one engine operation.

use crate::clock::Clock;
use crate::errors::{EngineError, EngineResult};
use crate::subscription::{Subscription, SubscriptionCriteria, SubscriptionStore};
use crate::types::SubscriberId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum Pending {
    Add(Subscription),
    Update(Subscription),
    Remove(Subscription),
}

/// Collects subscription writes and applies them in one flush.
///
/// An update of a subscription that is pending addition is folded into the
/// addition. An update after a removal is dropped. Reads through
/// [`Self::find`] see pending changes.
pub struct SubscriptionManager {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    pending: BTreeMap<SubscriberId, Pending>,
    locked: bool,
}

impl SubscriptionManager {
    /// A manager with nothing pending.
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            pending: BTreeMap::new(),
            locked: false,
        }
    }

    /// Takes the store's exclusive lock if it supports locking.
    pub async fn lock(&mut self) -> EngineResult<()> {
        if self.locked {
            return Ok(());
        }
        if let Some(lockable) = self.store.as_lockable() {
            lockable.acquire_lock().await?;
            self.locked = true;
        }
        Ok(())
    }

    /// Schedules the insertion of a new subscription.
    pub fn add(&mut self, subscription: Subscription) {
        self.pending
            .insert(subscription.id().clone(), Pending::Add(subscription));
    }

    /// Schedules an update.
    pub fn update(&mut self, subscription: Subscription) {
        let id = subscription.id().clone();
        let next = match self.pending.remove(&id) {
            Some(Pending::Add(_)) => Pending::Add(subscription),
            Some(removed @ Pending::Remove(_)) => {
                debug!(subscription = %id, "[engine.manager] dropping update of removed subscription");
                removed
            }
            Some(Pending::Update(_)) | None => Pending::Update(subscription),
        };
        self.pending.insert(id, next);
    }

    /// Schedules a removal. Removing a subscription that was only pending
    /// addition cancels the addition.
    pub fn remove(&mut self, subscription: Subscription) {
        let id = subscription.id().clone();
        match self.pending.remove(&id) {
            Some(Pending::Add(_)) => {}
            _ => {
                self.pending.insert(id, Pending::Remove(subscription));
            }
        }
    }

    /// Whether any write is pending.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Subscriptions matching `criteria`, with pending changes applied,
    /// ordered by id.
    pub async fn find(&self, criteria: &SubscriptionCriteria) -> EngineResult<Vec<Subscription>> {
        let stored = self
            .store
            .find(&SubscriptionCriteria {
                statuses: None,
                ..criteria.clone()
            })
            .await?;
        let mut merged: BTreeMap<SubscriberId, Subscription> = stored
            .into_iter()
            .map(|subscription| (subscription.id().clone(), subscription))
            .collect();

        for (id, pending) in &self.pending {
            match pending {
                Pending::Add(subscription) | Pending::Update(subscription) => {
                    merged.insert(id.clone(), subscription.clone());
                }
                Pending::Remove(_) => {
                    merged.remove(id);
                }
            }
        }

        Ok(merged
            .into_values()
            .filter(|subscription| criteria.matches(subscription))
            .collect())
    }

    /// Writes pending changes: additions, then updates, then removals.
    pub async fn flush(&mut self) -> EngineResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let now = self.clock.now();

        for entry in pending.values() {
            if let Pending::Add(subscription) = entry {
                let mut subscription = subscription.clone();
                subscription.touch(now);
                self.store.add(&subscription).await?;
            }
        }
        for entry in pending.values() {
            if let Pending::Update(subscription) = entry {
                let mut subscription = subscription.clone();
                subscription.touch(now);
                self.store.update(&subscription).await?;
            }
        }
        for entry in pending.values() {
            if let Pending::Remove(subscription) = entry {
                self.store.remove(subscription).await?;
            }
        }
        Ok(())
    }

    /// Releases the lock taken by [`Self::lock`].
    pub async fn unlock(&mut self) -> EngineResult<()> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        if let Some(lockable) = self.store.as_lockable() {
            lockable.release_lock().await?;
        }
        Ok(())
    }

    /// Drops pending writes and releases the lock, returning `error`.
    pub async fn abort(mut self, error: EngineError) -> EngineError {
        self.pending.clear();
        log_secondary("unlock", self.unlock().await);
        error
    }

    /// Flushes, then releases the lock whatever happened.
    ///
    /// An error from the operation itself wins over a flush or unlock error.
    pub async fn commit<T>(mut self, result: EngineResult<T>) -> EngineResult<T> {
        let flushed = self.flush().await;
        let released = self.unlock().await;

        match (result, flushed, released) {
            (Err(error), flushed, released) => {
                log_secondary("flush", flushed);
                log_secondary("unlock", released);
                Err(error)
            }
            (Ok(_), Err(error), released) => {
                log_secondary("unlock", released);
                Err(error)
            }
            (Ok(_), Ok(()), Err(error)) => Err(error),
            (Ok(value), Ok(()), Ok(())) => Ok(value),
        }
    }
}

fn log_secondary(step: &str, outcome: EngineResult<()>) {
    if let Err(error) = outcome {
        warn!(step, error = %error, "[engine.manager] secondary failure after operation error");
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("pending", &self.pending)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}
