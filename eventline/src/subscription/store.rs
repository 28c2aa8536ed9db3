//! Persistence port for subscriptions.

use super::{Status, Subscription};
use crate::errors::SubscriptionStoreResult;
use crate::types::SubscriberId;
use async_trait::async_trait;

/// Filter over subscriptions. Unset fields match everything; set fields are
/// combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionCriteria {
    /// Only these ids
    pub ids: Option<Vec<SubscriberId>>,
    /// Only these groups
    pub groups: Option<Vec<String>>,
    /// Only these statuses
    pub statuses: Option<Vec<Status>>,
}

impl SubscriptionCriteria {
    /// Matches every subscription.
    pub const fn all() -> Self {
        Self {
            ids: None,
            groups: None,
            statuses: None,
        }
    }

    /// Restricts to the given ids.
    #[must_use]
    pub fn with_ids(mut self, ids: Vec<SubscriberId>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Restricts to the given groups.
    #[must_use]
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Restricts to the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: Vec<Status>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Whether `subscription` satisfies every set field.
    pub fn matches(&self, subscription: &Subscription) -> bool {
        self.ids
            .as_ref()
            .is_none_or(|ids| ids.contains(subscription.id()))
            && self
                .groups
                .as_ref()
                .is_none_or(|groups| groups.iter().any(|g| g == subscription.group()))
            && self
                .statuses
                .as_ref()
                .is_none_or(|statuses| statuses.contains(&subscription.status()))
    }
}

/// Storage for subscription records.
///
/// Implementations must be safe to share between tasks. `find` returns
/// subscriptions ordered by id so that engines process them deterministically.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Loads one subscription.
    async fn get(&self, id: &SubscriberId) -> SubscriptionStoreResult<Option<Subscription>>;

    /// Loads every subscription matching `criteria`, ordered by id.
    async fn find(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> SubscriptionStoreResult<Vec<Subscription>>;

    /// Inserts a new record. Fails with `AlreadyExists` on duplicate ids.
    async fn add(&self, subscription: &Subscription) -> SubscriptionStoreResult<()>;

    /// Replaces an existing record. Fails with `NotFound` if it is missing.
    async fn update(&self, subscription: &Subscription) -> SubscriptionStoreResult<()>;

    /// Deletes a record. Removing a missing record is not an error.
    async fn remove(&self, subscription: &Subscription) -> SubscriptionStoreResult<()>;

    /// The locking capability, if this store supports it.
    fn as_lockable(&self) -> Option<&dyn LockableSubscriptionStore> {
        None
    }
}

/// A subscription store that can serialise whole read-modify-write cycles
/// across processes.
#[async_trait]
pub trait LockableSubscriptionStore: Send + Sync {
    /// Blocks until the exclusive lock is held.
    async fn acquire_lock(&self) -> SubscriptionStoreResult<()>;

    /// Releases the lock taken by [`Self::acquire_lock`].
    async fn release_lock(&self) -> SubscriptionStoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::RunMode;

    fn subscription(id: &str, group: &str) -> Subscription {
        Subscription::new(SubscriberId::try_new(id).unwrap(), group, RunMode::FromBeginning)
    }

    #[test]
    fn empty_criteria_match_everything() {
        assert!(SubscriptionCriteria::all().matches(&subscription("a", "default")));
    }

    #[test]
    fn criteria_fields_are_conjunctive() {
        let sub = subscription("a", "projections");
        let criteria = SubscriptionCriteria::all()
            .with_ids(vec![SubscriberId::try_new("a").unwrap()])
            .with_groups(vec!["projections".to_string()]);
        assert!(criteria.matches(&sub));

        let criteria = criteria.with_statuses(vec![Status::Active]);
        assert!(!criteria.matches(&sub));
    }
}
