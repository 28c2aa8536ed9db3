//! The subscription engine.
//!
//! The engine drives subscribers from the event log. Every operation first
//! discovers subscribers that have no subscription yet, then applies its own
//! transition to the selected subscriptions and persists the result in one
//! batch:
//!
//! - **setup**: run setup hooks of `New` subscriptions
//! - **boot**: catch `Booting` subscriptions up on the backlog
//! - **run**: feed new messages to `Active` subscriptions
//! - **pause** / **reactivate**: operator control
//! - **teardown** / **remove**: clean up subscriptions
//!
//! Handler failures never surface as `Err`. They are recorded on the
//! subscription and listed in the returned result's `errors`. Wrap an engine
//! in [`ThrowOnErrorSubscriptionEngine`] to turn them into errors.
//!
//! ```ignore
//! let engine = DefaultSubscriptionEngine::new(store, subscription_store, Arc::new(registry));
//! let engine = CatchUpSubscriptionEngine::new(engine, CatchUpConfig::default());
//!
//! engine.setup(&SubscriptionEngineCriteria::all(), false).await?;
//! let booted = engine.boot(&SubscriptionEngineCriteria::all(), Some(500)).await?;
//! ```

pub mod catch_up;
pub mod default;
pub mod manager;
pub mod throw_on_error;

use crate::errors::EngineResult;
use crate::subscription::{ErrorContext, Status, Subscription, SubscriptionCriteria};
use crate::types::SubscriberId;
use async_trait::async_trait;

pub use catch_up::{CatchUpConfig, CatchUpSubscriptionEngine};
pub use default::DefaultSubscriptionEngine;
pub use manager::SubscriptionManager;
pub use throw_on_error::ThrowOnErrorSubscriptionEngine;

/// Selects the subscriptions an engine operation applies to.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionEngineCriteria {
    /// Only these subscription ids
    pub ids: Option<Vec<SubscriberId>>,
    /// Only these groups
    pub groups: Option<Vec<String>>,
}

impl SubscriptionEngineCriteria {
    /// Every subscription.
    pub const fn all() -> Self {
        Self {
            ids: None,
            groups: None,
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

    /// The equivalent store criteria, optionally narrowed to `statuses`.
    pub fn to_subscription_criteria(&self, statuses: Option<Vec<Status>>) -> SubscriptionCriteria {
        SubscriptionCriteria {
            ids: self.ids.clone(),
            groups: self.groups.clone(),
            statuses,
        }
    }
}

/// A subscriber failure reported by an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// The failing subscription
    pub subscription_id: SubscriberId,
    /// Error message
    pub message: String,
    /// Captured error context
    pub context: ErrorContext,
}

/// Outcome of operations that do not process messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationResult {
    /// Subscriber failures, in the order they happened
    pub errors: Vec<ErrorReport>,
}

impl OperationResult {
    /// Wraps the given errors.
    pub const fn new(errors: Vec<ErrorReport>) -> Self {
        Self { errors }
    }

    /// Whether nothing failed.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of `boot` and `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedResult {
    /// Messages read from the log during the call
    pub processed_messages: usize,
    /// Whether the log was drained without hitting the message limit
    pub stream_finished: bool,
    /// Subscriber failures, in the order they happened
    pub errors: Vec<ErrorReport>,
}

impl ProcessedResult {
    /// Result of a call that had nothing to process.
    pub const fn nothing_to_process(errors: Vec<ErrorReport>) -> Self {
        Self {
            processed_messages: 0,
            stream_finished: false,
            errors,
        }
    }

    /// Whether nothing failed.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Control surface shared by the engine and its decorators.
#[async_trait]
pub trait SubscriptionEngine: Send + Sync {
    /// Runs setup hooks of `New` subscriptions.
    ///
    /// On success a subscription moves to `Booting`, to `Active` when
    /// `skip_booting` is set, or to `Active` at the current end of the log
    /// for `FromNow` subscribers.
    async fn setup(
        &self,
        criteria: &SubscriptionEngineCriteria,
        skip_booting: bool,
    ) -> EngineResult<OperationResult>;

    /// Catches `Booting` subscriptions up, reading at most `message_limit`
    /// messages.
    async fn boot(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult>;

    /// Feeds `Active` subscriptions, reading at most `message_limit`
    /// messages.
    async fn run(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult>;

    /// Tears down and deletes `Detached` subscriptions.
    async fn teardown(&self, criteria: &SubscriptionEngineCriteria)
        -> EngineResult<OperationResult>;

    /// Tears down (best effort) and deletes every selected subscription.
    async fn remove(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult>;

    /// Brings stopped or failed subscriptions back.
    async fn reactivate(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult>;

    /// Pauses every selected subscription.
    async fn pause(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult>;

    /// Lists the selected subscriptions.
    async fn subscriptions(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<Vec<Subscription>>;
}
