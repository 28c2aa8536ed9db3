//! Turns reported subscriber errors into `Err`.

use super::{
    ErrorReport, OperationResult, ProcessedResult, SubscriptionEngine, SubscriptionEngineCriteria,
};
use crate::errors::{CommittedProgress, EngineError, EngineResult, ErrorDetected};
use crate::subscription::Subscription;
use async_trait::async_trait;
use tracing::warn;

/// Fails every operation whose result carries errors.
///
/// The inner operation has already committed its changes when the error is
/// raised; only the caller's control flow changes. Failed `boot` and `run`
/// calls carry their message counts in [`ErrorDetected::progress`].
#[derive(Debug, Clone)]
pub struct ThrowOnErrorSubscriptionEngine<T> {
    inner: T,
}

impl<T: SubscriptionEngine> ThrowOnErrorSubscriptionEngine<T> {
    /// Wraps `inner`.
    pub const fn new(inner: T) -> Self {
        Self { inner }
    }

    /// The wrapped engine.
    pub const fn inner(&self) -> &T {
        &self.inner
    }
}

fn escalate(
    operation: &str,
    errors: Vec<ErrorReport>,
    progress: Option<CommittedProgress>,
) -> EngineError {
    warn!(
        operation,
        errors = errors.len(),
        "[engine.throw_on_error] raising reported errors"
    );
    EngineError::ErrorDetected(ErrorDetected { errors, progress })
}

fn check(operation: &str, result: OperationResult) -> EngineResult<OperationResult> {
    if result.is_ok() {
        Ok(result)
    } else {
        Err(escalate(operation, result.errors, None))
    }
}

fn check_processed(operation: &str, result: ProcessedResult) -> EngineResult<ProcessedResult> {
    if result.is_ok() {
        Ok(result)
    } else {
        let progress = CommittedProgress {
            processed_messages: result.processed_messages,
            stream_finished: result.stream_finished,
        };
        Err(escalate(operation, result.errors, Some(progress)))
    }
}

#[async_trait]
impl<T: SubscriptionEngine> SubscriptionEngine for ThrowOnErrorSubscriptionEngine<T> {
    async fn setup(
        &self,
        criteria: &SubscriptionEngineCriteria,
        skip_booting: bool,
    ) -> EngineResult<OperationResult> {
        check("setup", self.inner.setup(criteria, skip_booting).await?)
    }

    async fn boot(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        check_processed("boot", self.inner.boot(criteria, message_limit).await?)
    }

    async fn run(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        check_processed("run", self.inner.run(criteria, message_limit).await?)
    }

    async fn teardown(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        check("teardown", self.inner.teardown(criteria).await?)
    }

    async fn remove(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult> {
        check("remove", self.inner.remove(criteria).await?)
    }

    async fn reactivate(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        check("reactivate", self.inner.reactivate(criteria).await?)
    }

    async fn pause(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult> {
        check("pause", self.inner.pause(criteria).await?)
    }

    async fn subscriptions(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<Vec<Subscription>> {
        self.inner.subscriptions(criteria).await
    }
}
