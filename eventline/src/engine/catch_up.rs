//! Repeats `boot` and `run` until the log is drained.

use super::{
    ErrorReport, OperationResult, ProcessedResult, SubscriptionEngine, SubscriptionEngineCriteria,
};
use crate::errors::EngineResult;
use crate::subscription::{Status, Subscription};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Configuration for [`CatchUpSubscriptionEngine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpConfig {
    /// Upper bound on inner calls per operation; `None` for no bound
    pub max_iterations: Option<u32>,
}

impl CatchUpConfig {
    /// Bounds the number of inner calls.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

/// Calls the inner engine's `boot` / `run` until the stream is finished.
///
/// The loop also stops once the iteration bound is reached, when an
/// iteration processed no message, or when an iteration only repeated
/// earlier failures without advancing any position. Processed counts are
/// summed. Errors are collapsed to the latest one per subscription, and
/// only subscriptions still in error when the loop ends are reported.
#[derive(Debug, Clone)]
pub struct CatchUpSubscriptionEngine<T> {
    inner: T,
    config: CatchUpConfig,
}

impl<T: SubscriptionEngine> CatchUpSubscriptionEngine<T> {
    /// Wraps `inner`.
    pub const fn new(inner: T, config: CatchUpConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped engine.
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    async fn repeat(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
        booting: bool,
    ) -> EngineResult<ProcessedResult> {
        let mut total = ProcessedResult::default();
        let mut iterations = 0u32;
        let mut before = self.inner.subscriptions(criteria).await?;

        loop {
            let result = if booting {
                self.inner.boot(criteria, message_limit).await?
            } else {
                self.inner.run(criteria, message_limit).await?
            };
            iterations = iterations.saturating_add(1);
            let after = self.inner.subscriptions(criteria).await?;
            let progressed = advanced(&before, &after);
            let repeated = result.errors.iter().all(|report| {
                total
                    .errors
                    .iter()
                    .any(|seen| seen.subscription_id == report.subscription_id)
            });

            total.processed_messages += result.processed_messages;
            total.stream_finished = result.stream_finished;
            merge_errors(&mut total.errors, result.errors);
            before = after;

            debug!(
                iteration = iterations,
                processed = result.processed_messages,
                finished = result.stream_finished,
                progressed,
                "[engine.catch_up] iteration done"
            );

            if result.stream_finished || result.processed_messages == 0 {
                break;
            }
            if !progressed && repeated {
                debug!(
                    iteration = iterations,
                    "[engine.catch_up] no position advanced, stopping"
                );
                break;
            }
            if self
                .config
                .max_iterations
                .is_some_and(|max| iterations >= max)
            {
                break;
            }
        }

        // Subscriptions that recovered in a later iteration are not reported.
        total.errors.retain(|report| {
            before.iter().any(|subscription| {
                subscription.id() == &report.subscription_id
                    && subscription.status() == Status::Error
            })
        });
        Ok(total)
    }
}

/// Whether any subscription in `after` moved past its position in `before`.
fn advanced(before: &[Subscription], after: &[Subscription]) -> bool {
    after.iter().any(|current| {
        before
            .iter()
            .find(|previous| previous.id() == current.id())
            .is_some_and(|previous| current.position() > previous.position())
    })
}

/// Folds `incoming` into `errors`, replacing an earlier error of the same
/// subscription in place.
fn merge_errors(errors: &mut Vec<ErrorReport>, incoming: Vec<ErrorReport>) {
    for report in incoming {
        match errors
            .iter_mut()
            .find(|existing| existing.subscription_id == report.subscription_id)
        {
            Some(existing) => *existing = report,
            None => errors.push(report),
        }
    }
}

#[async_trait]
impl<T: SubscriptionEngine> SubscriptionEngine for CatchUpSubscriptionEngine<T> {
    async fn setup(
        &self,
        criteria: &SubscriptionEngineCriteria,
        skip_booting: bool,
    ) -> EngineResult<OperationResult> {
        self.inner.setup(criteria, skip_booting).await
    }

    #[instrument(name = "engine.catch_up.boot", skip(self))]
    async fn boot(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        self.repeat(criteria, message_limit, true).await
    }

    #[instrument(name = "engine.catch_up.run", skip(self))]
    async fn run(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        self.repeat(criteria, message_limit, false).await
    }

    async fn teardown(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        self.inner.teardown(criteria).await
    }

    async fn remove(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult> {
        self.inner.remove(criteria).await
    }

    async fn reactivate(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        self.inner.reactivate(criteria).await
    }

    async fn pause(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult> {
        self.inner.pause(criteria).await
    }

    async fn subscriptions(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<Vec<Subscription>> {
        self.inner.subscriptions(criteria).await
    }
}
