//! The engine implementation that talks to the stores directly.

use super::{
    ErrorReport, OperationResult, ProcessedResult, SubscriptionEngine, SubscriptionEngineCriteria,
    SubscriptionManager,
};
use crate::clock::{Clock, SystemClock};
use crate::errors::EngineResult;
use crate::message::{Event, Message};
use crate::retry::{ClockBasedRetryStrategy, RetryConfig, RetryStrategy};
use crate::store::{Criteria, LoadOptions, Store};
use crate::subscriber::{
    HandledEvents, SubscriberAccessorRepository, SubscriberDescriptor, SubscriberError,
};
use crate::subscription::{RunMode, Status, Subscription, SubscriptionStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Processes subscriptions against an event store.
///
/// Each operation holds the subscription store's lock (when it has one)
/// from discovery to the final flush, so concurrent workers sharing the
/// store never interleave their read-modify-write cycles.
pub struct DefaultSubscriptionEngine<E: Event> {
    store: Arc<dyn Store<E>>,
    subscription_store: Arc<dyn SubscriptionStore>,
    subscribers: Arc<dyn SubscriberAccessorRepository<E>>,
    retry_strategy: Arc<dyn RetryStrategy>,
    clock: Arc<dyn Clock>,
}

/// A selected subscription together with its subscriber, tracked through
/// one `boot` or `run` pass.
struct Worker<E> {
    original: Subscription,
    subscription: Subscription,
    descriptor: SubscriberDescriptor<E>,
    handled: HandledEvents,
    failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Boot,
    Run,
}

impl Phase {
    const fn status(self) -> Status {
        match self {
            Self::Boot => Status::Booting,
            Self::Run => Status::Active,
        }
    }
}

impl<E: Event> DefaultSubscriptionEngine<E> {
    /// Creates an engine on the system clock with the default retry backoff.
    pub fn new(
        store: Arc<dyn Store<E>>,
        subscription_store: Arc<dyn SubscriptionStore>,
        subscribers: Arc<dyn SubscriberAccessorRepository<E>>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            subscription_store,
            subscribers,
            retry_strategy: Arc::new(ClockBasedRetryStrategy::new(
                clock.clone(),
                RetryConfig::default(),
            )),
            clock,
        }
    }

    /// Uses `clock` for timestamps and for the default retry backoff.
    ///
    /// Replaces any retry strategy set before; call
    /// [`Self::with_retry_strategy`] afterwards to customise it.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.retry_strategy = Arc::new(ClockBasedRetryStrategy::new(
            clock.clone(),
            RetryConfig::default(),
        ));
        self.clock = clock;
        self
    }

    /// Uses a custom retry strategy.
    #[must_use]
    pub fn with_retry_strategy(mut self, retry_strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = retry_strategy;
        self
    }

    fn manager(&self) -> SubscriptionManager {
        SubscriptionManager::new(self.subscription_store.clone(), self.clock.clone())
    }

    /// Opens a locked unit of work and runs discovery in it.
    async fn begin(&self) -> EngineResult<SubscriptionManager> {
        let mut manager = self.manager();
        manager.lock().await?;
        match self.discover(&mut manager).await {
            Ok(()) => Ok(manager),
            Err(error) => Err(manager.abort(error).await),
        }
    }

    /// Adds a `New` subscription for every registered subscriber that has
    /// none yet.
    async fn discover(&self, manager: &mut SubscriptionManager) -> EngineResult<()> {
        let known = manager
            .find(&SubscriptionEngineCriteria::all().to_subscription_criteria(None))
            .await?;

        for descriptor in self.subscribers.subscribers() {
            if known.iter().any(|s| s.id() == descriptor.id()) {
                continue;
            }
            info!(
                subscription = %descriptor.id(),
                group = descriptor.group(),
                run_mode = %descriptor.run_mode(),
                "[engine.discover] new subscriber"
            );
            manager.add(Subscription::new(
                descriptor.id().clone(),
                descriptor.group(),
                descriptor.run_mode(),
            ));
        }
        Ok(())
    }

    /// Restores errored subscriptions whose retry is due.
    async fn retry_due(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<()> {
        let errored = manager
            .find(&criteria.to_subscription_criteria(Some(vec![Status::Error])))
            .await?;

        for mut subscription in errored {
            if self.retry_strategy.is_exhausted(&subscription) {
                warn!(
                    subscription = %subscription.id(),
                    attempt = subscription.retry_attempt(),
                    "[engine.retry] retries exhausted, reactivate to resume"
                );
                continue;
            }
            if !self.retry_strategy.should_retry(&subscription) {
                debug!(
                    subscription = %subscription.id(),
                    attempt = subscription.retry_attempt(),
                    "[engine.retry] not due"
                );
                continue;
            }
            subscription.retry();
            info!(
                subscription = %subscription.id(),
                attempt = subscription.retry_attempt(),
                status = %subscription.status(),
                "[engine.retry] retrying failed subscription"
            );
            manager.update(subscription);
        }
        Ok(())
    }

    /// Detaches subscriptions in `status` whose subscriber is gone.
    async fn detach_missing(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
        status: Status,
    ) -> EngineResult<()> {
        let candidates = manager
            .find(&criteria.to_subscription_criteria(Some(vec![status])))
            .await?;

        for mut subscription in candidates {
            if self.subscribers.get(subscription.id()).is_some() {
                continue;
            }
            warn!(
                subscription = %subscription.id(),
                "[engine.detach] subscriber is no longer registered"
            );
            subscription.detach();
            manager.update(subscription);
        }
        Ok(())
    }

    /// Runs setup hooks of selected `New` subscriptions.
    async fn setup_new(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
        skip_booting: bool,
    ) -> EngineResult<Vec<ErrorReport>> {
        let fresh = manager
            .find(&criteria.to_subscription_criteria(Some(vec![Status::New])))
            .await?;
        let mut errors = Vec::new();

        for mut subscription in fresh {
            let Some(descriptor) = self.subscribers.get(subscription.id()) else {
                debug!(
                    subscription = %subscription.id(),
                    "[engine.setup] no registered subscriber, skipping"
                );
                continue;
            };

            if let Err(failure) = descriptor.subscriber().setup().await {
                errors.push(self.record_failure(&mut subscription, failure, "setup"));
                manager.update(subscription);
                continue;
            }

            if subscription.run_mode() == RunMode::FromNow {
                let end = self.store.last_index().await?.unwrap_or(0);
                subscription.change_position(end);
                subscription.activate();
            } else if skip_booting {
                subscription.activate();
            } else {
                subscription.start_booting();
            }
            subscription.reset_retry();
            info!(
                subscription = %subscription.id(),
                status = %subscription.status(),
                position = subscription.position(),
                "[engine.setup] subscription set up"
            );
            manager.update(subscription);
        }
        Ok(errors)
    }

    /// Marks `subscription` as failed and builds the matching report.
    fn record_failure(
        &self,
        subscription: &mut Subscription,
        failure: SubscriberError,
        stage: &str,
    ) -> ErrorReport {
        let (message, context) = failure.into_parts();
        error!(
            subscription = %subscription.id(),
            stage,
            position = subscription.position(),
            error = %message,
            "[engine.process] subscriber failed"
        );
        subscription.fail(message.clone(), context.clone(), self.clock.now());
        ErrorReport {
            subscription_id: subscription.id().clone(),
            message,
            context,
        }
    }

    /// Streams messages to the subscriptions selected for `phase`.
    async fn process(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
        phase: Phase,
    ) -> EngineResult<ProcessedResult> {
        let selected = manager
            .find(&criteria.to_subscription_criteria(Some(vec![phase.status()])))
            .await?;

        let mut workers: Vec<Worker<E>> = selected
            .into_iter()
            .filter_map(|subscription| {
                let descriptor = self.subscribers.get(subscription.id())?;
                Some(Worker {
                    original: subscription.clone(),
                    handled: descriptor.subscriber().handled_events(),
                    subscription,
                    descriptor,
                    failed: false,
                })
            })
            .collect();

        let Some(start) = workers.iter().map(|w| w.subscription.position()).min() else {
            debug!(phase = ?phase, "[engine.process] no subscriptions selected");
            return Ok(ProcessedResult::nothing_to_process(Vec::new()));
        };

        let mut stream = self
            .store
            .load(&Criteria::new().from_index(start), LoadOptions::new())
            .await?;
        let mut errors = Vec::new();
        let mut processed_messages = 0usize;
        let mut stream_finished = true;

        loop {
            if message_limit.is_some_and(|limit| processed_messages >= limit) {
                stream_finished = false;
                break;
            }
            if !stream.advance().await? {
                break;
            }
            let (Some(index), Some(message)) = (stream.index(), stream.current().cloned()) else {
                break;
            };

            for worker in workers.iter_mut().filter(|w| !w.failed) {
                if worker.subscription.position() >= index {
                    continue;
                }
                if let Err(failure) = self.dispatch(worker, &message).await {
                    let stage = match phase {
                        Phase::Boot => "boot",
                        Phase::Run => "run",
                    };
                    errors.push(self.record_failure(&mut worker.subscription, failure, stage));
                    worker.failed = true;
                    continue;
                }
                worker.subscription.change_position(index);
            }
            processed_messages += 1;
        }
        stream.close();

        for worker in &mut workers {
            if worker.failed {
                continue;
            }
            if stream_finished {
                finish_pass(&mut worker.subscription, phase);
            }
            worker.subscription.reset_retry();
        }

        for worker in workers {
            if worker.subscription != worker.original {
                info!(
                    subscription = %worker.subscription.id(),
                    status = %worker.subscription.status(),
                    position = worker.subscription.position(),
                    "[engine.process] subscription advanced"
                );
                manager.update(worker.subscription);
            }
        }

        Ok(ProcessedResult {
            processed_messages,
            stream_finished,
            errors,
        })
    }

    async fn dispatch(
        &self,
        worker: &Worker<E>,
        message: &Message<E>,
    ) -> Result<(), SubscriberError> {
        if !worker.handled.handles(message.event_type()) {
            return Ok(());
        }
        debug!(
            subscription = %worker.subscription.id(),
            event_type = message.event_type(),
            "[engine.dispatch] delivering message"
        );
        worker.descriptor.subscriber().handle(message).await
    }

    async fn setup_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
        skip_booting: bool,
    ) -> EngineResult<OperationResult> {
        self.retry_due(manager, criteria).await?;
        let errors = self.setup_new(manager, criteria, skip_booting).await?;
        Ok(OperationResult::new(errors))
    }

    async fn boot_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        self.retry_due(manager, criteria).await?;
        let mut errors = self.setup_new(manager, criteria, false).await?;
        self.detach_missing(manager, criteria, Status::Booting).await?;
        let mut processed = self
            .process(manager, criteria, message_limit, Phase::Boot)
            .await?;
        errors.append(&mut processed.errors);
        processed.errors = errors;
        Ok(processed)
    }

    async fn run_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        self.retry_due(manager, criteria).await?;
        self.detach_missing(manager, criteria, Status::Active).await?;
        self.process(manager, criteria, message_limit, Phase::Run)
            .await
    }

    async fn teardown_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        let detached = manager
            .find(&criteria.to_subscription_criteria(Some(vec![Status::Detached])))
            .await?;
        let mut errors = Vec::new();

        for subscription in detached {
            match self.subscribers.get_for_teardown(subscription.id()) {
                Some(descriptor) => {
                    if let Err(failure) = descriptor.subscriber().teardown().await {
                        error!(
                            subscription = %subscription.id(),
                            error = %failure,
                            "[engine.teardown] teardown hook failed, keeping subscription"
                        );
                        errors.push(report(&subscription, failure));
                        continue;
                    }
                }
                None => {
                    warn!(
                        subscription = %subscription.id(),
                        "[engine.teardown] no teardown available, removing record only"
                    );
                }
            }
            info!(subscription = %subscription.id(), "[engine.teardown] removed");
            manager.remove(subscription);
        }
        Ok(OperationResult::new(errors))
    }

    async fn remove_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        let selected = manager
            .find(&criteria.to_subscription_criteria(None))
            .await?;
        let mut errors = Vec::new();

        for subscription in selected {
            let descriptor = self.subscribers.get_for_teardown(subscription.id());
            if let Some(descriptor) = descriptor {
                if let Err(failure) = descriptor.subscriber().teardown().await {
                    warn!(
                        subscription = %subscription.id(),
                        error = %failure,
                        "[engine.remove] teardown hook failed, removing anyway"
                    );
                    errors.push(report(&subscription, failure));
                }
            }
            info!(subscription = %subscription.id(), "[engine.remove] removed");
            manager.remove(subscription);
        }
        Ok(OperationResult::new(errors))
    }

    async fn reactivate_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        let selected = manager
            .find(&criteria.to_subscription_criteria(None))
            .await?;

        for mut subscription in selected {
            match subscription.status() {
                Status::Error
                    if subscription
                        .error()
                        .is_some_and(|e| e.previous_status == Status::New) =>
                {
                    subscription.reset_to_new();
                }
                Status::Error | Status::Detached | Status::Paused | Status::Finished => {
                    subscription.activate();
                    subscription.clear_error();
                    subscription.reset_retry();
                }
                Status::Active | Status::New | Status::Booting => continue,
            }
            info!(
                subscription = %subscription.id(),
                status = %subscription.status(),
                "[engine.reactivate] reactivated"
            );
            manager.update(subscription);
        }
        Ok(OperationResult::default())
    }

    async fn pause_in(
        &self,
        manager: &mut SubscriptionManager,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        let selected = manager
            .find(&criteria.to_subscription_criteria(None))
            .await?;

        for mut subscription in selected {
            if subscription.status() == Status::Paused {
                continue;
            }
            subscription.pause();
            info!(subscription = %subscription.id(), "[engine.pause] paused");
            manager.update(subscription);
        }
        Ok(OperationResult::default())
    }
}

fn report(subscription: &Subscription, failure: SubscriberError) -> ErrorReport {
    let (message, context) = failure.into_parts();
    ErrorReport {
        subscription_id: subscription.id().clone(),
        message,
        context,
    }
}

/// Terminal transition after a pass that drained the log.
fn finish_pass(subscription: &mut Subscription, phase: Phase) {
    match (phase, subscription.status(), subscription.run_mode()) {
        (Phase::Boot, Status::Booting, RunMode::Once) | (Phase::Run, Status::Active, RunMode::Once) => {
            subscription.finish();
        }
        (Phase::Boot, Status::Booting, _) => subscription.activate(),
        _ => {}
    }
}

#[async_trait]
impl<E: Event> SubscriptionEngine for DefaultSubscriptionEngine<E> {
    #[instrument(name = "engine.setup", skip(self))]
    async fn setup(
        &self,
        criteria: &SubscriptionEngineCriteria,
        skip_booting: bool,
    ) -> EngineResult<OperationResult> {
        let mut manager = self.begin().await?;
        let result = self.setup_in(&mut manager, criteria, skip_booting).await;
        let result = manager.commit(result).await?;
        info!(errors = result.errors.len(), "[engine.setup] done");
        Ok(result)
    }

    #[instrument(name = "engine.boot", skip(self))]
    async fn boot(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        let mut manager = self.begin().await?;
        let result = self.boot_in(&mut manager, criteria, message_limit).await;
        let result = manager.commit(result).await?;
        info!(
            processed = result.processed_messages,
            finished = result.stream_finished,
            errors = result.errors.len(),
            "[engine.boot] done"
        );
        Ok(result)
    }

    #[instrument(name = "engine.run", skip(self))]
    async fn run(
        &self,
        criteria: &SubscriptionEngineCriteria,
        message_limit: Option<usize>,
    ) -> EngineResult<ProcessedResult> {
        let mut manager = self.begin().await?;
        let result = self.run_in(&mut manager, criteria, message_limit).await;
        let result = manager.commit(result).await?;
        info!(
            processed = result.processed_messages,
            finished = result.stream_finished,
            errors = result.errors.len(),
            "[engine.run] done"
        );
        Ok(result)
    }

    #[instrument(name = "engine.teardown", skip(self))]
    async fn teardown(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        let mut manager = self.begin().await?;
        let result = self.teardown_in(&mut manager, criteria).await;
        manager.commit(result).await
    }

    #[instrument(name = "engine.remove", skip(self))]
    async fn remove(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult> {
        let mut manager = self.begin().await?;
        let result = self.remove_in(&mut manager, criteria).await;
        manager.commit(result).await
    }

    #[instrument(name = "engine.reactivate", skip(self))]
    async fn reactivate(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<OperationResult> {
        let mut manager = self.begin().await?;
        let result = self.reactivate_in(&mut manager, criteria).await;
        manager.commit(result).await
    }

    #[instrument(name = "engine.pause", skip(self))]
    async fn pause(&self, criteria: &SubscriptionEngineCriteria) -> EngineResult<OperationResult> {
        let mut manager = self.begin().await?;
        let result = self.pause_in(&mut manager, criteria).await;
        manager.commit(result).await
    }

    #[instrument(name = "engine.subscriptions", skip(self))]
    async fn subscriptions(
        &self,
        criteria: &SubscriptionEngineCriteria,
    ) -> EngineResult<Vec<Subscription>> {
        let manager = self.begin().await?;
        manager.commit(Ok(())).await?;
        Ok(self
            .subscription_store
            .find(&criteria.to_subscription_criteria(None))
            .await?)
    }
}

impl<E: Event> std::fmt::Debug for DefaultSubscriptionEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSubscriptionEngine").finish_non_exhaustive()
    }
}
