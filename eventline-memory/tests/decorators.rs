//! Catch-up and throw-on-error engines wrapping the default engine.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use eventline::{
    async_trait, CatchUpConfig, CatchUpSubscriptionEngine, CommittedProgress, EngineError,
    ErrorDetected, Message, RetryStrategy, Status, Subscriber, SubscriberDescriptor,
    SubscriberError, SubscriberRegistry, SubscriberResult, Subscription, SubscriptionEngine,
    SubscriptionEngineCriteria, ThrowOnErrorSubscriptionEngine,
};

struct AlwaysRetry;

impl RetryStrategy for AlwaysRetry {
    fn should_retry(&self, _subscription: &Subscription) -> bool {
        true
    }
}

fn all() -> SubscriptionEngineCriteria {
    SubscriptionEngineCriteria::all()
}

#[tokio::test]
async fn catch_up_drains_the_log_in_batches() {
    let harness = Harness::new();
    harness
        .append(
            "profile-1",
            (1..=7).map(|n| created(&format!("p{n}"))).collect(),
        )
        .await;
    let projector = Arc::new(RecordingSubscriber::new());
    let engine = CatchUpSubscriptionEngine::new(
        harness.engine(registry(vec![descriptor("projector", &projector)])),
        CatchUpConfig::default(),
    );
    engine.setup(&all(), false).await.unwrap();

    let booted = engine.boot(&all(), Some(2)).await.unwrap();

    assert_eq!(booted.processed_messages, 7);
    assert!(booted.stream_finished);
    let sub = harness.subscription("projector").await;
    assert_eq!(sub.status(), Status::Active);
    assert_eq!(sub.position(), 7);
    assert_eq!(projector.seen(), harness.event_ids_after(0));

    harness
        .append("profile-2", vec![created("q1"), created("q2"), created("q3")])
        .await;
    let ran = engine.run(&all(), Some(1)).await.unwrap();
    assert_eq!(ran.processed_messages, 3);
    assert!(ran.stream_finished);
    assert_eq!(harness.subscription("projector").await.position(), 10);
}

#[tokio::test]
async fn catch_up_honours_iteration_bound() {
    let harness = Harness::new();
    harness
        .append(
            "profile-1",
            (1..=10).map(|n| created(&format!("p{n}"))).collect(),
        )
        .await;
    let projector = Arc::new(RecordingSubscriber::new());
    let engine = CatchUpSubscriptionEngine::new(
        harness.engine(registry(vec![descriptor("projector", &projector)])),
        CatchUpConfig::default().with_max_iterations(2),
    );
    engine.setup(&all(), true).await.unwrap();

    let ran = engine.run(&all(), Some(3)).await.unwrap();

    assert_eq!(ran.processed_messages, 6);
    assert!(!ran.stream_finished);
    assert_eq!(harness.subscription("projector").await.position(), 6);
}

#[tokio::test]
async fn catch_up_stops_when_nothing_is_selected() {
    let harness = Harness::new();
    harness.append("profile-1", vec![created("a")]).await;
    let engine = CatchUpSubscriptionEngine::new(
        harness.engine(registry(Vec::new())),
        CatchUpConfig::default(),
    );

    let ran = engine.run(&all(), Some(1)).await.unwrap();
    assert_eq!(ran.processed_messages, 0);
}

#[tokio::test]
async fn catch_up_stops_when_a_failure_repeats_without_progress() {
    let harness = Harness::new();
    harness
        .append(
            "profile-1",
            vec![ProfileEvent::Poisoned, created("a"), created("b")],
        )
        .await;
    let projector = Arc::new(RecordingSubscriber::new());
    let engine = CatchUpSubscriptionEngine::new(
        harness
            .engine(registry(vec![descriptor("projector", &projector)]))
            .with_retry_strategy(Arc::new(AlwaysRetry)),
        CatchUpConfig::default(),
    );
    engine.setup(&all(), true).await.unwrap();

    let ran = tokio::time::timeout(Duration::from_secs(5), engine.run(&all(), Some(1)))
        .await
        .expect("catch-up should terminate on a stuck subscription")
        .unwrap();

    assert_eq!(ran.errors.len(), 1);
    assert_eq!(ran.errors[0].subscription_id, id("projector"));
    assert!(!ran.stream_finished);
    assert_eq!(projector.handle_count(), 2);
    let sub = harness.subscription("projector").await;
    assert_eq!(sub.status(), Status::Error);
    assert_eq!(sub.retry_attempt(), 2);
    assert_eq!(sub.position(), 0);
}

/// Fails the first delivery only.
struct FailOnce {
    failed: AtomicBool,
}

#[async_trait]
impl Subscriber<ProfileEvent> for FailOnce {
    async fn handle(&self, _message: &Message<ProfileEvent>) -> SubscriberResult<()> {
        if self.failed.swap(true, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SubscriberError::new("transient"))
        }
    }
}

#[tokio::test]
async fn catch_up_drops_errors_of_recovered_subscriptions() {
    let harness = Harness::new();
    harness
        .append("profile-1", vec![created("a"), created("b")])
        .await;
    let flaky = Arc::new(FailOnce {
        failed: AtomicBool::new(false),
    });
    let mut registry = SubscriberRegistry::new();
    registry
        .register(SubscriberDescriptor::new(id("flaky"), flaky))
        .unwrap();
    let engine = ThrowOnErrorSubscriptionEngine::new(CatchUpSubscriptionEngine::new(
        harness
            .engine(registry)
            .with_retry_strategy(Arc::new(AlwaysRetry)),
        CatchUpConfig::default().with_max_iterations(10),
    ));
    engine.setup(&all(), true).await.unwrap();

    let ran = engine.run(&all(), Some(1)).await.unwrap();

    assert!(ran.errors.is_empty());
    assert!(ran.stream_finished);
    let sub = harness.subscription("flaky").await;
    assert_eq!(sub.status(), Status::Active);
    assert_eq!(sub.position(), 2);
    assert!(sub.error().is_none());
}

#[tokio::test]
async fn throw_on_error_raises_after_committing() {
    let harness = Harness::new();
    let projector = Arc::new(RecordingSubscriber::new());
    let engine = ThrowOnErrorSubscriptionEngine::new(
        harness.engine(registry(vec![descriptor("profile-projector", &projector)])),
    );
    engine.setup(&all(), true).await.unwrap();
    harness
        .append("profile-1", vec![created("a"), ProfileEvent::Poisoned])
        .await;

    let err = engine.run(&all(), None).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "Error in subscription engine detected: profile-projector: cannot project poisoned profile"
    );
    let EngineError::ErrorDetected(detected) = err else {
        panic!("expected ErrorDetected");
    };
    assert_eq!(
        detected.progress,
        Some(CommittedProgress {
            processed_messages: 2,
            stream_finished: true,
        })
    );
    let sub = harness.subscription("profile-projector").await;
    assert_eq!(sub.status(), Status::Error);
    assert_eq!(sub.position(), 1);
    assert!(!harness.subscriptions.is_locked());
}

#[tokio::test]
async fn throw_on_error_passes_clean_results_through() {
    let harness = Harness::new();
    let projector = Arc::new(RecordingSubscriber::new());
    let engine = ThrowOnErrorSubscriptionEngine::new(
        harness.engine(registry(vec![descriptor("projector", &projector)])),
    );
    harness.append("profile-1", vec![created("a")]).await;

    engine.setup(&all(), true).await.unwrap();
    let ran = engine.run(&all(), None).await.unwrap();
    assert_eq!(ran.processed_messages, 1);

    let subs = engine.subscriptions(&all()).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].position(), 1);
}

#[tokio::test]
async fn throw_on_error_raises_setup_failures() {
    let harness = Harness::new();
    let projector = Arc::new(RecordingSubscriber::new().with_setup(true));
    let engine = ThrowOnErrorSubscriptionEngine::new(
        harness.engine(registry(vec![descriptor("projector", &projector)])),
    );

    let err = engine.setup(&all(), false).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Error in subscription engine detected: projector: read model table is missing"
    );
    assert!(matches!(
        err,
        EngineError::ErrorDetected(ErrorDetected { progress: None, .. })
    ));
    assert_eq!(harness.subscription("projector").await.status(), Status::Error);
}
