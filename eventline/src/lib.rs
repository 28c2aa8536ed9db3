//! `eventline` - event store contracts and a subscription engine
//!
//! Events are appended to a single ordered log. Subscribers (projections,
//! process managers) consume that log through the subscription engine,
//! which keeps one durable cursor per subscriber, isolates handler
//! failures, retries them with backoff and lets operators pause, reactivate
//! and remove subscriptions.
//!
//! Storage is pluggable: implement [`store::Store`] for events and
//! [`subscription::SubscriptionStore`] for subscription records. The
//! `eventline-memory` and `eventline-postgres` crates provide both.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod engine;
pub mod errors;
pub mod message;
pub mod retry;
pub mod store;
pub mod subscriber;
pub mod subscription;
pub mod types;

pub use async_trait::async_trait;
pub use clock::{Clock, FrozenClock, SystemClock};
pub use engine::{
    CatchUpConfig, CatchUpSubscriptionEngine, DefaultSubscriptionEngine, ErrorReport,
    OperationResult, ProcessedResult, SubscriptionEngine, SubscriptionEngineCriteria,
    ThrowOnErrorSubscriptionEngine,
};
pub use errors::{
    CommittedProgress, EngineError, EngineResult, ErrorDetected, StoreError, StoreResult,
    SubscriptionStoreError, SubscriptionStoreResult,
};
pub use message::{Event, Headers, Message};
pub use retry::{ClockBasedRetryStrategy, NoRetryStrategy, RetryConfig, RetryStrategy};
pub use store::{Criteria, Criterion, LoadOptions, MessageStream, Store, StreamPattern};
pub use subscriber::{
    HandledEvents, RegistryError, Subscriber, SubscriberAccessorRepository, SubscriberDescriptor,
    SubscriberError, SubscriberRegistry, SubscriberResult,
};
pub use subscription::{
    ErrorContext, ErrorFrame, LockableSubscriptionStore, RecordedError, RunMode, Status,
    Subscription, SubscriptionCriteria, SubscriptionRecord, SubscriptionStore,
};
pub use types::{EventId, StreamName, SubscriberId, Timestamp, DEFAULT_GROUP};
