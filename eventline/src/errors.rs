//! Error types for eventline.
//!
//! Errors are split by subsystem so callers can tell infrastructure faults
//! apart from each other:
//!
//! - **StoreError**: failures of the event store (reading, appending)
//! - **SubscriptionStoreError**: failures persisting subscription records
//! - **EngineError**: failures surfaced by the subscription engine itself
//!
//! Subscriber failures (a handler or hook returning an error) are *not*
//! represented here. The engine records them on the affected subscription
//! and returns them inside its operation results, see
//! [`crate::engine::ErrorReport`].

use crate::engine::ErrorReport;
use crate::types::SubscriberId;
use thiserror::Error;

/// Errors that can occur when interacting with the event store.
///
/// # Handling
///
/// - **UnsupportedCriterion**: programmer error, fix the criteria
/// - **MissingHeader**: programmer error, nothing was written
/// - **UniqueConstraintViolation**: a concurrent writer won the race; the
///   whole append may be retried
/// - everything else: infrastructure failure
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot translate a criterion it was given.
    #[error("Unsupported criterion: {0}")]
    UnsupportedCriterion(String),

    /// A message about to be persisted lacks a required header.
    #[error("Message is missing required header '{header}'")]
    MissingHeader {
        /// Name of the missing header
        header: &'static str,
    },

    /// Appending violated a uniqueness constraint of the store.
    #[error("Unique constraint violation: {0}")]
    UniqueConstraintViolation(String),

    /// The connection to the store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Serialization of an event or its headers failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Deserialization of an event or its headers failed.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by subscription store implementations.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionStoreError {
    /// No subscription with this id exists.
    #[error("Subscription '{0}' not found")]
    NotFound(SubscriberId),

    /// A subscription with this id already exists.
    #[error("Subscription '{0}' already exists")]
    AlreadyExists(SubscriberId),

    /// The exclusive lock could not be acquired or released.
    #[error("Subscription store lock failed: {0}")]
    LockFailed(String),

    /// The connection to the store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A persisted record could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by [`crate::engine::SubscriptionEngine`] operations.
///
/// Only infrastructure failures and the opt-in [`ErrorDetected`] escalation
/// show up here.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The event store failed.
    #[error("Event store error: {0}")]
    Store(#[from] StoreError),

    /// The subscription store failed.
    #[error("Subscription store error: {0}")]
    SubscriptionStore(#[from] SubscriptionStoreError),

    /// An operation reported subscriber errors and the caller asked for them
    /// to be raised.
    #[error(transparent)]
    ErrorDetected(#[from] ErrorDetected),
}

/// Aggregate of every subscriber error reported by one engine operation.
#[derive(Debug, Clone, Error)]
#[error("Error in subscription engine detected: {}", render_reports(.errors))]
pub struct ErrorDetected {
    /// The reported errors, in the order the engine produced them.
    pub errors: Vec<ErrorReport>,
    /// What the failing `boot` or `run` committed before raising; `None`
    /// for operations that do not process messages.
    pub progress: Option<CommittedProgress>,
}

/// Message counts of a processing call that still reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedProgress {
    /// Messages read from the store
    pub processed_messages: usize,
    /// Whether the end of the stream was reached
    pub stream_finished: bool,
}

fn render_reports(errors: &[ErrorReport]) -> String {
    errors
        .iter()
        .map(|report| format!("{}: {}", report.subscription_id, report.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Type alias for event store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Type alias for subscription store results.
pub type SubscriptionStoreResult<T> = Result<T, SubscriptionStoreError>;

/// Type alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
