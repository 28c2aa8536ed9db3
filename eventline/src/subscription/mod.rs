//! The persistent runtime record of one subscriber.
//!
//! A [`Subscription`] tracks where a subscriber is in the event log
//! (`position`), what lifecycle state it is in (`status`) and, after a
//! failure, what went wrong and how often it was retried. Status changes go
//! through the transition methods so the state machine stays consistent;
//! the engine decides *when* to call them.

pub mod store;

use crate::types::{SubscriberId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use store::{LockableSubscriptionStore, SubscriptionCriteria, SubscriptionStore};

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Discovered, setup not yet run
    New,
    /// Catching up on the backlog
    Booting,
    /// Processing new messages incrementally
    Active,
    /// Stopped by an operator
    Paused,
    /// A `Once` subscriber that drained the log
    Finished,
    /// The subscriber is no longer registered
    Detached,
    /// A handler or hook failed
    Error,
}

impl Status {
    /// Stable string form used for persistence.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Booting => "booting",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Detached => "detached",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted status or run mode is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "booting" => Ok(Self::Booting),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "finished" => Ok(Self::Finished),
            "detached" => Ok(Self::Detached),
            "error" => Ok(Self::Error),
            other => Err(ParseEnumError {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a subscriber starts consuming the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Replay the whole log, then follow it
    #[default]
    FromBeginning,
    /// Skip the backlog and consume only messages appended after setup
    FromNow,
    /// Replay the log once and finish
    Once,
}

impl RunMode {
    /// Stable string form used for persistence.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FromBeginning => "from_beginning",
            Self::FromNow => "from_now",
            Self::Once => "once",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "from_beginning" => Ok(Self::FromBeginning),
            "from_now" => Ok(Self::FromNow),
            "once" => Ok(Self::Once),
            other => Err(ParseEnumError {
                kind: "run mode",
                value: other.to_string(),
            }),
        }
    }
}

/// One entry of a captured error context: where it happened and what was
/// reported there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Source location (`file:line:column`) or error type
    pub location: String,
    /// Message recorded at that location
    pub detail: String,
}

/// Ordered frames describing a failure, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorContext(Vec<ErrorFrame>);

impl ErrorContext {
    /// Wraps the given frames.
    pub const fn new(frames: Vec<ErrorFrame>) -> Self {
        Self(frames)
    }

    /// Appends a frame.
    pub fn push(&mut self, location: impl Into<String>, detail: impl Into<String>) {
        self.0.push(ErrorFrame {
            location: location.into(),
            detail: detail.into(),
        });
    }

    /// The frames in order.
    pub fn frames(&self) -> &[ErrorFrame] {
        &self.0
    }

    /// Whether no frame was captured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The failure recorded on a subscription in [`Status::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    /// Human-readable error message
    pub message: String,
    /// Status the subscription was in when the failure happened
    pub previous_status: Status,
    /// Structured context captured from the failure
    pub context: ErrorContext,
    /// When the failure happened
    pub occurred_at: Timestamp,
}

/// Runtime record for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriberId,
    group: String,
    run_mode: RunMode,
    status: Status,
    position: u64,
    error: Option<RecordedError>,
    retry_attempt: u32,
    last_saved_at: Option<Timestamp>,
}

impl Subscription {
    /// A freshly discovered subscription in [`Status::New`] at position 0.
    pub fn new(id: SubscriberId, group: impl Into<String>, run_mode: RunMode) -> Self {
        Self {
            id,
            group: group.into(),
            run_mode,
            status: Status::New,
            position: 0,
            error: None,
            retry_attempt: 0,
            last_saved_at: None,
        }
    }

    /// Id of the subscription (equal to its subscriber's id).
    pub const fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Group used for coarse selection.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Run mode.
    pub const fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Current status.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Index of the last processed message, 0 if none.
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// The recorded failure, if any.
    pub const fn error(&self) -> Option<&RecordedError> {
        self.error.as_ref()
    }

    /// Consecutive failed attempts since the last success.
    pub const fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// When the record was last persisted.
    pub const fn last_saved_at(&self) -> Option<Timestamp> {
        self.last_saved_at
    }

    /// `New` → `Booting`.
    pub fn start_booting(&mut self) {
        self.status = Status::Booting;
    }

    /// Marks the subscription `Active`.
    pub fn activate(&mut self) {
        self.status = Status::Active;
    }

    /// Marks the subscription `Finished`.
    pub fn finish(&mut self) {
        self.status = Status::Finished;
    }

    /// Marks the subscription `Paused`. Position and error are kept.
    pub fn pause(&mut self) {
        self.status = Status::Paused;
    }

    /// Marks the subscription `Detached`.
    pub fn detach(&mut self) {
        self.status = Status::Detached;
    }

    /// Back to `New`, clearing the error and the retry counter.
    pub fn reset_to_new(&mut self) {
        self.status = Status::New;
        self.error = None;
        self.retry_attempt = 0;
    }

    /// Records a failure and moves to `Error`.
    ///
    /// The current status is kept as the error's previous status. Failing a
    /// subscription that is already in `Error` keeps the original previous
    /// status.
    pub fn fail(&mut self, message: impl Into<String>, context: ErrorContext, now: Timestamp) {
        let previous_status = match (&self.error, self.status) {
            (Some(error), Status::Error) => error.previous_status,
            (_, status) => status,
        };
        self.error = Some(RecordedError {
            message: message.into(),
            previous_status,
            context,
            occurred_at: now,
        });
        self.status = Status::Error;
        self.retry_attempt = self.retry_attempt.saturating_add(1);
    }

    /// Restores the status recorded in the error and clears it.
    ///
    /// The retry counter is left alone; it only resets once the retried work
    /// succeeds (see [`Self::reset_retry`]). Does nothing unless the
    /// subscription is in `Error`.
    pub fn retry(&mut self) {
        if self.status != Status::Error {
            return;
        }
        if let Some(error) = self.error.take() {
            self.status = error.previous_status;
        }
    }

    /// Clears the retry counter.
    pub fn reset_retry(&mut self) {
        self.retry_attempt = 0;
    }

    /// Clears the recorded error without changing the status.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Moves the cursor forward. Values not greater than the current
    /// position are ignored.
    pub fn change_position(&mut self, index: u64) {
        if index > self.position {
            self.position = index;
        }
    }

    /// Stamps the persistence time.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_saved_at = Some(now);
    }

    /// The persisted layout of this subscription.
    pub fn to_record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            id: self.id.clone(),
            group: self.group.clone(),
            run_mode: self.run_mode,
            status: self.status,
            position: self.position,
            error: self.error.clone(),
            retry_attempt: self.retry_attempt,
            last_saved_at: self.last_saved_at,
        }
    }

    /// Rebuilds a subscription from its persisted layout.
    pub fn from_record(record: SubscriptionRecord) -> Self {
        Self {
            id: record.id,
            group: record.group,
            run_mode: record.run_mode,
            status: record.status,
            position: record.position,
            error: record.error,
            retry_attempt: record.retry_attempt,
            last_saved_at: record.last_saved_at,
        }
    }
}

/// Storage layout of a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SubscriptionRecord {
    pub id: SubscriberId,
    pub group: String,
    pub run_mode: RunMode,
    pub status: Status,
    pub position: u64,
    pub error: Option<RecordedError>,
    pub retry_attempt: u32,
    pub last_saved_at: Option<Timestamp>,
}
