//! Core identifiers shared by stores, subscribers and the engine.
//!
//! Identifiers use smart constructors so that a value which exists is valid:
//! a `SubscriberId` is never empty, a `StreamName` never contains a
//! wildcard, an `EventId` is always a UUIDv7.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Group assigned to subscribers that do not declare one.
pub const DEFAULT_GROUP: &str = "default";

/// Stable identifier of a subscriber, and of the subscription tracking it.
///
/// Changing a subscriber's id makes the engine treat it as a brand new
/// subscriber (the old subscription becomes detached).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SubscriberId(String);

/// Name of an event stream inside the store (for example `profile-42`).
///
/// The `*` character is reserved for stream patterns in load criteria.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = |name: &str| !name.contains('*')),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamName(String);

/// A globally unique event identifier using UUIDv7 format.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh time-ordered id.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// A UTC instant used for recorded-on headers and subscription bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// The current moment according to the system clock.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Returns this instant shifted forward by `duration`.
    ///
    /// Saturates at the maximum representable instant.
    #[must_use]
    pub fn plus(self, duration: Duration) -> Self {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map_or(Self(DateTime::<Utc>::MAX_UTC), Self)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn subscriber_id_accepts_valid_strings(s in "[a-zA-Z0-9_.-]{1,255}") {
            let id = SubscriberId::try_new(s.clone());
            prop_assert!(id.is_ok());
            let id = id.unwrap();
            prop_assert_eq!(id.as_ref(), &s);
        }

        #[test]
        fn stream_name_rejects_wildcards(prefix in "[a-z]{1,20}", suffix in "[a-z]{0,20}") {
            let candidate = format!("{prefix}*{suffix}");
            prop_assert!(StreamName::try_new(candidate).is_err());
        }
    }

    #[test]
    fn subscriber_id_validation() {
        assert!(SubscriberId::try_new("profile-projector").is_ok());
        assert!(SubscriberId::try_new("").is_err());
        assert!(SubscriberId::try_new("   ").is_err());
        assert!(SubscriberId::try_new("a".repeat(256)).is_err());
    }

    #[test]
    fn subscriber_id_is_trimmed() {
        let id = SubscriberId::try_new("  profile  ").unwrap();
        assert_eq!(id.as_ref(), "profile");
    }

    #[test]
    fn event_ids_are_version_seven() {
        let id = EventId::new();
        assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn timestamp_plus_moves_forward() {
        let start = Timestamp::now();
        let later = start.plus(Duration::from_secs(10));
        assert_eq!(
            (*later.as_datetime() - *start.as_datetime()).num_seconds(),
            10
        );
    }
}
