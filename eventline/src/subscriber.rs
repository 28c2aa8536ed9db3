//! Subscribers and the registry the engine discovers them from.
//!
//! A subscriber is application code that consumes messages: a projection
//! writing a read model, a process manager, an outbox forwarder. Each one is
//! described by a [`SubscriberDescriptor`] (id, group, run mode) and
//! registered once at startup in a [`SubscriberRegistry`] that is handed to
//! the engine.
//!
//! ```ignore
//! struct ProfileProjector { /* connection to the read model */ }
//!
//! #[async_trait]
//! impl Subscriber<ProfileEvent> for ProfileProjector {
//!     fn handled_events(&self) -> HandledEvents {
//!         HandledEvents::only(["profile.created", "profile.renamed"])
//!     }
//!
//!     async fn handle(&self, message: &Message<ProfileEvent>) -> SubscriberResult<()> {
//!         self.apply(message.event()).await?;
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = SubscriberRegistry::new();
//! registry.register(SubscriberDescriptor::new(
//!     SubscriberId::try_new("profile-projector")?,
//!     Arc::new(ProfileProjector::new()),
//! ))?;
//! ```

use crate::message::Message;
use crate::subscription::{ErrorContext, RunMode};
use crate::types::{SubscriberId, DEFAULT_GROUP};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use thiserror::Error;

/// Failure returned by subscriber handlers and hooks.
///
/// Any `std::error::Error` converts into it, so handlers can use `?`. The
/// conversion records the call site and the error's source chain as
/// [`ErrorContext`] frames.
#[derive(Debug, Clone)]
pub struct SubscriberError {
    message: String,
    context: ErrorContext,
}

impl SubscriberError {
    /// An error with a plain message, located at the caller.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let mut context = ErrorContext::default();
        context.push(Location::caller().to_string(), message.clone());
        Self { message, context }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Captured frames.
    pub const fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Splits into message and context.
    pub fn into_parts(self) -> (String, ErrorContext) {
        (self.message, self.context)
    }
}

impl fmt::Display for SubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for SubscriberError
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[track_caller]
    fn from(error: E) -> Self {
        let message = error.to_string();
        let mut context = ErrorContext::default();
        context.push(Location::caller().to_string(), message.clone());
        let mut source = error.source();
        while let Some(cause) = source {
            context.push("caused by", cause.to_string());
            source = cause.source();
        }
        Self { message, context }
    }
}

/// Result type for subscriber handlers and hooks.
pub type SubscriberResult<T> = Result<T, SubscriberError>;

/// Which event types a subscriber wants to receive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandledEvents {
    /// Every event
    #[default]
    All,
    /// Only events whose type is listed
    Only(Vec<&'static str>),
}

impl HandledEvents {
    /// Shorthand for [`HandledEvents::Only`].
    pub fn only<I>(types: I) -> Self
    where
        I: IntoIterator<Item = &'static str>,
    {
        Self::Only(types.into_iter().collect())
    }

    /// Whether a message of `event_type` should be dispatched.
    pub fn handles(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(types) => types.iter().any(|t| *t == event_type),
        }
    }
}

/// Application code that consumes messages.
///
/// `setup` and `teardown` create and destroy whatever external resources the
/// subscriber needs (tables, queues). Both must be idempotent. The engine
/// always calls them; the defaults do nothing.
#[async_trait]
pub trait Subscriber<E>: Send + Sync {
    /// Event types to dispatch to [`Self::handle`].
    fn handled_events(&self) -> HandledEvents {
        HandledEvents::All
    }

    /// Processes one message.
    async fn handle(&self, message: &Message<E>) -> SubscriberResult<()>;

    /// Creates external resources.
    async fn setup(&self) -> SubscriberResult<()> {
        Ok(())
    }

    /// Destroys external resources.
    async fn teardown(&self) -> SubscriberResult<()> {
        Ok(())
    }
}

/// A registered subscriber together with its scheduling metadata.
pub struct SubscriberDescriptor<E> {
    id: SubscriberId,
    group: String,
    run_mode: RunMode,
    subscriber: Arc<dyn Subscriber<E>>,
}

impl<E> Clone for SubscriberDescriptor<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            group: self.group.clone(),
            run_mode: self.run_mode,
            subscriber: Arc::clone(&self.subscriber),
        }
    }
}

impl<E> fmt::Debug for SubscriberDescriptor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberDescriptor")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("run_mode", &self.run_mode)
            .finish_non_exhaustive()
    }
}

impl<E> SubscriberDescriptor<E> {
    /// Describes `subscriber` in the default group, run from the beginning.
    pub fn new(id: SubscriberId, subscriber: Arc<dyn Subscriber<E>>) -> Self {
        Self {
            id,
            group: DEFAULT_GROUP.to_string(),
            run_mode: RunMode::FromBeginning,
            subscriber,
        }
    }

    /// Sets the group.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Sets the run mode.
    #[must_use]
    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    /// Subscriber id.
    pub const fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Group.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Run mode.
    pub const fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// The subscriber implementation.
    pub fn subscriber(&self) -> &dyn Subscriber<E> {
        self.subscriber.as_ref()
    }
}

/// The engine's view of the registered subscribers.
pub trait SubscriberAccessorRepository<E>: Send + Sync {
    /// All live subscribers, ordered by id.
    fn subscribers(&self) -> Vec<SubscriberDescriptor<E>>;

    /// A live subscriber by id.
    fn get(&self, id: &SubscriberId) -> Option<SubscriberDescriptor<E>>;

    /// A subscriber whose teardown hook may be invoked, live or retired.
    fn get_for_teardown(&self, id: &SubscriberId) -> Option<SubscriberDescriptor<E>> {
        self.get(id)
    }
}

/// Errors raised while building a [`SubscriberRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two subscribers were registered under the same id.
    #[error("Subscriber '{0}' is already registered")]
    DuplicateSubscriber(SubscriberId),
}

/// Explicit registration table, built once at startup.
///
/// Retired subscribers are no longer live: the engine detaches their
/// subscriptions. Their teardown hooks stay reachable so `teardown` and
/// `remove` can still clean up.
pub struct SubscriberRegistry<E> {
    live: BTreeMap<SubscriberId, SubscriberDescriptor<E>>,
    retired: BTreeMap<SubscriberId, SubscriberDescriptor<E>>,
}

impl<E> Default for SubscriberRegistry<E> {
    fn default() -> Self {
        Self {
            live: BTreeMap::new(),
            retired: BTreeMap::new(),
        }
    }
}

impl<E> fmt::Debug for SubscriberRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .field("retired", &self.retired.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<E> SubscriberRegistry<E> {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a live subscriber.
    pub fn register(&mut self, descriptor: SubscriberDescriptor<E>) -> Result<(), RegistryError> {
        let id = descriptor.id().clone();
        if self.live.contains_key(&id) || self.retired.contains_key(&id) {
            return Err(RegistryError::DuplicateSubscriber(id));
        }
        self.live.insert(id, descriptor);
        Ok(())
    }

    /// Adds a subscriber whose code is being removed: it is not live, but
    /// its teardown hook remains available.
    pub fn retire(&mut self, descriptor: SubscriberDescriptor<E>) -> Result<(), RegistryError> {
        let id = descriptor.id().clone();
        if self.live.contains_key(&id) || self.retired.contains_key(&id) {
            return Err(RegistryError::DuplicateSubscriber(id));
        }
        self.retired.insert(id, descriptor);
        Ok(())
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no live subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<E> SubscriberAccessorRepository<E> for SubscriberRegistry<E> {
    fn subscribers(&self) -> Vec<SubscriberDescriptor<E>> {
        self.live.values().cloned().collect()
    }

    fn get(&self, id: &SubscriberId) -> Option<SubscriberDescriptor<E>> {
        self.live.get(id).cloned()
    }

    fn get_for_teardown(&self, id: &SubscriberId) -> Option<SubscriberDescriptor<E>> {
        self.live.get(id).or_else(|| self.retired.get(id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Event;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "ping"
        }
    }

    struct Noop;

    #[async_trait]
    impl Subscriber<Ping> for Noop {
        async fn handle(&self, _message: &Message<Ping>) -> SubscriberResult<()> {
            Ok(())
        }
    }

    fn descriptor(id: &str) -> SubscriberDescriptor<Ping> {
        SubscriberDescriptor::new(SubscriberId::try_new(id).unwrap(), Arc::new(Noop))
    }

    #[derive(Debug, Error)]
    #[error("read model unavailable")]
    struct Outer {
        #[source]
        cause: std::io::Error,
    }

    #[test]
    fn conversion_captures_location_and_sources() {
        let outer = Outer {
            cause: std::io::Error::other("connection refused"),
        };
        let err: SubscriberError = outer.into();

        assert_eq!(err.message(), "read model unavailable");
        let frames = err.context().frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].location.contains("subscriber.rs"));
        assert_eq!(frames[1].detail, "connection refused");
    }

    #[test]
    fn handled_events_filter_by_type() {
        assert!(HandledEvents::All.handles("anything"));
        let only = HandledEvents::only(["profile.created"]);
        assert!(only.handles("profile.created"));
        assert!(!only.handles("profile.renamed"));
    }

    #[test]
    fn descriptor_defaults() {
        let desc = descriptor("profile");
        assert_eq!(desc.group(), DEFAULT_GROUP);
        assert_eq!(desc.run_mode(), RunMode::FromBeginning);
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = SubscriberRegistry::new();
        registry.register(descriptor("profile")).unwrap();

        assert_eq!(
            registry.register(descriptor("profile")),
            Err(RegistryError::DuplicateSubscriber(
                SubscriberId::try_new("profile").unwrap()
            ))
        );
        assert!(registry.retire(descriptor("profile")).is_err());
    }

    #[test]
    fn retired_subscribers_are_only_reachable_for_teardown() {
        let mut registry = SubscriberRegistry::new();
        registry.register(descriptor("live")).unwrap();
        registry.retire(descriptor("gone")).unwrap();

        let gone = SubscriberId::try_new("gone").unwrap();
        assert_eq!(registry.subscribers().len(), 1);
        assert!(registry.get(&gone).is_none());
        assert!(registry.get_for_teardown(&gone).is_some());
    }
}
