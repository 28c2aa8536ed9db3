//! Event messages: a domain event plus its headers.
//!
//! The store produces messages on read and subscribers consume them. A
//! message is immutable once built; the `with_*` builders consume and return
//! it so headers are set before the message is handed to the store.

use crate::errors::{StoreError, StoreResult};
use crate::types::{EventId, StreamName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A domain event that can travel through the store.
///
/// `event_type` is the stable name subscribers bind their handlers to. It
/// must not change between deployments, otherwise handlers stop matching
/// historical events.
pub trait Event: Clone + Send + Sync + 'static {
    /// The stable type name of this event (for example `profile.created`).
    fn event_type(&self) -> &'static str;
}

/// Typed metadata carried alongside an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Unique id of the event
    pub event_id: EventId,
    /// Stream the event belongs to; required by the store on save
    pub stream_name: Option<StreamName>,
    /// Sequence number of the event within its stream; required on save
    pub playhead: Option<u64>,
    /// When the store recorded the event
    pub recorded_on: Option<Timestamp>,
    /// Whether a later stream start superseded this event
    pub archived: bool,
    /// Marks the event as the start of a new stream segment
    ///
    /// Saving such a message archives every earlier message of its stream.
    pub new_stream_start: bool,
    /// Application-defined headers
    pub custom: BTreeMap<String, Value>,
}

impl Headers {
    /// Headers for a freshly created event.
    pub fn new() -> Self {
        Self {
            event_id: EventId::new(),
            stream_name: None,
            playhead: None,
            recorded_on: None,
            archived: false,
            new_stream_start: false,
            custom: BTreeMap::new(),
        }
    }
}

impl Default for Headers {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable envelope around one domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<E> {
    event: E,
    headers: Headers,
}

impl<E> Message<E> {
    /// Wraps an event with fresh headers.
    pub fn new(event: E) -> Self {
        Self {
            event,
            headers: Headers::new(),
        }
    }

    /// Rebuilds a message from stored parts. Used by store adapters.
    pub const fn from_parts(event: E, headers: Headers) -> Self {
        Self { event, headers }
    }

    /// Sets the stream header.
    #[must_use]
    pub fn with_stream(mut self, stream_name: StreamName) -> Self {
        self.headers.stream_name = Some(stream_name);
        self
    }

    /// Sets the playhead header.
    #[must_use]
    pub fn with_playhead(mut self, playhead: u64) -> Self {
        self.headers.playhead = Some(playhead);
        self
    }

    /// Sets the recorded-on header.
    #[must_use]
    pub fn with_recorded_on(mut self, recorded_on: Timestamp) -> Self {
        self.headers.recorded_on = Some(recorded_on);
        self
    }

    /// Marks the message as the start of a new stream segment.
    #[must_use]
    pub fn as_stream_start(mut self) -> Self {
        self.headers.new_stream_start = true;
        self
    }

    /// Sets the archived flag.
    #[must_use]
    pub fn with_archived(mut self, archived: bool) -> Self {
        self.headers.archived = archived;
        self
    }

    /// Adds a custom header, replacing any previous value under `name`.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: Value) -> Self {
        self.headers.custom.insert(name.into(), value);
        self
    }

    /// The wrapped event.
    pub const fn event(&self) -> &E {
        &self.event
    }

    /// All headers.
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Splits the message into its event and headers.
    pub fn into_parts(self) -> (E, Headers) {
        (self.event, self.headers)
    }

    /// The stream header, required for persisted messages.
    pub fn stream_name(&self) -> StoreResult<&StreamName> {
        self.headers
            .stream_name
            .as_ref()
            .ok_or(StoreError::MissingHeader { header: "stream" })
    }

    /// The playhead header, required for persisted messages.
    pub fn playhead(&self) -> StoreResult<u64> {
        self.headers
            .playhead
            .ok_or(StoreError::MissingHeader { header: "playhead" })
    }

    /// A custom header by name.
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.custom.get(name)
    }
}

impl<E: Event> Message<E> {
    /// Type name of the wrapped event.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}
