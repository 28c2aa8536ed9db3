//! Event store abstraction.
//!
//! The `Store` trait is the port the engine reads through. Messages are kept
//! in one append-only log ordered by a monotonically increasing *index*. The
//! index is gap tolerant (a backend may skip values) and is the durable
//! cursor subscriptions resume from.

use crate::errors::{StoreError, StoreResult};
use crate::message::{Event, Message};
use async_trait::async_trait;

/// One predicate over stored messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Stream name, either exact (`profile-1`) or a prefix wildcard
    /// (`profile-*`).
    StreamName(String),
    /// Only messages whose index is strictly greater than this value.
    FromIndex(u64),
    /// Only messages whose playhead is strictly greater than this value.
    FromPlayhead(u64),
    /// Only messages with this archived flag.
    Archived(bool),
    /// Only messages whose event type is one of these.
    EventTypes(Vec<String>),
}

/// A stream-name criterion compiled to something a backend can evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPattern {
    /// Matches exactly one stream.
    Exact(String),
    /// Matches every stream starting with the prefix.
    Prefix(String),
}

impl StreamPattern {
    /// Compiles a raw stream-name criterion.
    ///
    /// Only a single trailing `*` is understood; anything else is rejected
    /// as [`StoreError::UnsupportedCriterion`].
    pub fn parse(raw: &str) -> StoreResult<Self> {
        match raw.find('*') {
            None => Ok(Self::Exact(raw.to_string())),
            Some(at) if at == raw.len() - 1 => Ok(Self::Prefix(raw[..at].to_string())),
            Some(_) => Err(StoreError::UnsupportedCriterion(format!(
                "stream pattern '{raw}' (only a trailing '*' is supported)"
            ))),
        }
    }

    /// Whether `stream_name` matches the pattern.
    pub fn matches(&self, stream_name: &str) -> bool {
        match self {
            Self::Exact(name) => name == stream_name,
            Self::Prefix(prefix) => stream_name.starts_with(prefix.as_str()),
        }
    }
}

/// A conjunction of criteria. Empty criteria match every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    criteria: Vec<Criterion>,
}

impl Criteria {
    /// Criteria matching every message.
    pub const fn new() -> Self {
        Self {
            criteria: Vec::new(),
        }
    }

    /// Adds an arbitrary criterion.
    #[must_use]
    pub fn with(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Restricts to a stream name or `prefix-*` pattern.
    #[must_use]
    pub fn stream_name(self, pattern: impl Into<String>) -> Self {
        self.with(Criterion::StreamName(pattern.into()))
    }

    /// Restricts to messages after `index`.
    #[must_use]
    #[allow(clippy::wrong_self_convention)]
    pub fn from_index(self, index: u64) -> Self {
        self.with(Criterion::FromIndex(index))
    }

    /// Restricts to messages after `playhead`.
    #[must_use]
    #[allow(clippy::wrong_self_convention)]
    pub fn from_playhead(self, playhead: u64) -> Self {
        self.with(Criterion::FromPlayhead(playhead))
    }

    /// Restricts by archived flag.
    #[must_use]
    pub fn archived(self, archived: bool) -> Self {
        self.with(Criterion::Archived(archived))
    }

    /// Restricts to the given event types.
    #[must_use]
    pub fn event_types<I, S>(self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(Criterion::EventTypes(
            types.into_iter().map(Into::into).collect(),
        ))
    }

    /// The individual criteria, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Criterion> + '_ {
        self.criteria.iter()
    }

    /// Whether no criterion is set.
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Evaluates the criteria against one stored message.
    ///
    /// Backends that filter in memory use this; SQL backends compile the
    /// criteria instead. Fails only on criteria that cannot be evaluated.
    pub fn matches<E: Event>(&self, index: u64, message: &Message<E>) -> StoreResult<bool> {
        for criterion in &self.criteria {
            let matched = match criterion {
                Criterion::StreamName(raw) => {
                    let pattern = StreamPattern::parse(raw)?;
                    message
                        .headers()
                        .stream_name
                        .as_ref()
                        .is_some_and(|name| pattern.matches(name.as_ref()))
                }
                Criterion::FromIndex(from) => index > *from,
                Criterion::FromPlayhead(from) => {
                    message.headers().playhead.is_some_and(|playhead| playhead > *from)
                }
                Criterion::Archived(archived) => message.headers().archived == *archived,
                Criterion::EventTypes(types) => {
                    types.iter().any(|event_type| event_type == message.event_type())
                }
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Paging and direction for [`Store::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Maximum number of messages; `None` for no limit
    pub limit: Option<usize>,
    /// Number of matching messages to skip
    pub offset: Option<usize>,
    /// Read newest first
    pub backwards: bool,
}

impl LoadOptions {
    /// Forward, unbounded.
    pub const fn new() -> Self {
        Self {
            limit: None,
            offset: None,
            backwards: false,
        }
    }

    /// Sets the limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Reads newest first.
    #[must_use]
    pub const fn backwards(mut self) -> Self {
        self.backwards = true;
        self
    }
}

/// A closable, single-pass cursor over loaded messages.
///
/// `advance` moves to the next message; `current`, `index` and `position`
/// then describe it. Before the first `advance` there is no current message
/// and `index`/`position` are `None`.
#[async_trait]
pub trait MessageStream<E>: Send {
    /// Moves to the next message. Returns `false` once the stream is drained.
    async fn advance(&mut self) -> StoreResult<bool>;

    /// The message the cursor is on.
    fn current(&self) -> Option<&Message<E>>;

    /// Store index of the current message. This is the durable cursor value.
    fn index(&self) -> Option<u64>;

    /// Zero-based count of messages yielded so far by this stream instance.
    fn position(&self) -> Option<u64>;

    /// Whether the stream has been drained or closed.
    fn end(&self) -> bool;

    /// Releases any resources held by the stream.
    fn close(&mut self);
}

/// Port to an append-only message log.
#[async_trait]
pub trait Store<E: Event>: Send + Sync {
    /// Opens a stream over messages matching `criteria`, ordered by index.
    async fn load(
        &self,
        criteria: &Criteria,
        options: LoadOptions,
    ) -> StoreResult<Box<dyn MessageStream<E>>>;

    /// Counts messages matching `criteria`.
    async fn count(&self, criteria: &Criteria) -> StoreResult<u64>;

    /// Appends messages atomically.
    ///
    /// Every message must carry stream and playhead headers; otherwise
    /// nothing is written and [`StoreError::MissingHeader`] is returned.
    async fn save(&self, messages: Vec<Message<E>>) -> StoreResult<()>;

    /// Index of the newest message, `None` for an empty store.
    async fn last_index(&self) -> StoreResult<Option<u64>> {
        let mut stream = self
            .load(&Criteria::new(), LoadOptions::new().with_limit(1).backwards())
            .await?;
        let index = if stream.advance().await? {
            stream.index()
        } else {
            None
        };
        stream.close();
        Ok(index)
    }
}

/// Checks the headers every persisted message needs.
///
/// Adapters call this for the whole batch before writing anything.
pub fn ensure_persistable<E>(messages: &[Message<E>]) -> StoreResult<()> {
    for message in messages {
        message.stream_name()?;
        message.playhead()?;
    }
    Ok(())
}

/// A stream over messages already materialised in memory.
#[derive(Debug)]
pub struct VecMessageStream<E> {
    messages: std::vec::IntoIter<(u64, Message<E>)>,
    current: Option<(u64, Message<E>)>,
    yielded: u64,
    ended: bool,
}

impl<E> VecMessageStream<E> {
    /// Streams over `(index, message)` pairs in the given order.
    pub fn new(messages: Vec<(u64, Message<E>)>) -> Self {
        Self {
            messages: messages.into_iter(),
            current: None,
            yielded: 0,
            ended: false,
        }
    }
}

#[async_trait]
impl<E: Send> MessageStream<E> for VecMessageStream<E> {
    async fn advance(&mut self) -> StoreResult<bool> {
        if self.ended {
            return Ok(false);
        }
        match self.messages.next() {
            Some(next) => {
                self.current = Some(next);
                self.yielded += 1;
                Ok(true)
            }
            None => {
                self.ended = true;
                Ok(false)
            }
        }
    }

    fn current(&self) -> Option<&Message<E>> {
        self.current.as_ref().map(|(_, message)| message)
    }

    fn index(&self) -> Option<u64> {
        self.current.as_ref().map(|(index, _)| *index)
    }

    fn position(&self) -> Option<u64> {
        self.yielded.checked_sub(1)
    }

    fn end(&self) -> bool {
        self.ended
    }

    fn close(&mut self) {
        self.ended = true;
        self.messages = Vec::new().into_iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamName;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum ProfileEvent {
        Created,
        Renamed,
    }

    impl Event for ProfileEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Created => "profile.created",
                Self::Renamed => "profile.renamed",
            }
        }
    }

    fn message(stream: &str, playhead: u64, event: ProfileEvent) -> Message<ProfileEvent> {
        Message::new(event)
            .with_stream(StreamName::try_new(stream).unwrap())
            .with_playhead(playhead)
    }

    #[test]
    fn stream_pattern_parses_exact_and_prefix() {
        assert_eq!(
            StreamPattern::parse("profile-1").unwrap(),
            StreamPattern::Exact("profile-1".to_string())
        );
        assert_eq!(
            StreamPattern::parse("profile-*").unwrap(),
            StreamPattern::Prefix("profile-".to_string())
        );
        assert!(matches!(
            StreamPattern::parse("pro*file"),
            Err(StoreError::UnsupportedCriterion(_))
        ));
    }

    #[test]
    fn criteria_are_conjunctive() {
        let msg = message("profile-1", 2, ProfileEvent::Renamed);
        let criteria = Criteria::new().stream_name("profile-*").from_playhead(1);
        assert!(criteria.matches(5, &msg).unwrap());

        let criteria = criteria.event_types(["profile.created"]);
        assert!(!criteria.matches(5, &msg).unwrap());
    }

    #[test]
    fn from_index_is_exclusive() {
        let msg = message("profile-1", 1, ProfileEvent::Created);
        assert!(!Criteria::new().from_index(3).matches(3, &msg).unwrap());
        assert!(Criteria::new().from_index(3).matches(4, &msg).unwrap());
    }

    #[test]
    fn unsupported_pattern_fails_evaluation() {
        let msg = message("profile-1", 1, ProfileEvent::Created);
        let result = Criteria::new().stream_name("*-1").matches(1, &msg);
        assert!(matches!(result, Err(StoreError::UnsupportedCriterion(_))));
    }

    #[test]
    fn ensure_persistable_rejects_whole_batch() {
        let batch = vec![
            message("profile-1", 1, ProfileEvent::Created),
            Message::new(ProfileEvent::Renamed),
        ];
        assert!(matches!(
            ensure_persistable(&batch),
            Err(StoreError::MissingHeader { header: "stream" })
        ));
    }

    #[tokio::test]
    async fn vec_stream_tracks_index_and_position() {
        let mut stream = VecMessageStream::new(vec![
            (2, message("profile-1", 1, ProfileEvent::Created)),
            (4, message("profile-1", 2, ProfileEvent::Renamed)),
        ]);

        assert_eq!(stream.index(), None);
        assert_eq!(stream.position(), None);

        assert!(stream.advance().await.unwrap());
        assert_eq!(stream.index(), Some(2));
        assert_eq!(stream.position(), Some(0));

        assert!(stream.advance().await.unwrap());
        assert_eq!(stream.index(), Some(4));
        assert_eq!(stream.position(), Some(1));
        assert_eq!(stream.current().unwrap().event(), &ProfileEvent::Renamed);

        assert!(!stream.advance().await.unwrap());
        assert!(stream.end());
    }

    proptest! {
        #[test]
        fn prefix_pattern_matches_every_extension(prefix in "[a-z]{1,10}-", rest in "[a-z0-9]{0,10}") {
            let pattern = StreamPattern::parse(&format!("{prefix}*")).unwrap();
            let candidate = format!("{prefix}{rest}");
            prop_assert!(pattern.matches(&candidate));
        }
    }
}
