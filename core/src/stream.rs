//! Stream identification, positions and consumption configuration.
//!
//! This module defines strong types for naming event streams ([`StreamId`]),
//! addressing records inside them ([`Position`]) and describing how a projection
//! consumes one of them ([`StreamDescriptor`]).
//!
//! # Stream kinds
//!
//! | Kind | Physical name | Contents |
//! |------|---------------|----------|
//! | [`StreamKind::Aggregate`] | `Account-8f1c...` | One aggregate instance's history |
//! | [`StreamKind::Category`] | `$ce-Account` | Every instance of an aggregate type |
//! | [`StreamKind::Event`] | `$et-FundsAdded.v1` | Every event of one message type |

use crate::projection::{ConfigurationError, ProjectionCheckpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Prefix of category system streams.
pub const CATEGORY_PREFIX: &str = "$ce-";

/// Prefix of event-type system streams.
pub const EVENT_TYPE_PREFIX: &str = "$et-";

/// Error returned when parsing a stream ID from a string fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Unique identifier for an event stream.
///
/// Aggregate streams are conventionally named `{Category}-{id}`; the part
/// before the first `-` is the stream's category.
///
/// # Examples
///
/// ```
/// use eventview_core::stream::StreamId;
///
/// let id = StreamId::new("Account-42");
/// assert_eq!(id.category(), Some("Account"));
/// assert_eq!(StreamId::category_stream("Account").as_str(), "$ce-Account");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new stream ID from any string-like type.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The category system stream for an aggregate type.
    #[must_use]
    pub fn category_stream(category: &str) -> Self {
        Self(format!("{CATEGORY_PREFIX}{category}"))
    }

    /// The event-type system stream for one message type.
    #[must_use]
    pub fn event_type_stream(event_type: &str) -> Self {
        Self(format!("{EVENT_TYPE_PREFIX}{event_type}"))
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the stream ID and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Category of an aggregate stream (`Account-42` → `Account`).
    ///
    /// System streams (`$ce-`, `$et-`) and names without a `-` have no category.
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        if self.is_system() {
            return None;
        }
        self.0
            .split_once('-')
            .map(|(category, _)| category)
            .filter(|category| !category.is_empty())
    }

    /// Whether this is a `$`-prefixed system stream.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Position of a record inside one stream.
///
/// Positions start at 0 for the first record. When a position is reported as
/// the outcome of a read it always denotes the **next** position to read, so
/// a stream holding three records is fully consumed at `Position(3)`.
///
/// [`Position::END`] is only meaningful as the origin of a backward read.
///
/// # Examples
///
/// ```
/// use eventview_core::stream::Position;
///
/// let p = Position::START;
/// assert_eq!(p.next(), Position::new(1));
/// assert!(Position::END.is_end());
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position(u64);

impl Position {
    /// The first position of every stream.
    pub const START: Self = Self(0);

    /// Origin for backward reads: "after the last record".
    pub const END: Self = Self(u64::MAX);

    /// Create a position from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw position value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether this is the start of the stream.
    #[must_use]
    pub const fn is_start(self) -> bool {
        self.0 == 0
    }

    /// Whether this is the [`Position::END`] sentinel.
    #[must_use]
    pub const fn is_end(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end() {
            write!(f, "END")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Position> for u64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl std::ops::Add<u64> for Position {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

/// What a stream contains.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// One aggregate instance's history.
    Aggregate,
    /// All instances of one aggregate type.
    Category,
    /// All events of one message type.
    Event,
}

/// Direction in which a stream is paged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadDirection {
    /// Oldest first.
    #[default]
    Forward,
    /// Newest first.
    Backward,
}

/// Policy deciding where a stream starts being consumed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartStrategy {
    /// Replay the whole history, then continue from its end.
    #[default]
    ReadAllStartEnd,
    /// Skip history and only consume events appended from now on.
    StartEndOnly,
    /// Skip history and resume from an externally supplied checkpoint.
    StartFromPosition,
}

/// Immutable description of how a projection consumes one stream.
///
/// Built once at projection construction and never mutated. Use
/// [`StreamDescriptor::builder`]; `build()` fails fast on configuration errors
/// such as [`StartStrategy::StartFromPosition`] without a checkpoint provider.
#[derive(Clone)]
pub struct StreamDescriptor {
    kind: StreamKind,
    name: String,
    stream_id: StreamId,
    direction: ReadDirection,
    live: bool,
    accepted: BTreeSet<String>,
    start_strategy: StartStrategy,
    checkpoint: Option<Arc<dyn ProjectionCheckpoint>>,
}

impl StreamDescriptor {
    /// Start describing a stream of the given kind and logical name.
    ///
    /// For [`StreamKind::Category`] the name is the aggregate type, for
    /// [`StreamKind::Event`] the event type tag, for [`StreamKind::Aggregate`]
    /// the full stream name.
    #[must_use]
    pub fn builder(kind: StreamKind, name: impl Into<String>) -> StreamDescriptorBuilder {
        StreamDescriptorBuilder {
            kind,
            name: name.into(),
            direction: ReadDirection::Forward,
            live: false,
            accepted: BTreeSet::new(),
            start_strategy: StartStrategy::ReadAllStartEnd,
            checkpoint: None,
        }
    }

    /// The stream kind.
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The logical name the descriptor was built with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The physical stream this descriptor reads.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Paging direction.
    #[must_use]
    pub const fn direction(&self) -> ReadDirection {
        self.direction
    }

    /// Whether the stream is consumed through a live push subscription.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live
    }

    /// Accepted message type tags. Empty means every type is accepted.
    #[must_use]
    pub const fn accepted_types(&self) -> &BTreeSet<String> {
        &self.accepted
    }

    /// Whether records of `event_type` are handed to the projection.
    #[must_use]
    pub fn accepts(&self, event_type: &str) -> bool {
        self.accepted.is_empty() || self.accepted.contains(event_type)
    }

    /// Start-position strategy.
    #[must_use]
    pub const fn start_strategy(&self) -> StartStrategy {
        self.start_strategy
    }

    /// The externally supplied checkpoint provider, if any.
    #[must_use]
    pub fn checkpoint(&self) -> Option<&Arc<dyn ProjectionCheckpoint>> {
        self.checkpoint.as_ref()
    }
}

impl fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("direction", &self.direction)
            .field("live", &self.live)
            .field("accepted", &self.accepted)
            .field("start_strategy", &self.start_strategy)
            .field("checkpoint", &self.checkpoint.is_some())
            .finish()
    }
}

/// Builder for [`StreamDescriptor`].
pub struct StreamDescriptorBuilder {
    kind: StreamKind,
    name: String,
    direction: ReadDirection,
    live: bool,
    accepted: BTreeSet<String>,
    start_strategy: StartStrategy,
    checkpoint: Option<Arc<dyn ProjectionCheckpoint>>,
}

impl StreamDescriptorBuilder {
    /// Set the paging direction (default: forward).
    #[must_use]
    pub const fn direction(mut self, direction: ReadDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Consume through a live push subscription (default: pull via catch-up).
    #[must_use]
    pub const fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Add accepted message type tags.
    #[must_use]
    pub fn accepts<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted.extend(event_types.into_iter().map(Into::into));
        self
    }

    /// Set the start-position strategy (default: read all).
    #[must_use]
    pub const fn start_strategy(mut self, strategy: StartStrategy) -> Self {
        self.start_strategy = strategy;
        self
    }

    /// Attach a checkpoint provider.
    ///
    /// Required for [`StartStrategy::StartFromPosition`]. With any strategy, a
    /// provider also receives the stream's progress periodically.
    #[must_use]
    pub fn checkpoint(mut self, checkpoint: Arc<dyn ProjectionCheckpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Validate and build the descriptor.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::EmptyStreamName`] if the name is empty
    /// - [`ConfigurationError::MissingCheckpointProvider`] if the strategy is
    ///   [`StartStrategy::StartFromPosition`] and no provider was attached
    pub fn build(self) -> Result<StreamDescriptor, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyStreamName);
        }

        let stream_id = match self.kind {
            StreamKind::Aggregate => StreamId::new(self.name.clone()),
            StreamKind::Category => StreamId::category_stream(&self.name),
            StreamKind::Event => StreamId::event_type_stream(&self.name),
        };

        if self.start_strategy == StartStrategy::StartFromPosition && self.checkpoint.is_none() {
            return Err(ConfigurationError::MissingCheckpointProvider {
                stream: stream_id.into_inner(),
            });
        }

        Ok(StreamDescriptor {
            kind: self.kind,
            name: self.name,
            stream_id,
            direction: self.direction,
            live: self.live,
            accepted: self.accepted,
            start_strategy: self.start_strategy,
            checkpoint: self.checkpoint,
        })
    }
}

/// Where consumption of a stream begins, as decided by the start-position
/// resolver.
///
/// The position is only defined once resolution completed; an incomplete
/// result (the stream does not exist yet) carries no position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameAndPosition {
    stream_id: StreamId,
    position: Option<Position>,
}

impl NameAndPosition {
    /// A completed resolution.
    #[must_use]
    pub const fn complete(stream_id: StreamId, position: Position) -> Self {
        Self {
            stream_id,
            position: Some(position),
        }
    }

    /// An incomplete resolution: the stream could not be found.
    #[must_use]
    pub const fn incomplete(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            position: None,
        }
    }

    /// The stream this resolution is about.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Whether resolution completed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.position.is_some()
    }

    /// The resolved position, if resolution completed.
    #[must_use]
    pub const fn position(&self) -> Option<Position> {
        self.position
    }
}
