//! Event store collaborator boundary.
//!
//! The read side never talks to a concrete event-store product directly; it
//! goes through the [`EventStore`] trait, which offers exactly three things:
//!
//! - Paged reads of one stream in either direction ([`EventStore::read_stream`])
//! - Push subscriptions from a position ([`EventStore::subscribe`])
//! - Appends with optimistic concurrency ([`EventStore::append_events`]), used
//!   by the write side and by tests to seed streams
//!
//! # Implementations
//!
//! - `InMemoryEventStore` (in `eventview-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use eventview_core::event_store::{EventStore, EventStoreError};
//! use eventview_core::stream::{Position, ReadDirection, StreamId};
//!
//! async fn tail(store: &dyn EventStore) -> Result<Position, EventStoreError> {
//!     let slice = store
//!         .read_stream(StreamId::new("$ce-Account"), Position::END, 1, ReadDirection::Backward)
//!         .await?;
//!     Ok(slice.events.first().map_or(Position::START, |record| record.position.next()))
//! }
//! ```

use crate::event::{RecordedEvent, SerializedEvent};
use crate::stream::{Position, ReadDirection, StreamId};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: expected version doesn't match current version.
    #[error("Concurrency conflict on {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream ID where the conflict occurred.
        stream_id: StreamId,
        /// The version we expected the stream to be at.
        expected: Position,
        /// The actual current version of the stream.
        actual: Position,
    },

    /// Stream not found in the event store.
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Database or transport error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// General I/O error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// A push subscription could not be opened or was dropped by the store.
    #[error("Subscription to {stream_id} failed: {reason}")]
    SubscriptionFailed {
        /// The stream that was subscribed to.
        stream_id: StreamId,
        /// The reason for failure.
        reason: String,
    },
}

/// One page of a stream read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadSlice {
    /// Records in read order.
    pub events: Vec<RecordedEvent>,

    /// Where the next page starts. For backward reads this is the position
    /// just below the last returned record.
    pub next_position: Position,

    /// No more records exist in the read direction.
    pub end_of_stream: bool,

    /// Whether the stream exists at all. A non-existent stream yields an
    /// empty slice with `end_of_stream = true`.
    pub stream_exists: bool,
}

impl ReadSlice {
    /// The slice returned for a stream that does not exist.
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            events: Vec::new(),
            next_position: Position::START,
            end_of_stream: true,
            stream_exists: false,
        }
    }
}

/// Stream of records pushed by a live subscription.
///
/// The stream ends (returns `None`) when the store drops the subscription;
/// consumers are expected to resubscribe from their last position.
pub type RecordStream =
    Pin<Box<dyn Stream<Item = Result<RecordedEvent, EventStoreError>> + Send>>;

/// Event store abstraction consumed by the read side.
///
/// # Ordering
///
/// Records of one stream are returned and pushed in position order. There is
/// no ordering guarantee between different streams.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so that streams and projections can hold it as `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Read up to `count` records of a stream starting at `start`.
    ///
    /// Forward reads return records with `position >= start` in ascending
    /// order. Backward reads return records with `position <= start` in
    /// descending order; use [`Position::END`] to start from the tail.
    ///
    /// A stream that does not exist is not an error: it yields
    /// [`ReadSlice::missing`].
    ///
    /// # Errors
    ///
    /// - `DatabaseError`/`IoError`: the store could not be reached
    fn read_stream(
        &self,
        stream_id: StreamId,
        start: Position,
        count: usize,
        direction: ReadDirection,
    ) -> Pin<Box<dyn Future<Output = Result<ReadSlice, EventStoreError>> + Send + '_>>;

    /// Open a push subscription delivering every record with
    /// `position >= from`, historical ones first, then live appends.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: the stream does not exist yet
    /// - `SubscriptionFailed`: the store refused the subscription
    fn subscribe(
        &self,
        stream_id: StreamId,
        from: Position,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, EventStoreError>> + Send + '_>>;

    /// Append events to an aggregate stream with optimistic concurrency.
    ///
    /// `expected_version` is the number of records the stream must currently
    /// hold (`Some(Position::START)` for a new stream); `None` skips the check.
    /// Returns the stream's new length.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: version mismatch
    /// - `DatabaseError`: the store could not be reached
    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Position>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Position, EventStoreError>> + Send + '_>>;

    /// Whether a stream exists, via a one-record forward read.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`EventStore::read_stream`].
    fn stream_exists(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let slice = self
                .read_stream(stream_id, Position::START, 1, ReadDirection::Forward)
                .await?;
            Ok(slice.stream_exists)
        })
    }
}
