//! Read-side vocabulary: checkpoints, the event handler seam and errors.
//!
//! # Overview
//!
//! Projections are the **query side of CQRS**. A projection consumes one or
//! more streams and materializes them into an in-memory cache of DTOs. This
//! module defines what the runtime and projection crates agree on:
//!
//! - [`EventHandler`]: where a stream hands each decoded message
//! - [`ProjectionCheckpoint`]: externally supplied stream positions, used by
//!   [`StartStrategy::StartFromPosition`](crate::stream::StartStrategy) and
//!   to persist progress
//! - [`ConfigurationError`]: structural misconfiguration, always reported at
//!   construction time
//! - [`ProjectionError`]: everything else that can go wrong on the read side
//!
//! ```text
//! Write Side:                  Read Side:
//! ┌─────────────────┐         ┌─────────────────────┐
//! │  Event Store    │ ──────▶ │  Stream → Cache     │
//! │  (append-only)  │  read/  │  (rebuilt on start) │
//! └─────────────────┘  push   └─────────────────────┘
//! ```

use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Structural misconfiguration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Structural misconfiguration of a projection.
///
/// These are fatal and surface from builders when the projection is
/// constructed, never on first event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// The DTO type declares no primary key.
    #[error("DTO type {dto} declares no primary key")]
    MissingPrimaryKey {
        /// The DTO type name.
        dto: String,
    },

    /// The DTO type declares more than one primary key.
    #[error("DTO type {dto} declares more than one primary key: {first} and {second}")]
    DuplicatePrimaryKey {
        /// The DTO type name.
        dto: String,
        /// The first declared key.
        first: String,
        /// The conflicting key.
        second: String,
    },

    /// More than one creation event was declared.
    #[error("DTO type {dto} declares more than one creation event: {first} and {second}")]
    DuplicateCreationEvent {
        /// The DTO type name.
        dto: String,
        /// The first declared creation event.
        first: String,
        /// The conflicting creation event.
        second: String,
    },

    /// Two foreign keys share a name.
    #[error("DTO type {dto} declares foreign key {name} twice")]
    DuplicateForeignKey {
        /// The DTO type name.
        dto: String,
        /// The foreign key name.
        name: String,
    },

    /// Two handlers were registered for one event type.
    #[error("DTO type {dto} registers two handlers for {event_type}")]
    DuplicateHandler {
        /// The DTO type name.
        dto: String,
        /// The event type tag.
        event_type: String,
    },

    /// A stream accepts an event type the DTO has no handler for.
    #[error("Stream {stream} accepts {event_type} but no handler is registered for it")]
    MissingHandler {
        /// The event type tag.
        event_type: String,
        /// The stream accepting it.
        stream: String,
    },

    /// The creation event has no handler.
    #[error("Creation event {event_type} has no handler")]
    UnhandledCreationEvent {
        /// The event type tag.
        event_type: String,
    },

    /// `StartFromPosition` without a checkpoint provider.
    #[error("Stream {stream} starts from a checkpoint but has no checkpoint provider")]
    MissingCheckpointProvider {
        /// The stream name.
        stream: String,
    },

    /// A stream was described without a name.
    #[error("Stream name cannot be empty")]
    EmptyStreamName,

    /// Page size outside `1..=max`.
    #[error("Page size {size} is outside 1..={max}")]
    InvalidPageSize {
        /// The requested size.
        size: usize,
        /// The largest allowed size.
        max: usize,
    },

    /// A projection was built without streams.
    #[error("Projection {projection} has no streams")]
    NoStreams {
        /// The projection name.
        projection: String,
    },

    /// Two streams of one projection read the same physical stream.
    #[error("Projection {projection} reads stream {stream} twice")]
    DuplicateStream {
        /// The projection name.
        projection: String,
        /// The stream name.
        stream: String,
    },
}

/// Receives the messages a stream decodes.
///
/// Streams call `handle` sequentially, in stream order. Different streams may
/// call the same handler concurrently, so implementations must be internally
/// synchronized.
pub trait EventHandler<M>: Send + Sync {
    /// Handle one decoded message.
    fn handle(&self, message: M);
}

/// Checkpoint tracking for stream progress.
///
/// A checkpoint provider supplies the position a stream resumes from under
/// [`StartStrategy::StartFromPosition`](crate::stream::StartStrategy), and
/// receives progress saves while the stream runs.
///
/// # Example
///
/// ```ignore
/// let checkpoint = PostgresProjectionCheckpoint::new(pool);
///
/// checkpoint.save_position("accounts/$ce-Account", EventPosition::new(1000, Utc::now())).await?;
/// let last = checkpoint.load_position("accounts/$ce-Account").await?;
/// ```
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns let descriptors hold providers as
/// `Arc<dyn ProjectionCheckpoint>`.
pub trait ProjectionCheckpoint: Send + Sync {
    /// Save the current position under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if save fails.
    fn save_position(
        &self,
        name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load the last saved position under `name`.
    ///
    /// Returns `None` if nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if load fails.
    fn load_position(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventPosition>>> + Send + '_>>;
}

/// A saved stream position.
///
/// `offset` is the next position to read in the stream, matching
/// [`Position`](crate::stream::Position) semantics.
///
/// # Example
///
/// ```
/// use eventview_core::projection::EventPosition;
/// use chrono::Utc;
///
/// let position = EventPosition::new(1000, Utc::now());
/// assert_eq!(position.offset, 1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    /// Next position to read in the stream
    pub offset: u64,

    /// Timestamp when this position was reached
    pub timestamp: DateTime<Utc>,
}

impl EventPosition {
    /// Create a new event position.
    #[must_use]
    pub const fn new(offset: u64, timestamp: DateTime<Utc>) -> Self {
        Self { offset, timestamp }
    }

    /// Create a position at the beginning of the stream.
    ///
    /// ```
    /// use eventview_core::projection::EventPosition;
    ///
    /// assert_eq!(EventPosition::beginning().offset, 0);
    /// ```
    #[must_use]
    pub fn beginning() -> Self {
        Self {
            offset: 0,
            timestamp: Utc::now(),
        }
    }
}
