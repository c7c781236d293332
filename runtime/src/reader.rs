//! Paged stream reading.
//!
//! [`PagedStreamReader`] reads one stream in pages of at most
//! [`MAX_PAGE_SIZE`] records, decodes each record into the projection's
//! message type and hands it to an [`EventHandler`]. It owns the stream's
//! [`StreamPosition`], the next position to read, which never moves
//! backwards.
//!
//! Per-record problems never fail a read:
//!
//! | Record | Outcome |
//! |--------|---------|
//! | Type not accepted by the descriptor | consumed, not decoded |
//! | Payload fails to decode | logged at `warn`, consumed |
//! | Position below the stream position (redelivery) | ignored |
//!
//! Store failures are surfaced as [`ReaderError::Store`] with nothing applied
//! from the failed page.

use crate::metrics::{ReaderMetrics, SkipReason};
use eventview_core::event::{Event, RecordedEvent};
use eventview_core::event_store::{EventStore, EventStoreError, ReadSlice};
use eventview_core::projection::{
    ConfigurationError, EventHandler, EventPosition, ProjectionError,
};
use eventview_core::stream::{Position, ReadDirection, StreamDescriptor, StreamId};
use eventview_core::Utc;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Largest page requested from the store.
pub const MAX_PAGE_SIZE: usize = 500;

/// Default number of handled records between checkpoint saves.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 100;

/// Errors from reading a stream.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// The store failed to serve a page.
    #[error("Event store error: {0}")]
    Store(#[from] EventStoreError),

    /// A point read asked for a version that cannot exist.
    #[error("Target version must be positive, got {0}")]
    InvalidTargetVersion(i64),

    /// Loading or saving a checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] ProjectionError),
}

/// Reader configuration.
///
/// # Default Values
///
/// - `page_size`: [`MAX_PAGE_SIZE`]
/// - `checkpoint_interval`: [`DEFAULT_CHECKPOINT_INTERVAL`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Records requested per page, `1..=MAX_PAGE_SIZE`
    pub page_size: usize,
    /// Handled records between checkpoint saves
    pub checkpoint_interval: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderConfig {
    /// Configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    /// Set the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the checkpoint interval (`0` saves only on demand).
    #[must_use]
    pub const fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Check the page size bound.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPageSize`] if `page_size` is 0 or
    /// above [`MAX_PAGE_SIZE`].
    pub const fn validate(&self) -> Result<(), ConfigurationError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigurationError::InvalidPageSize {
                size: self.page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        Ok(())
    }
}

/// The next position to read in one stream.
///
/// Monotonically non-decreasing: [`StreamPosition::advance_to`] ignores
/// positions below the current one.
#[derive(Debug, Default)]
pub struct StreamPosition(AtomicU64);

impl StreamPosition {
    /// Start at `position`.
    #[must_use]
    pub const fn new(position: Position) -> Self {
        Self(AtomicU64::new(position.value()))
    }

    /// Current position.
    #[must_use]
    pub fn get(&self) -> Position {
        Position::new(self.0.load(Ordering::Acquire))
    }

    /// Move to `position` if it is ahead; returns the resulting position.
    pub fn advance_to(&self, position: Position) -> Position {
        let previous = self.0.fetch_max(position.value(), Ordering::AcqRel);
        Position::new(previous.max(position.value()))
    }
}

/// Reads one stream page by page into an [`EventHandler`].
///
/// # Type Parameters
///
/// - `M`: the projection's message type, decoded from each accepted record
///
/// # Example
///
/// ```ignore
/// let reader = PagedStreamReader::new(store, descriptor, handler, ReaderConfig::default())?;
///
/// // Replay everything, then pick up new records on demand
/// reader.read(Position::START, usize::MAX).await?;
/// reader.catch_up(1_000).await?;
/// ```
pub struct PagedStreamReader<M> {
    store: Arc<dyn EventStore>,
    descriptor: StreamDescriptor,
    handler: Arc<dyn EventHandler<M>>,
    config: ReaderConfig,
    position: StreamPosition,
    checkpoint_name: String,
    since_checkpoint: AtomicU64,
    _message: PhantomData<fn() -> M>,
}

impl<M> PagedStreamReader<M>
where
    M: Event + DeserializeOwned,
{
    /// Create a reader positioned at the start of the stream.
    ///
    /// Progress is checkpointed under the physical stream name; see
    /// [`PagedStreamReader::with_checkpoint_name`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPageSize`] for an out-of-range page size.
    pub fn new(
        store: Arc<dyn EventStore>,
        descriptor: StreamDescriptor,
        handler: Arc<dyn EventHandler<M>>,
        config: ReaderConfig,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let checkpoint_name = descriptor.stream_id().to_string();
        Ok(Self {
            store,
            descriptor,
            handler,
            config,
            position: StreamPosition::new(Position::START),
            checkpoint_name,
            since_checkpoint: AtomicU64::new(0),
            _message: PhantomData,
        })
    }

    /// Name under which progress is saved to and loaded from the checkpoint provider.
    #[must_use]
    pub fn with_checkpoint_name(mut self, name: impl Into<String>) -> Self {
        self.checkpoint_name = name.into();
        self
    }

    /// The descriptor this reader was built from.
    #[must_use]
    pub const fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// The physical stream being read.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        self.descriptor.stream_id()
    }

    /// The store being read.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The checkpoint name.
    #[must_use]
    pub fn checkpoint_name(&self) -> &str {
        &self.checkpoint_name
    }

    /// The next position to read.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position.get()
    }

    /// Move the stream position forward without reading.
    pub fn advance_to(&self, position: Position) -> Position {
        self.position.advance_to(position)
    }

    /// Hand one record to the handler, skipping redeliveries.
    ///
    /// Returns whether the handler was invoked.
    pub async fn deliver(&self, record: RecordedEvent) -> bool {
        self.apply(record, true).await
    }

    /// Read up to `max_count` records from `start` in the configured direction.
    ///
    /// Returns whether any record was read. A stream that does not exist reads
    /// as `false` and leaves the position untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Store`] if a page read fails.
    pub async fn read(&self, start: Position, max_count: usize) -> Result<bool, ReaderError> {
        self.read_pages(start, max_count, self.descriptor.direction())
            .await
    }

    /// Read forward up to `max_count` records from the current position.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Store`] if a page read fails.
    pub async fn catch_up(&self, max_count: usize) -> Result<bool, ReaderError> {
        self.read_pages(self.position(), max_count, ReadDirection::Forward)
            .await
    }

    /// Read forward until the stream position reaches `target_version` or the
    /// stream ends.
    ///
    /// # Errors
    ///
    /// - [`ReaderError::InvalidTargetVersion`] if `target_version <= 0`
    /// - [`ReaderError::Store`] if a page read fails
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub async fn read_to_version(&self, target_version: i64) -> Result<bool, ReaderError> {
        if target_version <= 0 {
            return Err(ReaderError::InvalidTargetVersion(target_version));
        }
        let target = target_version as u64;

        let mut next = self.position();
        let mut had_any = false;
        while target > next.value() {
            let count = (target - next.value()).min(self.config.page_size as u64) as usize;
            let slice = self.fetch(next, count, ReadDirection::Forward).await?;
            if !slice.stream_exists {
                return Ok(false);
            }
            let empty = slice.events.is_empty();
            for record in slice.events {
                had_any |= self.apply(record, true).await;
            }
            next = slice.next_position;
            if slice.end_of_stream || empty {
                break;
            }
        }
        Ok(had_any)
    }

    /// The position after the stream's last record, found with a single
    /// one-record backward read.
    ///
    /// `None` if the stream does not exist, [`Position::START`] if it is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Store`] if the read fails.
    pub async fn tail_position(&self) -> Result<Option<Position>, ReaderError> {
        let slice = self.fetch(Position::END, 1, ReadDirection::Backward).await?;
        if !slice.stream_exists {
            return Ok(None);
        }
        Ok(Some(
            slice
                .events
                .first()
                .map_or(Position::START, |record| record.position.next()),
        ))
    }

    /// Load this stream's saved position from its checkpoint provider.
    ///
    /// `None` if there is no provider or nothing was saved.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Checkpoint`] if the provider fails.
    pub async fn load_checkpoint(&self) -> Result<Option<Position>, ReaderError> {
        let Some(provider) = self.descriptor.checkpoint() else {
            return Ok(None);
        };
        let saved = provider
            .load_position(&self.checkpoint_name)
            .await
            .map_err(|e| {
                ReaderMetrics::record_checkpoint_error();
                ReaderError::Checkpoint(e)
            })?;
        Ok(saved.map(|position| Position::new(position.offset)))
    }

    /// Save the current position to the checkpoint provider, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Checkpoint`] if the provider fails.
    pub async fn save_checkpoint(&self) -> Result<(), ReaderError> {
        let Some(provider) = self.descriptor.checkpoint() else {
            return Ok(());
        };
        let position = self.position();
        provider
            .save_position(
                &self.checkpoint_name,
                EventPosition::new(position.value(), Utc::now()),
            )
            .await
            .map_err(|e| {
                ReaderMetrics::record_checkpoint_error();
                ReaderError::Checkpoint(e)
            })?;
        self.since_checkpoint.store(0, Ordering::Release);
        ReaderMetrics::record_checkpoint_save();
        tracing::debug!(
            stream = %self.stream_id(),
            checkpoint = %self.checkpoint_name,
            position = %position,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn read_pages(
        &self,
        start: Position,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<bool, ReaderError> {
        // Records of a backward read arrive newest first, so the duplicate
        // check would drop everything after the first one.
        let skip_duplicates = direction == ReadDirection::Forward;

        let mut next = start;
        let mut remaining = max_count;
        let mut had_any = false;
        while remaining > 0 {
            let count = remaining.min(self.config.page_size);
            let slice = self.fetch(next, count, direction).await?;
            if !slice.stream_exists {
                return Ok(false);
            }

            let read = slice.events.len();
            remaining = remaining.saturating_sub(read);
            had_any |= read > 0;
            for record in slice.events {
                self.apply(record, skip_duplicates).await;
            }

            if slice.end_of_stream || read == 0 {
                break;
            }
            next = slice.next_position;
        }
        Ok(had_any)
    }

    async fn fetch(
        &self,
        start: Position,
        count: usize,
        direction: ReadDirection,
    ) -> Result<ReadSlice, ReaderError> {
        let started = Instant::now();
        let slice = self
            .store
            .read_stream(self.stream_id().clone(), start, count, direction)
            .await
            .map_err(|e| {
                tracing::error!(
                    stream = %self.stream_id(),
                    position = %start,
                    error = %e,
                    "Failed to read page"
                );
                ReaderError::Store(e)
            })?;
        ReaderMetrics::record_page(self.stream_id().as_str(), slice.events.len(), started.elapsed());
        Ok(slice)
    }

    async fn apply(&self, record: RecordedEvent, skip_duplicates: bool) -> bool {
        let stream = self.stream_id().as_str();

        if skip_duplicates && record.position < self.position() {
            tracing::debug!(
                stream,
                position = %record.position,
                current = %self.position(),
                "Skipping redelivered record"
            );
            ReaderMetrics::record_skip(stream, SkipReason::Duplicate);
            return false;
        }

        let next = record.position.next();
        if !self.descriptor.accepts(record.event_type()) {
            ReaderMetrics::record_skip(stream, SkipReason::Filtered);
            self.position.advance_to(next);
            return false;
        }

        let message = match record.decode::<M>() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    stream,
                    position = %record.position,
                    event_type = record.event_type(),
                    error = %e,
                    "Skipping record that failed to deserialize"
                );
                ReaderMetrics::record_skip(stream, SkipReason::Decode);
                self.position.advance_to(next);
                return false;
            }
        };

        self.handler.handle(message);
        self.position.advance_to(next);
        self.maybe_checkpoint().await;
        true
    }

    async fn maybe_checkpoint(&self) {
        let interval = self.config.checkpoint_interval;
        if interval == 0 || self.descriptor.checkpoint().is_none() {
            return;
        }
        let handled = self.since_checkpoint.fetch_add(1, Ordering::AcqRel) + 1;
        if handled >= interval {
            if let Err(e) = self.save_checkpoint().await {
                tracing::warn!(
                    stream = %self.stream_id(),
                    error = %e,
                    "Failed to save checkpoint, continuing"
                );
            }
        }
    }
}

impl<M> std::fmt::Debug for PagedStreamReader<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedStreamReader")
            .field("stream_id", self.descriptor.stream_id())
            .field("position", &self.position.get())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
