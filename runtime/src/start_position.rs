//! Start-position resolution.
//!
//! Decides where a stream starts being consumed, per its
//! [`StartStrategy`]:
//!
//! | Strategy | History | Resolved position |
//! |----------|---------|-------------------|
//! | `ReadAllStartEnd` | replayed into the handler | end of the replay |
//! | `StartEndOnly` | skipped | current tail |
//! | `StartFromPosition` | skipped | the checkpoint provider's offset |
//!
//! A stream that does not exist yet resolves as incomplete under
//! `ReadAllStartEnd` and `StartFromPosition`; the subscription controller then
//! polls until it appears.

use crate::reader::{PagedStreamReader, ReaderError};
use crate::retry::{PollPolicy, retry_with_backoff};
use eventview_core::event::Event;
use eventview_core::stream::{NameAndPosition, Position, ReadDirection, StartStrategy};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Resolves the [`NameAndPosition`] a stream starts from.
#[derive(Debug, Clone)]
pub struct StartPositionResolver {
    checkpoint_retry: PollPolicy,
}

impl Default for StartPositionResolver {
    fn default() -> Self {
        Self {
            checkpoint_retry: PollPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(1))
                .build(),
        }
    }
}

impl StartPositionResolver {
    /// Resolver retrying checkpoint loads three times.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy for checkpoint loads.
    #[must_use]
    pub const fn with_checkpoint_retry(mut self, policy: PollPolicy) -> Self {
        self.checkpoint_retry = policy;
        self
    }

    /// Resolve the start of `reader`'s stream and move the reader there.
    ///
    /// Under `ReadAllStartEnd` this replays the stream's history into the
    /// reader's handler.
    ///
    /// # Errors
    ///
    /// - [`ReaderError::Store`] if the store fails
    /// - [`ReaderError::Checkpoint`] if the checkpoint provider keeps failing
    pub async fn resolve<M>(
        &self,
        reader: &PagedStreamReader<M>,
    ) -> Result<NameAndPosition, ReaderError>
    where
        M: Event + DeserializeOwned,
    {
        let stream_id = reader.stream_id().clone();
        let strategy = reader.descriptor().start_strategy();

        let resolved = match strategy {
            StartStrategy::ReadAllStartEnd => {
                if !reader.store().stream_exists(stream_id.clone()).await? {
                    return Ok(Self::incomplete(reader));
                }
                let origin = match reader.descriptor().direction() {
                    ReadDirection::Forward => Position::START,
                    ReadDirection::Backward => Position::END,
                };
                reader.read(origin, usize::MAX).await?;
                NameAndPosition::complete(stream_id, reader.position())
            }
            StartStrategy::StartEndOnly => {
                let tail = reader.tail_position().await?.unwrap_or(Position::START);
                NameAndPosition::complete(stream_id, reader.advance_to(tail))
            }
            StartStrategy::StartFromPosition => {
                if !reader.store().stream_exists(stream_id.clone()).await? {
                    return Ok(Self::incomplete(reader));
                }
                let saved =
                    retry_with_backoff(&self.checkpoint_retry, || reader.load_checkpoint()).await?;
                let position = match saved {
                    Some(position) => position,
                    None => {
                        tracing::info!(
                            stream = %stream_id,
                            checkpoint = reader.checkpoint_name(),
                            "No checkpoint saved, starting from the tail"
                        );
                        reader.tail_position().await?.unwrap_or(Position::START)
                    }
                };
                NameAndPosition::complete(stream_id, reader.advance_to(position))
            }
        };

        tracing::info!(
            stream = %resolved.stream_id(),
            strategy = ?strategy,
            position = ?resolved.position(),
            "Resolved start position"
        );
        Ok(resolved)
    }

    fn incomplete<M>(reader: &PagedStreamReader<M>) -> NameAndPosition
    where
        M: Event + DeserializeOwned,
    {
        tracing::info!(
            stream = %reader.stream_id(),
            "Stream does not exist yet, start position unresolved"
        );
        NameAndPosition::incomplete(reader.stream_id().clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::reader::ReaderConfig;
    use eventview_core::projection::EventHandler;
    use eventview_core::stream::{StreamDescriptor, StreamKind};
    use eventview_testing::fixtures::{BankEvent, account_created, funds_added};
    use eventview_testing::{InMemoryEventStore, InMemoryProjectionCheckpoint};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl EventHandler<BankEvent> for Counter {
        fn handle(&self, _message: BankEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn seed(store: &InMemoryEventStore, deposits: usize) {
        let account = Uuid::new_v4();
        let mut events = vec![account_created(account, "x", None)];
        events.extend((0..deposits).map(|_| funds_added(account, 1)));
        store.append_messages(events[0].stream_id(), &events).await.unwrap();
    }

    fn reader_for(
        store: &InMemoryEventStore,
        descriptor: StreamDescriptor,
    ) -> (PagedStreamReader<BankEvent>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let reader = PagedStreamReader::new(
            Arc::new(store.clone()),
            descriptor,
            Arc::clone(&counter) as Arc<dyn EventHandler<BankEvent>>,
            ReaderConfig::new().with_page_size(2),
        )
        .expect("reader should build");
        (reader, counter)
    }

    fn descriptor(strategy: StartStrategy) -> StreamDescriptor {
        StreamDescriptor::builder(StreamKind::Category, "Account")
            .start_strategy(strategy)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn read_all_replays_to_the_true_end() {
        let store = InMemoryEventStore::new();
        seed(&store, 4).await;
        let (reader, counter) = reader_for(&store, descriptor(StartStrategy::ReadAllStartEnd));

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();

        assert!(resolved.is_complete());
        assert_eq!(resolved.position(), Some(Position::new(5)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn read_all_backward_ends_at_the_tail() {
        let store = InMemoryEventStore::new();
        seed(&store, 2).await;
        let backward = StreamDescriptor::builder(StreamKind::Category, "Account")
            .direction(ReadDirection::Backward)
            .build()
            .unwrap();
        let (reader, counter) = reader_for(&store, backward);

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();

        assert_eq!(resolved.position(), Some(Position::new(3)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn read_all_on_missing_stream_is_incomplete() {
        let store = InMemoryEventStore::new();
        let (reader, counter) = reader_for(&store, descriptor(StartStrategy::ReadAllStartEnd));

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();

        assert!(!resolved.is_complete());
        assert_eq!(resolved.position(), None);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn end_only_skips_history() {
        let store = InMemoryEventStore::new();
        seed(&store, 6).await;
        let (reader, counter) = reader_for(&store, descriptor(StartStrategy::StartEndOnly));

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();

        assert_eq!(resolved.position(), Some(Position::new(7)));
        assert_eq!(reader.position(), Position::new(7));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn end_only_on_missing_stream_starts_at_zero() {
        let store = InMemoryEventStore::new();
        let (reader, _) = reader_for(&store, descriptor(StartStrategy::StartEndOnly));

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();
        assert_eq!(resolved.position(), Some(Position::START));
    }

    #[tokio::test]
    async fn from_position_uses_the_checkpoint_exactly() {
        let store = InMemoryEventStore::new();
        seed(&store, 9).await;
        let checkpoint = InMemoryProjectionCheckpoint::with_position("$ce-Account", 4);
        let descriptor = StreamDescriptor::builder(StreamKind::Category, "Account")
            .start_strategy(StartStrategy::StartFromPosition)
            .checkpoint(Arc::new(checkpoint))
            .build()
            .unwrap();
        let (reader, counter) = reader_for(&store, descriptor);

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();

        assert_eq!(resolved.position(), Some(Position::new(4)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        reader.catch_up(usize::MAX).await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn from_position_without_saved_checkpoint_starts_at_tail() {
        let store = InMemoryEventStore::new();
        seed(&store, 2).await;
        let descriptor = StreamDescriptor::builder(StreamKind::Category, "Account")
            .start_strategy(StartStrategy::StartFromPosition)
            .checkpoint(Arc::new(InMemoryProjectionCheckpoint::new()))
            .build()
            .unwrap();
        let (reader, counter) = reader_for(&store, descriptor);

        let resolved = StartPositionResolver::new().resolve(&reader).await.unwrap();

        assert_eq!(resolved.position(), Some(Position::new(3)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn from_position_gives_up_on_a_failing_provider() {
        let store = InMemoryEventStore::new();
        seed(&store, 1).await;
        let checkpoint = InMemoryProjectionCheckpoint::new();
        checkpoint.set_failing(true);
        let descriptor = StreamDescriptor::builder(StreamKind::Category, "Account")
            .start_strategy(StartStrategy::StartFromPosition)
            .checkpoint(Arc::new(checkpoint))
            .build()
            .unwrap();
        let (reader, _) = reader_for(&store, descriptor);

        let resolver = StartPositionResolver::new().with_checkpoint_retry(
            PollPolicy::builder()
                .max_attempts(1)
                .initial_delay(Duration::from_millis(1))
                .build(),
        );
        assert!(matches!(
            resolver.resolve(&reader).await,
            Err(ReaderError::Checkpoint(_))
        ));
    }
}
