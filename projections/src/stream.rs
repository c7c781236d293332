//! The unit of consumption bound to a projection.
//!
//! A [`Stream`] owns a [`PagedStreamReader`] over one physical stream and
//! feeds its handler, usually a [`ProjectionCache`](crate::cache::ProjectionCache).
//! How records reach the handler depends on the descriptor:
//!
//! - **Live** streams run a [`SubscriptionController`] after
//!   [`Stream::subscribe`]: history per the start strategy, then push delivery
//! - **Pull** streams are read on demand with [`Stream::catch_up`], a bounded
//!   read from the last known position
//!
//! # Example
//!
//! ```ignore
//! let stream = Stream::new(
//!     store,
//!     descriptor,
//!     cache,
//!     StreamConfig::default(),
//!     "accounts/$ce-Account",
//! )?;
//!
//! if stream.is_live() {
//!     stream.subscribe();
//! } else {
//!     stream.catch_up().await?;
//! }
//! ```

use eventview_core::event::{Event, RecordedEvent};
use eventview_core::event_store::EventStore;
use eventview_core::projection::{ConfigurationError, EventHandler};
use eventview_core::stream::{Position, StreamDescriptor, StreamId};
use eventview_runtime::reader::{PagedStreamReader, ReaderConfig, ReaderError};
use eventview_runtime::retry::PollPolicy;
use eventview_runtime::start_position::StartPositionResolver;
use eventview_runtime::subscription::{
    SubscriptionController, SubscriptionError, SubscriptionHandle, SubscriptionState,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

/// Records read by one [`Stream::catch_up`] call.
pub const DEFAULT_CATCH_UP_LIMIT: usize = 10_000;

/// Configuration of a [`Stream`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Paging and checkpointing
    pub reader: ReaderConfig,
    /// Backoff while a live stream does not exist or fails to subscribe
    pub poll: PollPolicy,
    /// Records read by one catch-up
    pub catch_up_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            poll: PollPolicy::default(),
            catch_up_limit: DEFAULT_CATCH_UP_LIMIT,
        }
    }
}

impl StreamConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reader configuration.
    #[must_use]
    pub const fn with_reader(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    /// Set the polling policy.
    #[must_use]
    pub const fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Set how many records one catch-up reads at most.
    #[must_use]
    pub const fn with_catch_up_limit(mut self, limit: usize) -> Self {
        self.catch_up_limit = limit;
        self
    }

    /// Save the checkpoint every `interval` handled records (0 disables).
    #[must_use]
    pub const fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.reader = self.reader.with_checkpoint_interval(interval);
        self
    }
}

/// One stream feeding a projection.
pub struct Stream<M> {
    reader: Arc<PagedStreamReader<M>>,
    config: StreamConfig,
    subscription: Mutex<Option<SubscriptionHandle>>,
    /// Held for the length of a catch-up; `true` once the start is resolved.
    pull: AsyncMutex<bool>,
}

impl<M> Stream<M>
where
    M: Event + DeserializeOwned,
{
    /// Create a stream reading `descriptor` into `handler`.
    ///
    /// Progress is saved to and loaded from the descriptor's checkpoint
    /// provider under `checkpoint_name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPageSize`] for an out-of-range page size.
    pub fn new(
        store: Arc<dyn EventStore>,
        descriptor: StreamDescriptor,
        handler: Arc<dyn EventHandler<M>>,
        config: StreamConfig,
        checkpoint_name: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let reader = PagedStreamReader::new(store, descriptor, handler, config.reader)?
            .with_checkpoint_name(checkpoint_name);
        Ok(Self {
            reader: Arc::new(reader),
            config,
            subscription: Mutex::new(None),
            pull: AsyncMutex::new(false),
        })
    }

    /// The stream's descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &StreamDescriptor {
        self.reader.descriptor()
    }

    /// The physical stream.
    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        self.reader.stream_id()
    }

    /// Whether records are pushed through a subscription.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.reader.descriptor().is_live()
    }

    /// The next position to read.
    #[must_use]
    pub fn position(&self) -> Position {
        self.reader.position()
    }

    /// The checkpoint name.
    #[must_use]
    pub fn checkpoint_name(&self) -> &str {
        self.reader.checkpoint_name()
    }

    /// Start the subscription controller.
    ///
    /// Returns `false` for pull streams and when already subscribed.
    pub fn subscribe(&self) -> bool {
        if !self.is_live() {
            return false;
        }
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            return false;
        }
        let controller =
            SubscriptionController::new(Arc::clone(&self.reader), self.config.poll.clone());
        *subscription = Some(controller.spawn());
        tracing::info!(stream = %self.stream_id(), "Subscribed");
        true
    }

    /// Subscription state, `None` for pull streams and before [`Stream::subscribe`].
    #[must_use]
    pub fn subscription_state(&self) -> Option<SubscriptionState> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(SubscriptionHandle::state)
    }

    /// Wait until the subscription reaches `target`.
    ///
    /// Returns `false` for pull streams, before [`Stream::subscribe`], and if
    /// the subscription stopped first.
    pub async fn wait_for(&self, target: SubscriptionState) -> bool {
        let state = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(SubscriptionHandle::watch_state);
        let Some(mut state) = state else {
            return false;
        };
        match state
            .wait_for(|current| *current == target || *current == SubscriptionState::Stopped)
            .await
        {
            Ok(reached) => *reached == target,
            Err(_) => target == SubscriptionState::Stopped,
        }
    }

    /// Pull new records: a bounded read from the last known position.
    ///
    /// The first call resolves the start position per the descriptor's
    /// strategy; while the stream does not exist that keeps returning
    /// `false`. Concurrent calls run one after another.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError`] if the store or checkpoint provider fails.
    pub async fn catch_up(&self) -> Result<bool, ReaderError> {
        let mut resolved = self.pull.lock().await;
        let mut had_any = false;
        if !*resolved {
            let before = self.reader.position();
            let start = StartPositionResolver::new().resolve(&self.reader).await?;
            if !start.is_complete() {
                return Ok(false);
            }
            *resolved = true;
            had_any = self.reader.position() > before;
        }
        let read = self.reader.catch_up(self.config.catch_up_limit).await?;
        Ok(had_any || read)
    }

    /// Hand one record to the handler.
    ///
    /// Redelivered records (below the current position) are skipped. Returns
    /// whether the handler was invoked.
    pub async fn handle(&self, record: RecordedEvent) -> bool {
        self.reader.deliver(record).await
    }

    /// Save the current position to the checkpoint provider, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Checkpoint`] if the provider fails.
    pub async fn save_checkpoint(&self) -> Result<(), ReaderError> {
        self.reader.save_checkpoint().await
    }

    /// Stop the subscription, if any, and save the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the subscription, or a checkpoint error.
    pub async fn stop(&self) -> Result<(), SubscriptionError> {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let stopped = match subscription {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        };
        self.save_checkpoint().await?;
        stopped
    }
}

impl<M> fmt::Debug for Stream<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("reader", &self.reader)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use eventview_core::event::SerializedEvent;
    use eventview_core::stream::{StartStrategy, StreamKind};
    use eventview_testing::fixtures::{ACCOUNT_CATEGORY, BankEvent, account_created, funds_added};
    use eventview_testing::{InMemoryEventStore, InMemoryProjectionCheckpoint};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl EventHandler<BankEvent> for Counter {
        fn handle(&self, _message: BankEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Counter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn stream(
        store: &InMemoryEventStore,
        descriptor: StreamDescriptor,
        config: StreamConfig,
    ) -> (Stream<BankEvent>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let stream = Stream::new(
            Arc::new(store.clone()),
            descriptor,
            Arc::clone(&counter) as Arc<dyn EventHandler<BankEvent>>,
            config,
            "accounts/$ce-Account",
        )
        .unwrap();
        (stream, counter)
    }

    fn accounts(live: bool) -> StreamDescriptor {
        StreamDescriptor::builder(StreamKind::Category, ACCOUNT_CATEGORY)
            .live(live)
            .build()
            .unwrap()
    }

    async fn deposit(store: &InMemoryEventStore, account: Uuid, count: usize) {
        let events: Vec<_> = (0..count).map(|_| funds_added(account, 1)).collect();
        store
            .append_messages(events[0].stream_id(), &events)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn catch_up_reads_only_what_is_new() {
        let store = InMemoryEventStore::new();
        let account = Uuid::new_v4();
        deposit(&store, account, 3).await;
        let (stream, counter) = stream(&store, accounts(false), StreamConfig::default());

        assert!(stream.catch_up().await.unwrap());
        assert_eq!(counter.count(), 3);

        assert!(!stream.catch_up().await.unwrap());
        deposit(&store, account, 2).await;
        assert!(stream.catch_up().await.unwrap());

        assert_eq!(counter.count(), 5);
        assert_eq!(stream.position(), Position::new(5));
    }

    #[tokio::test]
    async fn catch_up_is_bounded() {
        let store = InMemoryEventStore::new();
        deposit(&store, Uuid::new_v4(), 1).await;
        let config = StreamConfig::new().with_catch_up_limit(4);
        let (stream, counter) = stream(
            &store,
            StreamDescriptor::builder(StreamKind::Category, ACCOUNT_CATEGORY)
                .start_strategy(StartStrategy::StartEndOnly)
                .build()
                .unwrap(),
            config,
        );
        stream.catch_up().await.unwrap();
        deposit(&store, Uuid::new_v4(), 10).await;

        stream.catch_up().await.unwrap();
        assert_eq!(counter.count(), 4);
        stream.catch_up().await.unwrap();
        assert_eq!(counter.count(), 8);
    }

    #[tokio::test]
    async fn catch_up_waits_for_a_missing_stream() {
        let store = InMemoryEventStore::new();
        let (stream, counter) = stream(&store, accounts(false), StreamConfig::default());

        assert!(!stream.catch_up().await.unwrap());

        deposit(&store, Uuid::new_v4(), 2).await;
        assert!(stream.catch_up().await.unwrap());
        assert_eq!(counter.count(), 2);
    }

    #[tokio::test]
    async fn handle_skips_redelivered_records() {
        let store = InMemoryEventStore::new();
        deposit(&store, Uuid::new_v4(), 2).await;
        let (stream, counter) = stream(&store, accounts(false), StreamConfig::default());
        stream.catch_up().await.unwrap();

        let event = account_created(Uuid::new_v4(), "x", None);
        let record = RecordedEvent::new(
            stream.stream_id().clone(),
            Position::new(1),
            SerializedEvent::from_event(&event, None).unwrap(),
            chrono::Utc::now(),
        );
        assert!(!stream.handle(record.clone()).await);

        let fresh = RecordedEvent {
            position: Position::new(2),
            ..record
        };
        assert!(stream.handle(fresh).await);
        assert_eq!(counter.count(), 3);
    }

    #[tokio::test]
    async fn pull_streams_do_not_subscribe() {
        let store = InMemoryEventStore::new();
        let (stream, _) = stream(&store, accounts(false), StreamConfig::default());

        assert!(!stream.subscribe());
        assert_eq!(stream.subscription_state(), None);
        assert!(!stream.wait_for(SubscriptionState::Live).await);
    }

    #[tokio::test]
    async fn live_stream_subscribes_once_and_stops() {
        let store = InMemoryEventStore::new();
        let account = Uuid::new_v4();
        deposit(&store, account, 1).await;
        let checkpoint = InMemoryProjectionCheckpoint::new();
        let descriptor = StreamDescriptor::builder(StreamKind::Category, ACCOUNT_CATEGORY)
            .live(true)
            .checkpoint(Arc::new(checkpoint.clone()))
            .build()
            .unwrap();
        let (stream, counter) = stream(&store, descriptor, StreamConfig::default());

        assert!(stream.subscribe());
        assert!(!stream.subscribe());
        assert!(stream.wait_for(SubscriptionState::Live).await);

        deposit(&store, account, 1).await;
        for _ in 0..200 {
            if counter.count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.count(), 2);

        stream.stop().await.unwrap();
        assert_eq!(checkpoint.offset("accounts/$ce-Account"), Some(2));
        assert_eq!(stream.subscription_state(), None);
    }
}
