//! Subscription controller: from historical catch-up to live delivery.
//!
//! Each live stream runs one controller task through these states:
//!
//! ```text
//!              incomplete                 stream exists
//! Resolving ─────────────▶ Polling ──────────────────────▶ Resolving
//!     │ complete                ▲ StreamNotFound
//!     ▼                         │
//! Subscribing ──────────────────┘
//!     │ subscribed
//!     ▼
//!   Live ── subscription ends ──▶ Subscribing (from the current position)
//! ```
//!
//! Any state moves to `Stopped` on shutdown. Waits between attempts follow a
//! [`PollPolicy`] and are cut short by shutdown. With a bounded policy, a
//! stream that never appears ends the task with
//! [`SubscriptionError::StreamNeverAppeared`].
//!
//! Records are delivered one at a time, in stream order, through
//! [`PagedStreamReader::deliver`], which also drops redeliveries at the seam
//! between catch-up and live.

use crate::metrics::SubscriptionMetrics;
use crate::reader::{PagedStreamReader, ReaderError};
use crate::retry::PollPolicy;
use crate::start_position::StartPositionResolver;
use eventview_core::event::Event;
use eventview_core::event_store::{EventStoreError, RecordStream};
use eventview_core::stream::StreamId;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Where a subscription controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Deciding the start position (may replay history).
    Resolving,
    /// Opening the push subscription.
    Subscribing,
    /// Waiting for the stream to exist.
    Polling,
    /// Delivering pushed records.
    Live,
    /// Shut down or failed.
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::Subscribing => "subscribing",
            Self::Polling => "polling",
            Self::Live => "live",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors that end a subscription controller.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// The store kept failing after every allowed retry.
    #[error("Event store error: {0}")]
    Store(#[from] EventStoreError),

    /// Resolving the start position kept failing after every allowed retry.
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    /// The stream did not appear within the allowed poll attempts.
    #[error("Stream {stream} did not appear after {attempts} polls")]
    StreamNeverAppeared {
        /// The stream polled for.
        stream: StreamId,
        /// Polls made.
        attempts: usize,
    },

    /// The controller task panicked.
    #[error("Subscription task panicked: {0}")]
    TaskPanicked(String),
}

enum Delivery {
    Shutdown,
    Ended,
}

/// Drives one live stream from start resolution to live delivery.
pub struct SubscriptionController<M> {
    reader: Arc<PagedStreamReader<M>>,
    resolver: StartPositionResolver,
    poll: PollPolicy,
}

impl<M> SubscriptionController<M>
where
    M: Event + DeserializeOwned,
{
    /// Create a controller for `reader`'s stream.
    #[must_use]
    pub fn new(reader: Arc<PagedStreamReader<M>>, poll: PollPolicy) -> Self {
        Self {
            reader,
            resolver: StartPositionResolver::new(),
            poll,
        }
    }

    /// Replace the start-position resolver.
    #[must_use]
    pub const fn with_resolver(mut self, resolver: StartPositionResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Run the controller on the current `tokio` runtime.
    #[must_use]
    pub fn spawn(self) -> SubscriptionHandle {
        let stream_id = self.reader.stream_id().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Resolving);

        let task = tokio::spawn(async move {
            let result = self.run(&state_tx, shutdown_rx).await;
            if let Err(e) = &result {
                tracing::error!(stream = %self.reader.stream_id(), error = %e, "Subscription failed");
            }
            state_tx.send_replace(SubscriptionState::Stopped);
            tracing::info!(stream = %self.reader.stream_id(), "Subscription stopped");
            result
        });

        SubscriptionHandle {
            stream_id,
            shutdown: shutdown_tx,
            state: state_rx,
            task: Some(task),
        }
    }

    async fn run(
        &self,
        state: &watch::Sender<SubscriptionState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SubscriptionError> {
        let stream = self.reader.stream_id().clone();
        let mut resolved = false;
        let mut failures = 0usize;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if !resolved {
                state.send_replace(SubscriptionState::Resolving);
                let resolution = tokio::select! {
                    result = self.resolver.resolve(&self.reader) => result,
                    _ = shutdown.changed() => return Ok(()),
                };
                match resolution {
                    Ok(start) if start.is_complete() => {
                        resolved = true;
                        failures = 0;
                    }
                    Ok(_) => {
                        state.send_replace(SubscriptionState::Polling);
                        if !self.poll_until_exists(&mut shutdown).await? {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(stream = %stream, error = %e, "Failed to resolve start position");
                        self.back_off(&mut failures, &mut shutdown, e).await?;
                    }
                }
                continue;
            }

            state.send_replace(SubscriptionState::Subscribing);
            SubscriptionMetrics::record_attempt(stream.as_str());
            let from = self.reader.position();
            let subscription = tokio::select! {
                result = self.reader.store().subscribe(stream.clone(), from) => result,
                _ = shutdown.changed() => return Ok(()),
            };

            match subscription {
                Ok(records) => {
                    failures = 0;
                    state.send_replace(SubscriptionState::Live);
                    tracing::info!(stream = %stream, position = %from, "Subscription live");
                    SubscriptionMetrics::record_live();
                    let delivery = self.deliver(records, &mut shutdown).await;
                    SubscriptionMetrics::record_not_live();
                    match delivery {
                        Delivery::Shutdown => return Ok(()),
                        Delivery::Ended => {
                            tracing::info!(
                                stream = %stream,
                                position = %self.reader.position(),
                                "Subscription ended, resubscribing"
                            );
                            if sleep_or_shutdown(self.poll.jittered_delay(0), &mut shutdown).await {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(EventStoreError::StreamNotFound(_)) => {
                    state.send_replace(SubscriptionState::Polling);
                    if !self.poll_until_exists(&mut shutdown).await? {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "Failed to subscribe");
                    self.back_off(&mut failures, &mut shutdown, e).await?;
                }
            }
        }
    }

    async fn deliver(
        &self,
        mut records: RecordStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Delivery {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Delivery::Shutdown;
                    }
                }
                next = records.next() => match next {
                    Some(Ok(record)) => {
                        self.reader.deliver(record).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(stream = %self.reader.stream_id(), error = %e, "Subscription dropped");
                        return Delivery::Ended;
                    }
                    None => return Delivery::Ended,
                }
            }
        }
    }

    /// Returns `false` if shut down before the stream appeared.
    async fn poll_until_exists(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, SubscriptionError> {
        let stream = self.reader.stream_id();
        let mut attempts = 0usize;

        loop {
            if !self.poll.allows(attempts) {
                return Err(SubscriptionError::StreamNeverAppeared {
                    stream: stream.clone(),
                    attempts,
                });
            }
            let delay = self.poll.jittered_delay(attempts);
            tracing::debug!(stream = %stream, attempt = attempts, delay_ms = delay.as_millis(), "Waiting for stream");
            if sleep_or_shutdown(delay, shutdown).await {
                return Ok(false);
            }
            attempts += 1;
            SubscriptionMetrics::record_poll(stream.as_str());

            match self.reader.store().stream_exists(stream.clone()).await {
                Ok(true) => {
                    tracing::info!(stream = %stream, attempts, "Stream appeared");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "Existence check failed");
                }
            }
        }
    }

    async fn back_off<E>(
        &self,
        failures: &mut usize,
        shutdown: &mut watch::Receiver<bool>,
        error: E,
    ) -> Result<(), SubscriptionError>
    where
        SubscriptionError: From<E>,
    {
        if !self.poll.allows(*failures) {
            return Err(error.into());
        }
        let delay = self.poll.jittered_delay(*failures);
        *failures += 1;
        // Shutdown is picked up at the top of the run loop
        sleep_or_shutdown(delay, shutdown).await;
        Ok(())
    }
}

/// Returns `true` if shutdown was signalled before `delay` elapsed.
async fn sleep_or_shutdown(delay: std::time::Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Handle to a running [`SubscriptionController`].
///
/// Dropping the handle signals shutdown without waiting; use
/// [`SubscriptionHandle::stop`] to wait for the task to finish.
pub struct SubscriptionHandle {
    stream_id: StreamId,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SubscriptionState>,
    task: Option<JoinHandle<Result<(), SubscriptionError>>>,
}

impl SubscriptionHandle {
    /// The stream this subscription consumes.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Whether records are being delivered live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == SubscriptionState::Live
    }

    /// A receiver following every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Wait until the controller reaches `target`.
    ///
    /// Returns `false` if the controller stopped first.
    pub async fn wait_for(&self, target: SubscriptionState) -> bool {
        let mut state = self.state.clone();
        match state
            .wait_for(|current| *current == target || *current == SubscriptionState::Stopped)
            .await
        {
            Ok(reached) => *reached == target,
            Err(_) => target == SubscriptionState::Stopped,
        }
    }

    /// Signal shutdown and wait for the controller to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the controller, if it failed before being
    /// stopped, or [`SubscriptionError::TaskPanicked`].
    pub async fn stop(mut self) -> Result<(), SubscriptionError> {
        let _ = self.shutdown.send(true);
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(SubscriptionError::TaskPanicked(e.to_string())),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::reader::ReaderConfig;
    use eventview_core::projection::EventHandler;
    use eventview_core::stream::{Position, StartStrategy, StreamDescriptor, StreamKind};
    use eventview_testing::fixtures::{BankEvent, account_created, funds_added};
    use eventview_testing::InMemoryEventStore;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BankEvent>>);

    impl EventHandler<BankEvent> for Recorder {
        fn handle(&self, message: BankEvent) {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).push(message);
        }
    }

    impl Recorder {
        fn len(&self) -> usize {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
        }
    }

    fn fast_poll() -> PollPolicy {
        PollPolicy::builder()
            .initial_delay(Duration::from_millis(5))
            .max_delay(Duration::from_millis(20))
            .build()
    }

    fn controller(
        store: &InMemoryEventStore,
        strategy: StartStrategy,
        poll: PollPolicy,
    ) -> (SubscriptionController<BankEvent>, Arc<PagedStreamReader<BankEvent>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let descriptor = StreamDescriptor::builder(StreamKind::Category, "Account")
            .live(true)
            .start_strategy(strategy)
            .build()
            .expect("descriptor should build");
        let reader = Arc::new(
            PagedStreamReader::new(
                Arc::new(store.clone()),
                descriptor,
                Arc::clone(&recorder) as Arc<dyn EventHandler<BankEvent>>,
                ReaderConfig::default(),
            )
            .expect("reader should build"),
        );
        (SubscriptionController::new(Arc::clone(&reader), poll), reader, recorder)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check(), "condition not reached in time");
    }

    #[tokio::test]
    async fn replays_history_then_goes_live() {
        let store = InMemoryEventStore::new();
        let account = Uuid::new_v4();
        let created = account_created(account, "x", None);
        store.append_messages(created.stream_id(), &[created.clone(), funds_added(account, 1)]).await.unwrap();

        let (controller, reader, recorder) = controller(&store, StartStrategy::ReadAllStartEnd, fast_poll());
        let handle = controller.spawn();
        assert!(handle.wait_for(SubscriptionState::Live).await);
        assert_eq!(recorder.len(), 2);

        store.append_messages(created.stream_id(), &[funds_added(account, 2)]).await.unwrap();
        eventually(|| recorder.len() == 3).await;
        assert_eq!(reader.position(), Position::new(3));

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn polls_until_the_stream_appears() {
        let store = InMemoryEventStore::new();
        let (controller, _, recorder) = controller(&store, StartStrategy::ReadAllStartEnd, fast_poll());
        let handle = controller.spawn();

        assert!(handle.wait_for(SubscriptionState::Polling).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.len(), 0);
        assert_eq!(handle.state(), SubscriptionState::Polling);

        let account = Uuid::new_v4();
        let created = account_created(account, "x", None);
        store.append_messages(created.stream_id(), &[created]).await.unwrap();

        assert!(handle.wait_for(SubscriptionState::Live).await);
        eventually(|| recorder.len() == 1).await;
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bounded_polling_gives_up() {
        let store = InMemoryEventStore::new();
        let poll = PollPolicy::builder()
            .max_attempts(2)
            .initial_delay(Duration::from_millis(1))
            .build();
        let (controller, _, _) = controller(&store, StartStrategy::ReadAllStartEnd, poll);
        let handle = controller.spawn();

        assert!(handle.wait_for(SubscriptionState::Stopped).await);
        assert!(matches!(
            handle.stop().await,
            Err(SubscriptionError::StreamNeverAppeared { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn resubscribes_without_duplicates_after_the_store_drops_it() {
        let store = InMemoryEventStore::new();
        let account = Uuid::new_v4();
        let created = account_created(account, "x", None);
        store.append_messages(created.stream_id(), &[created.clone()]).await.unwrap();

        let (controller, _, recorder) = controller(&store, StartStrategy::ReadAllStartEnd, fast_poll());
        let handle = controller.spawn();
        assert!(handle.wait_for(SubscriptionState::Live).await);

        store.drop_subscriptions();
        store.append_messages(created.stream_id(), &[funds_added(account, 5)]).await.unwrap();

        eventually(|| recorder.len() == 2).await;
        assert!(handle.wait_for(SubscriptionState::Live).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorder.len(), 2);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn end_only_delivers_only_new_records() {
        let store = InMemoryEventStore::new();
        let account = Uuid::new_v4();
        let created = account_created(account, "x", None);
        store.append_messages(created.stream_id(), &[created.clone(), funds_added(account, 1)]).await.unwrap();

        let (controller, _, recorder) = controller(&store, StartStrategy::StartEndOnly, fast_poll());
        let handle = controller.spawn();
        assert!(handle.wait_for(SubscriptionState::Live).await);

        store.append_messages(created.stream_id(), &[funds_added(account, 2)]).await.unwrap();
        eventually(|| recorder.len() == 1).await;
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_interrupts_polling() {
        let store = InMemoryEventStore::new();
        let poll = PollPolicy::builder()
            .initial_delay(Duration::from_secs(60))
            .build();
        let (controller, _, _) = controller(&store, StartStrategy::ReadAllStartEnd, poll);
        let handle = controller.spawn();
        assert!(handle.wait_for(SubscriptionState::Polling).await);

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should not wait for the poll delay")
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_task() {
        let store = InMemoryEventStore::new();
        let (controller, _, _) = controller(&store, StartStrategy::ReadAllStartEnd, fast_poll());
        let handle = controller.spawn();
        let mut state = handle.watch_state();
        drop(handle);

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SubscriptionState::Stopped),
        )
        .await
        .expect("controller should stop")
        .is_ok();
        assert!(stopped);
    }

    #[test]
    fn state_display() {
        assert_eq!(SubscriptionState::Live.to_string(), "live");
        assert_eq!(SubscriptionState::Polling.to_string(), "polling");
    }
}
