//! In-memory event store.
//!
//! Appends to an aggregate stream (`Account-<id>`) are linked into the
//! category stream (`$ce-Account`) and the event-type stream
//! (`$et-<event type>`), each link getting its own position, the way a real
//! store's system projections would. Subscriptions replay from the requested
//! position and then follow live appends through a `tokio` broadcast channel.

use eventview_core::event::{Event, RecordedEvent, SerializedEvent};
use eventview_core::event_store::{EventStore, EventStoreError, ReadSlice, RecordStream};
use eventview_core::stream::{Position, ReadDirection, StreamId};
use eventview_core::{DateTime, Serialize, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Default)]
struct Streams {
    records: HashMap<StreamId, Vec<RecordedEvent>>,
    live: HashMap<StreamId, broadcast::Sender<RecordedEvent>>,
}

impl Streams {
    fn link(&mut self, stream_id: &StreamId, event: &SerializedEvent, now: DateTime<Utc>) {
        let records = self.records.entry(stream_id.clone()).or_default();
        let record = RecordedEvent::new(
            stream_id.clone(),
            Position::new(records.len() as u64),
            event.clone(),
            now,
        );
        records.push(record.clone());

        if let Some(sender) = self.live.get(stream_id) {
            // No receivers left is fine
            let _ = sender.send(record);
        }
    }
}

/// Append-only event store kept in process memory.
///
/// Intended for tests. Cloning shares the underlying streams.
///
/// # Example
///
/// ```
/// use eventview_testing::InMemoryEventStore;
/// use eventview_core::event::SerializedEvent;
/// use eventview_core::event_store::EventStore;
/// use eventview_core::stream::{Position, ReadDirection, StreamId};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let event = SerializedEvent::new("AccountCreated.v1".to_string(), vec![], None);
/// store.append_events(StreamId::new("Account-1"), None, vec![event]).await?;
///
/// let slice = store
///     .read_stream(StreamId::new("$ce-Account"), Position::START, 10, ReadDirection::Forward)
///     .await?;
/// assert_eq!(slice.events.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<Streams>>,
    unavailable: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `DatabaseError` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End every open subscription, as a store restart would.
    pub fn drop_subscriptions(&self) {
        self.write().live.clear();
    }

    /// Number of `read_stream` calls served so far.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of records in a stream, `None` if it does not exist.
    #[must_use]
    pub fn stream_len(&self, stream_id: &StreamId) -> Option<usize> {
        self.read().records.get(stream_id).map(Vec::len)
    }

    /// Serialize and append typed events without a version check.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` if an event fails to serialize, or any
    /// error from [`EventStore::append_events`].
    pub async fn append_messages<E>(
        &self,
        stream_id: impl Into<StreamId>,
        events: &[E],
    ) -> Result<Position, EventStoreError>
    where
        E: Event + Serialize,
    {
        let serialized = events
            .iter()
            .map(|event| SerializedEvent::from_event(event, None))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EventStoreError::SerializationError(e.to_string()))?;
        self.append_events(stream_id.into(), None, serialized).await
    }

    fn check_available(&self) -> Result<(), EventStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventStoreError::DatabaseError(
                "event store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Streams> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Streams> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn read_slice(
    records: &[RecordedEvent],
    start: Position,
    count: usize,
    direction: ReadDirection,
) -> ReadSlice {
    let len = records.len() as u64;
    match direction {
        ReadDirection::Forward => {
            let from = start.value().min(len);
            let to = from.saturating_add(count as u64).min(len);
            ReadSlice {
                events: records[from as usize..to as usize].to_vec(),
                next_position: Position::new(to),
                end_of_stream: to >= len,
                stream_exists: true,
            }
        }
        ReadDirection::Backward => {
            if len == 0 {
                return ReadSlice {
                    events: Vec::new(),
                    next_position: Position::START,
                    end_of_stream: true,
                    stream_exists: true,
                };
            }
            let top = start.value().min(len - 1);
            let taken = (count as u64).min(top + 1);
            let events = (0..taken)
                .map(|offset| records[(top - offset) as usize].clone())
                .collect();
            let lowest = top + 1 - taken;
            ReadSlice {
                events,
                next_position: Position::new(lowest.saturating_sub(1)),
                end_of_stream: lowest == 0,
                stream_exists: true,
            }
        }
    }
}

impl EventStore for InMemoryEventStore {
    fn read_stream(
        &self,
        stream_id: StreamId,
        start: Position,
        count: usize,
        direction: ReadDirection,
    ) -> Pin<Box<dyn Future<Output = Result<ReadSlice, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            let streams = self.read();
            Ok(streams
                .records
                .get(&stream_id)
                .map_or_else(ReadSlice::missing, |records| {
                    read_slice(records, start, count, direction)
                }))
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn subscribe(
        &self,
        stream_id: StreamId,
        from: Position,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;

            // Snapshot and receiver are taken under one lock so no append falls
            // between history and live delivery.
            let (history, mut receiver) = {
                let mut streams = self.write();
                let Some(records) = streams.records.get(&stream_id) else {
                    return Err(EventStoreError::StreamNotFound(stream_id));
                };
                let skip = from.value().min(records.len() as u64) as usize;
                let history = records[skip..].to_vec();
                let receiver = streams
                    .live
                    .entry(stream_id.clone())
                    .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
                    .subscribe();
                (history, receiver)
            };

            let records: RecordStream = Box::pin(async_stream::stream! {
                for record in history {
                    yield Ok(record);
                }
                loop {
                    match receiver.recv().await {
                        Ok(record) if record.position >= from => yield Ok(record),
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            yield Err(EventStoreError::SubscriptionFailed {
                                stream_id: stream_id.clone(),
                                reason: format!("subscriber lagged by {missed} records"),
                            });
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });
            Ok(records)
        })
    }

    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Position>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Position, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut streams = self.write();

            let current = Position::new(
                streams
                    .records
                    .get(&stream_id)
                    .map_or(0, |records| records.len() as u64),
            );
            if let Some(expected) = expected_version.filter(|expected| *expected != current) {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: current,
                });
            }

            let now = Utc::now();
            let category = if stream_id.is_system() {
                None
            } else {
                stream_id.category().map(StreamId::category_stream)
            };
            let link_event_type = !stream_id.is_system();

            for event in &events {
                streams.link(&stream_id, event, now);
                if let Some(category) = &category {
                    streams.link(category, event, now);
                }
                if link_event_type {
                    streams.link(&StreamId::event_type_stream(&event.event_type), event, now);
                }
            }

            Ok(current + events.len() as u64)
        })
    }
}
