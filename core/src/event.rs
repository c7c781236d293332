//! Event trait and the wire types exchanged with the event store.
//!
//! Events are immutable facts. On the wire they travel as [`SerializedEvent`]
//! (type tag + `bincode` payload + optional JSON metadata); once stored they are
//! handed out as [`RecordedEvent`], which adds the stream and position the
//! record lives at.
//!
//! # Example
//!
//! ```
//! use eventview_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum AccountEvent {
//!     AccountCreated { account_id: u64, name: String },
//!     FundsAdded { account_id: u64, amount: i64 },
//! }
//!
//! impl Event for AccountEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             AccountEvent::AccountCreated { .. } => "AccountCreated.v1",
//!             AccountEvent::FundsAdded { .. } => "FundsAdded.v1",
//!         }
//!     }
//! }
//! ```

use crate::stream::{Position, StreamId};
use crate::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A message that can be stored in an event store and consumed by projections.
///
/// # Event Naming Convention
///
/// `event_type()` returns a stable tag including a version suffix
/// (`"AccountCreated.v1"`). The tag is used to route records to event-type
/// streams, to filter what a stream accepts, and as the key of a DTO's handler
/// dispatch table.
///
/// # Serialization
///
/// Events are serialized with `bincode`. The default methods work for any type
/// implementing `Serialize` and `DeserializeOwned`.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type tag for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to an incompatible schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event ready for storage.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type tag (e.g., "AccountCreated.v1").
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata (correlation/causation ids, user, ...).
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventview_core::event::SerializedEvent;
    ///
    /// let event = SerializedEvent::new("AccountCreated.v1".to_string(), vec![1, 2, 3], None);
    /// assert_eq!(event.event_type, "AccountCreated.v1");
    /// ```
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an [`Event`].
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// A record as read back from a stream.
///
/// The same stored event appears as a different `RecordedEvent` in each stream
/// it is linked into (its aggregate stream, its `$ce-` category stream, its
/// `$et-` event-type stream), each with that stream's own position.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// The stream this record was read from.
    pub stream_id: StreamId,

    /// Position of the record inside `stream_id`.
    pub position: Position,

    /// The stored event.
    pub event: SerializedEvent,

    /// When the event was appended.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Create a recorded event.
    #[must_use]
    pub const fn new(
        stream_id: StreamId,
        position: Position,
        event: SerializedEvent,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_id,
            position,
            event,
            recorded_at,
        }
    }

    /// The event type tag of the stored event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    /// Deserialize the payload into a typed message.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload does not decode.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        E::from_bytes(&self.event.data)
    }
}

impl fmt::Display for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.stream_id, self.position, self.event.event_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum TestEvent {
        Created { id: String, value: i32 },
        Updated { id: String, new_value: i32 },
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "TestEvent.Created.v1",
                TestEvent::Updated { .. } => "TestEvent.Updated.v1",
            }
        }
    }

    #[test]
    fn event_type_returns_correct_identifier() {
        let event = TestEvent::Created {
            id: "test-1".to_string(),
            value: 42,
        };
        assert_eq!(event.event_type(), "TestEvent.Created.v1");
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn recorded_event_decodes_payload() {
        let event = TestEvent::Updated {
            id: "test-1".to_string(),
            new_value: 100,
        };
        let serialized = SerializedEvent::from_event(&event, None).expect("serialize");
        let recorded = RecordedEvent::new(
            StreamId::new("Test-1"),
            Position::new(3),
            serialized,
            Utc::now(),
        );

        assert_eq!(recorded.event_type(), "TestEvent.Updated.v1");
        let decoded: TestEvent = recorded.decode().expect("decode");
        assert_eq!(decoded, event);
        assert_eq!(format!("{recorded}"), "Test-1@3 (TestEvent.Updated.v1)");
    }

    #[test]
    fn garbage_payload_fails_to_decode() {
        let recorded = RecordedEvent::new(
            StreamId::new("Test-1"),
            Position::START,
            SerializedEvent::new("TestEvent.Created.v1".to_string(), vec![0xff], None),
            Utc::now(),
        );

        let result = recorded.decode::<TestEvent>();
        assert!(matches!(result, Err(EventError::DeserializationError(_))));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn serialized_event_carries_metadata() {
        let event = TestEvent::Created {
            id: "test-1".to_string(),
            value: 1,
        };
        let metadata = serde_json::json!({ "correlation_id": "corr-456" });

        let serialized =
            SerializedEvent::from_event(&event, Some(metadata.clone())).expect("serialize");

        assert_eq!(serialized.event_type, "TestEvent.Created.v1");
        assert_eq!(serialized.metadata, Some(metadata));
        assert!(format!("{serialized}").contains("TestEvent.Created.v1"));
    }
}
