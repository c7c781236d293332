//! # Eventview Core
//!
//! Core traits and types for the Eventview read-side synchronization engine.
//!
//! Eventview consumes append-only event streams and materializes them into
//! in-memory read models (projections). This crate holds the vocabulary shared
//! by every other crate in the workspace:
//!
//! - **Streams**: [`stream::StreamId`], [`stream::Position`] and the immutable
//!   [`stream::StreamDescriptor`] that says how a projection consumes a stream
//! - **Events**: the [`event::Event`] trait and the wire types the store hands out
//! - **Event store**: the [`event_store::EventStore`] collaborator boundary
//!   (paged reads, push subscriptions, appends)
//! - **Projections**: checkpoints, the [`projection::EventHandler`] seam and the
//!   configuration error taxonomy
//!
//! ## Data flow
//!
//! ```text
//! EventStore ──read/subscribe──▶ Stream ──handle──▶ ProjectionCache ──▶ queries
//! ```
//!
//! Data flows one direction only. Queries read the cache directly; nothing is
//! ever written back to the store from the read side.
//!
//! ## Example
//!
//! ```
//! use eventview_core::stream::{ReadDirection, StartStrategy, StreamDescriptor, StreamKind};
//!
//! let descriptor = StreamDescriptor::builder(StreamKind::Category, "Account")
//!     .direction(ReadDirection::Forward)
//!     .live(true)
//!     .accepts(["AccountCreated.v1", "FundsAdded.v1"])
//!     .start_strategy(StartStrategy::ReadAllStartEnd)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(descriptor.stream_id().as_str(), "$ce-Account");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event;
pub mod event_store;
pub mod projection;
pub mod stream;
