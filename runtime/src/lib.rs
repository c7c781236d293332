//! # Eventview Runtime
//!
//! Stream consumption for the Eventview read side.
//!
//! This crate moves records from the event store to a projection's handler:
//! it decides where each stream starts, replays history page by page, and
//! keeps live streams subscribed.
//!
//! ## Core Components
//!
//! - **[`PagedStreamReader`](reader::PagedStreamReader)**: pages one stream,
//!   decodes records and tracks the stream position
//! - **[`StartPositionResolver`](start_position::StartPositionResolver)**:
//!   applies a stream's start strategy (replay all, tail only, checkpoint)
//! - **[`SubscriptionController`](subscription::SubscriptionController)**:
//!   Resolving → Subscribing/Polling → Live state machine per live stream
//! - **[`PollPolicy`](retry::PollPolicy)**: backoff for polling and retries
//! - **[`metrics`]**: Prometheus recorders for all of the above
//!
//! ## Example
//!
//! ```ignore
//! use eventview_runtime::reader::{PagedStreamReader, ReaderConfig};
//! use eventview_runtime::retry::PollPolicy;
//! use eventview_runtime::subscription::{SubscriptionController, SubscriptionState};
//!
//! let reader = Arc::new(PagedStreamReader::new(store, descriptor, handler, ReaderConfig::default())?);
//! let handle = SubscriptionController::new(reader, PollPolicy::default()).spawn();
//!
//! handle.wait_for(SubscriptionState::Live).await;
//! // ...
//! handle.stop().await?;
//! ```

/// Prometheus metrics for observability
pub mod metrics;

/// Paged stream reading
pub mod reader;

/// Backoff for polling and retries
pub mod retry;

/// Start-position strategies
pub mod start_position;

/// Live subscription state machine
pub mod subscription;

pub use reader::{PagedStreamReader, ReaderConfig, ReaderError, StreamPosition};
pub use retry::PollPolicy;
pub use start_position::StartPositionResolver;
pub use subscription::{
    SubscriptionController, SubscriptionError, SubscriptionHandle, SubscriptionState,
};
