//! Read models composed of streams and a projection cache.
//!
//! # Overview
//!
//! A [`Projection`] is what the query layer talks to. It owns one
//! [`ProjectionCache`] and every [`Stream`] feeding it:
//!
//! ```text
//! ┌──────────────┐
//! │ Event Store  │
//! └──┬────────┬──┘
//!    │ push   │ pull (on query)
//!    ▼        ▼
//! ┌──────┐ ┌──────┐
//! │Stream│ │Stream│   ...
//! └──┬───┘ └──┬───┘
//!    └───┬────┘
//!        ▼
//! ┌─────────────────┐       ┌─────────┐
//! │ ProjectionCache │ ◀──── │ queries │
//! └─────────────────┘       └─────────┘
//! ```
//!
//! Live streams are kept current by their subscriptions once
//! [`Projection::start`] ran. Pull streams are only read by
//! [`Projection::update_state`], which queries call before reading the cache.
//!
//! # Example
//!
//! ```ignore
//! use eventview_projections::{DtoSchema, Projection};
//!
//! let projection = Projection::builder("accounts", store, schema)
//!     .stream(accounts)
//!     .stream(users)
//!     .build()?;
//!
//! projection.start();
//!
//! // On each query
//! projection.update_state().await?;
//! let items = projection.get_cached_items();
//!
//! // On shutdown
//! projection.shutdown().await?;
//! ```

use crate::cache::{CacheView, ProjectionCache};
use crate::schema::DtoSchema;
use crate::stash::StashConfig;
use crate::stream::{Stream, StreamConfig};
use eventview_core::event::Event;
use eventview_core::event_store::EventStore;
use eventview_core::projection::{ConfigurationError, EventHandler};
use eventview_core::stream::{Position, StreamDescriptor, StreamId};
use eventview_runtime::reader::ReaderError;
use eventview_runtime::subscription::{SubscriptionError, SubscriptionState};
use futures::future::{join_all, try_join_all};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Configuration shared by a projection's cache and streams.
#[derive(Debug, Clone, Default)]
pub struct ProjectionConfig {
    /// Stash limits of the cache
    pub stash: StashConfig,
    /// Configuration of every stream
    pub stream: StreamConfig,
}

impl ProjectionConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stash limits.
    #[must_use]
    pub const fn with_stash(mut self, stash: StashConfig) -> Self {
        self.stash = stash;
        self
    }

    /// Set the stream configuration.
    #[must_use]
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

/// A read model: streams feeding one projection cache.
pub struct Projection<M, D> {
    name: String,
    cache: Arc<ProjectionCache<M, D>>,
    streams: Vec<Stream<M>>,
}

impl<M, D> Projection<M, D>
where
    M: Event + DeserializeOwned + Clone,
    D: Default + Clone + Send + Sync + 'static,
{
    /// Start building a projection named `name`.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        store: Arc<dyn EventStore>,
        schema: DtoSchema<M, D>,
    ) -> ProjectionBuilder<M, D> {
        ProjectionBuilder {
            name: name.into(),
            store,
            schema,
            descriptors: Vec::new(),
            config: ProjectionConfig::default(),
        }
    }

    /// The projection's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<ProjectionCache<M, D>> {
        &self.cache
    }

    /// The streams, in registration order.
    #[must_use]
    pub fn streams(&self) -> &[Stream<M>] {
        &self.streams
    }

    /// Subscribe every live stream.
    ///
    /// Returns how many subscriptions were started; calling again starts none.
    pub fn start(&self) -> usize {
        let started = self
            .streams
            .iter()
            .filter(|stream| stream.subscribe())
            .count();
        tracing::info!(projection = %self.name, subscriptions = started, "Projection started");
        started
    }

    /// Catch up every pull stream.
    ///
    /// Returns whether any new record was read.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReaderError`] of any stream; the other streams
    /// still finish their read.
    pub async fn update_state(&self) -> Result<bool, ReaderError> {
        let reads = self
            .streams
            .iter()
            .filter(|stream| !stream.is_live())
            .map(Stream::catch_up);
        let results = try_join_all(reads).await.inspect_err(|e| {
            tracing::warn!(projection = %self.name, error = %e, "Failed to update state");
        })?;
        Ok(results.into_iter().any(|had_any| had_any))
    }

    /// Every cached DTO.
    ///
    /// Pull streams are not read; call [`Projection::update_state`] first, or
    /// use [`Projection::query`]. The view holds the cache's read lock, which
    /// stalls every stream feeding the cache; drop it before the next
    /// `.await`.
    #[must_use]
    pub fn get_cached_items(&self) -> CacheView<'_, D> {
        self.cache.get_all()
    }

    /// Update pull streams, then return a copy of every cached DTO.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError`] if a pull stream fails to catch up.
    pub async fn query(&self) -> Result<HashMap<Uuid, D>, ReaderError> {
        self.update_state().await?;
        Ok(self.cache.snapshot())
    }

    /// A copy of the DTO at `key`.
    #[must_use]
    pub fn get(&self, key: Uuid) -> Option<D> {
        self.cache.get(key)
    }

    /// The next position to read of every stream.
    #[must_use]
    pub fn stream_positions(&self) -> Vec<(StreamId, Position)> {
        self.streams
            .iter()
            .map(|stream| (stream.stream_id().clone(), stream.position()))
            .collect()
    }

    /// Subscription states of the live streams.
    #[must_use]
    pub fn subscription_states(&self) -> Vec<(StreamId, SubscriptionState)> {
        self.streams
            .iter()
            .filter_map(|stream| {
                stream
                    .subscription_state()
                    .map(|state| (stream.stream_id().clone(), state))
            })
            .collect()
    }

    /// Wait until every live stream delivers live.
    ///
    /// Returns `false` if a subscription stopped first or was never started.
    pub async fn wait_until_live(&self) -> bool {
        let waits = self
            .streams
            .iter()
            .filter(|stream| stream.is_live())
            .map(|stream| stream.wait_for(SubscriptionState::Live));
        join_all(waits).await.into_iter().all(|live| live)
    }

    /// Stop every subscription and save every checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the first error; every stream is stopped regardless.
    pub async fn shutdown(&self) -> Result<(), SubscriptionError> {
        let results = join_all(self.streams.iter().map(Stream::stop)).await;
        let mut first = None;
        for (stream, result) in self.streams.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(
                    projection = %self.name,
                    stream = %stream.stream_id(),
                    error = %e,
                    "Stream failed to stop cleanly"
                );
                first.get_or_insert(e);
            }
        }
        tracing::info!(projection = %self.name, "Projection stopped");
        first.map_or(Ok(()), Err)
    }
}

impl<M, D> fmt::Debug for Projection<M, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("name", &self.name)
            .field("cache", &self.cache)
            .field("streams", &self.streams)
            .finish()
    }
}

/// Builder for [`Projection`].
pub struct ProjectionBuilder<M, D> {
    name: String,
    store: Arc<dyn EventStore>,
    schema: DtoSchema<M, D>,
    descriptors: Vec<StreamDescriptor>,
    config: ProjectionConfig,
}

impl<M, D> ProjectionBuilder<M, D>
where
    M: Event + DeserializeOwned + Clone,
    D: Default + Clone + Send + Sync + 'static,
{
    /// Add a stream.
    #[must_use]
    pub fn stream(mut self, descriptor: StreamDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the projection.
    ///
    /// Streams are checkpointed as `<projection>/<stream>`.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::NoStreams`] without streams
    /// - [`ConfigurationError::DuplicateStream`] if two streams read the same
    ///   physical stream
    /// - [`ConfigurationError::MissingHandler`] if a stream accepts an event
    ///   type the schema has no handler for
    /// - [`ConfigurationError::InvalidPageSize`] for an out-of-range page size
    pub fn build(self) -> Result<Projection<M, D>, ConfigurationError> {
        if self.descriptors.is_empty() {
            return Err(ConfigurationError::NoStreams {
                projection: self.name,
            });
        }

        let mut seen = HashSet::new();
        for descriptor in &self.descriptors {
            let stream = descriptor.stream_id();
            if !seen.insert(stream.clone()) {
                return Err(ConfigurationError::DuplicateStream {
                    projection: self.name,
                    stream: stream.to_string(),
                });
            }
            if let Some(unhandled) = descriptor
                .accepted_types()
                .iter()
                .find(|event_type| !self.schema.handles(event_type))
            {
                return Err(ConfigurationError::MissingHandler {
                    event_type: unhandled.clone(),
                    stream: stream.to_string(),
                });
            }
        }

        let cache = Arc::new(ProjectionCache::new(
            self.name.clone(),
            self.schema,
            self.config.stash,
        ));
        let streams = self
            .descriptors
            .into_iter()
            .map(|descriptor| {
                let checkpoint_name = format!("{}/{}", self.name, descriptor.stream_id());
                Stream::new(
                    Arc::clone(&self.store),
                    descriptor,
                    Arc::clone(&cache) as Arc<dyn EventHandler<M>>,
                    self.config.stream.clone(),
                    checkpoint_name,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            projection = %self.name,
            dto = cache.schema().dto_name(),
            streams = streams.len(),
            "Projection built"
        );
        Ok(Projection {
            name: self.name,
            cache,
            streams,
        })
    }
}
