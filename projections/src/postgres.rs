//! `PostgreSQL` checkpoint provider.
//!
//! Projections rebuild their caches from the log, so the only read-side
//! state worth persisting is where each stream got to. Streams started with
//! [`StartStrategy::StartFromPosition`](eventview_core::stream::StartStrategy)
//! resume from it; every stream with a provider saves to it periodically and
//! on shutdown.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE projection_checkpoints (
//!     checkpoint_name TEXT PRIMARY KEY,
//!     next_position BIGINT NOT NULL,
//!     reached_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Shipped as a migration; run it with [`PostgresProjectionCheckpoint::migrate`].

use eventview_core::projection::{EventPosition, ProjectionCheckpoint, ProjectionError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;

/// PostgreSQL-backed checkpoint tracking.
///
/// # Example
///
/// ```ignore
/// use eventview_projections::postgres::PostgresProjectionCheckpoint;
///
/// let checkpoint = PostgresProjectionCheckpoint::connect("postgres://localhost/projections").await?;
/// checkpoint.migrate().await?;
///
/// let accounts = StreamDescriptor::builder(StreamKind::Category, "Account")
///     .live(true)
///     .start_strategy(StartStrategy::StartFromPosition)
///     .checkpoint(Arc::new(checkpoint))
///     .build()?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresProjectionCheckpoint {
    pool: PgPool,
}

impl PostgresProjectionCheckpoint {
    /// Create a checkpoint provider on an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a small pool of its own.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5) // Checkpoints are low-volume
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the `projection_checkpoints` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ProjectionCheckpoint for PostgresProjectionCheckpoint {
    fn save_position(
        &self,
        name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let offset = i64::try_from(position.offset).map_err(|_| {
                ProjectionError::Checkpoint(format!(
                    "Position {} of {name} does not fit a BIGINT",
                    position.offset
                ))
            })?;

            sqlx::query(
                "INSERT INTO projection_checkpoints (checkpoint_name, next_position, reached_at, updated_at)
                 VALUES ($1, $2, $3, now())
                 ON CONFLICT (checkpoint_name) DO UPDATE
                 SET next_position = EXCLUDED.next_position,
                     reached_at = EXCLUDED.reached_at,
                     updated_at = now()",
            )
            .bind(&name)
            .bind(offset)
            .bind(position.timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to save checkpoint: {e}")))?;

            tracing::trace!(checkpoint = %name, offset, "Checkpoint written");
            Ok(())
        })
    }

    fn load_position(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventPosition>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let row: Option<(i64, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
                "SELECT next_position, reached_at
                 FROM projection_checkpoints
                 WHERE checkpoint_name = $1",
            )
            .bind(&name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to load checkpoint: {e}")))?;

            row.map(|(offset, timestamp)| {
                u64::try_from(offset)
                    .map(|offset| EventPosition::new(offset, timestamp))
                    .map_err(|_| {
                        ProjectionError::Checkpoint(format!(
                            "Negative position {offset} stored for {name}"
                        ))
                    })
            })
            .transpose()
        })
    }
}
