//! Incremental projection caches and read models for Eventview.
//!
//! # Overview
//!
//! This crate turns event streams into queryable in-memory read models:
//! - **[`DtoSchema`]**: explicit registration of a DTO type (primary key,
//!   creation event, foreign keys, one handler per event type)
//! - **[`ProjectionCache`]**: applies messages to DTOs, resolving correlations
//!   that arrive out of order through a foreign index and bounded stashes
//! - **[`Stream`]**: one consumed stream, live (push) or pull (catch-up)
//! - **[`Projection`]**: streams feeding one cache, exposed to queries
//! - **[`PostgresProjectionCheckpoint`]**: persisted stream positions
//!
//! The cache itself is never persisted; it is rebuilt from the log on start.
//!
//! # Building a Projection
//!
//! ```ignore
//! use eventview_projections::{DtoSchema, Projection};
//!
//! let schema = DtoSchema::<BankEvent, AccountView>::builder("AccountView")
//!     .primary_key("account_id", AccountView::key, BankEvent::account_id)
//!     .creation_event("AccountCreated.v1")
//!     .foreign_key("user_id", AccountView::owner, BankEvent::user_id)
//!     .on("AccountCreated.v1", AccountView::on_account_created)
//!     .on("FundsAdded.v1", AccountView::on_funds_added)
//!     .on("UserCreated.v1", AccountView::on_user_email)
//!     .build()?;
//!
//! let projection = Projection::builder("accounts", store, schema)
//!     .stream(StreamDescriptor::builder(StreamKind::Category, "Account").live(true).build()?)
//!     .stream(StreamDescriptor::builder(StreamKind::Category, "User").live(true).build()?)
//!     .build()?;
//!
//! projection.start();
//! let accounts = projection.query().await?;
//! ```

pub mod cache;
pub mod postgres;
pub mod projection;
pub mod schema;
pub mod stash;
pub mod stream;

// Re-export main types for convenience
pub use cache::{CacheView, ProjectionCache, StashStats};
pub use postgres::PostgresProjectionCheckpoint;
pub use projection::{Projection, ProjectionBuilder, ProjectionConfig};
pub use schema::{DtoSchema, DtoSchemaBuilder};
pub use stash::StashConfig;
pub use stream::{Stream, StreamConfig};
