//! In-memory checkpoint provider.
//!
//! [`InMemoryProjectionCheckpoint`] stores positions in a `HashMap` and keeps
//! a log of every save, so tests can assert both where a stream resumes from
//! and when it reported progress.

use eventview_core::projection::{EventPosition, ProjectionCheckpoint, ProjectionError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory checkpoint tracking for testing stream resumption.
///
/// # Example
///
/// ```
/// use eventview_testing::InMemoryProjectionCheckpoint;
/// use eventview_core::projection::{EventPosition, ProjectionCheckpoint};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let checkpoint = InMemoryProjectionCheckpoint::new();
///
/// let position = EventPosition::new(42, Utc::now());
/// checkpoint.save_position("accounts/$ce-Account", position).await?;
///
/// let loaded = checkpoint.load_position("accounts/$ce-Account").await?;
/// assert_eq!(loaded, Some(position));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionCheckpoint {
    positions: Arc<RwLock<HashMap<String, EventPosition>>>,
    saves: Arc<RwLock<Vec<(String, u64)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryProjectionCheckpoint {
    /// Create a new empty checkpoint tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker preloaded with one saved offset.
    #[must_use]
    pub fn with_position(name: impl Into<String>, offset: u64) -> Self {
        let checkpoint = Self::new();
        checkpoint
            .positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), EventPosition::new(offset, chrono::Utc::now()));
        checkpoint
    }

    /// Make loads and saves fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The saved offset for `name`.
    #[must_use]
    pub fn offset(&self, name: &str) -> Option<u64> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|position| position.offset)
    }

    /// Every save so far, as `(name, offset)` in call order.
    #[must_use]
    pub fn saves(&self) -> Vec<(String, u64)> {
        self.saves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get all names with checkpoints.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProjectionError::Checkpoint(
                "checkpoint store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProjectionCheckpoint for InMemoryProjectionCheckpoint {
    fn save_position(
        &self,
        name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            self.check()?;
            self.saves
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name.clone(), position.offset));
            self.positions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name, position);
            Ok(())
        })
    }

    fn load_position(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventPosition>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            self.check()?;
            Ok(self
                .positions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&name)
                .copied())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() {
        let checkpoint = InMemoryProjectionCheckpoint::new();
        assert_eq!(checkpoint.load_position("a").await.unwrap(), None);

        checkpoint
            .save_position("a", EventPosition::new(3, chrono::Utc::now()))
            .await
            .unwrap();
        checkpoint
            .save_position("a", EventPosition::new(7, chrono::Utc::now()))
            .await
            .unwrap();

        assert_eq!(checkpoint.offset("a"), Some(7));
        assert_eq!(checkpoint.saves(), vec![("a".to_string(), 3), ("a".to_string(), 7)]);
        assert_eq!(checkpoint.names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn preloaded_and_failing() {
        let checkpoint = InMemoryProjectionCheckpoint::with_position("b", 10);
        assert_eq!(checkpoint.load_position("b").await.unwrap().map(|p| p.offset), Some(10));

        checkpoint.set_failing(true);
        assert!(matches!(
            checkpoint.load_position("b").await,
            Err(ProjectionError::Checkpoint(_))
        ));
        assert!(checkpoint.saves().is_empty());
    }
}
