//! # Eventview Testing
//!
//! Testing utilities for the Eventview read-side engine.
//!
//! This crate provides:
//! - [`InMemoryEventStore`]: an [`EventStore`](eventview_core::event_store::EventStore)
//!   with `$ce-`/`$et-` system streams and push subscriptions
//! - [`InMemoryProjectionCheckpoint`]: checkpoint provider that records saves
//! - [`fixtures`]: the Accounts/Users domain used across the workspace's tests
//! - [`properties`]: `proptest` strategies over that domain
//! - [`init_test_tracing`]: log output for tests, filtered by `RUST_LOG`
//!
//! ## Example
//!
//! ```
//! use eventview_testing::InMemoryEventStore;
//! use eventview_testing::fixtures::{account_created, funds_added};
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryEventStore::new();
//! let account = Uuid::new_v4();
//! let created = account_created(account, "savings", None);
//!
//! store
//!     .append_messages(created.stream_id(), &[created.clone(), funds_added(account, 100)])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod event_store;
pub mod fixtures;
pub mod projection_mocks;

/// Property-based testing utilities using proptest.
pub mod properties {
    use crate::fixtures::BankEvent;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// An account id.
    pub fn account_id() -> impl Strategy<Value = Uuid> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    /// One account's history: its creation followed by up to `max_updates`
    /// deposits and renames, in stream order.
    pub fn account_history(max_updates: usize) -> impl Strategy<Value = Vec<BankEvent>> {
        (account_id(), "[a-z]{1,8}").prop_flat_map(move |(account_id, name)| {
            let update = prop_oneof![
                (any::<u128>(), -1_000i64..1_000).prop_map(move |(tx, amount)| {
                    BankEvent::FundsAdded {
                        account_id,
                        transaction_id: Uuid::from_u128(tx),
                        amount,
                    }
                }),
                "[a-z]{1,8}".prop_map(move |name| BankEvent::AccountRenamed { account_id, name }),
            ];
            let created = BankEvent::AccountCreated {
                account_id,
                name: name.clone(),
                user_id: None,
            };
            proptest::collection::vec(update, 0..=max_updates).prop_map(move |updates| {
                std::iter::once(created.clone()).chain(updates).collect()
            })
        })
    }
}

/// Install a `tracing` subscriber writing to the test output.
///
/// Filtered by `RUST_LOG` (default `warn`). Safe to call from every test;
/// only the first call installs anything.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use event_store::InMemoryEventStore;
pub use projection_mocks::InMemoryProjectionCheckpoint;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn histories_start_with_creation(history in properties::account_history(5)) {
            prop_assert!(matches!(history[0], fixtures::BankEvent::AccountCreated { .. }), "history must start with AccountCreated");
            let account = history[0].account_id();
            prop_assert!(history.iter().all(|event| event.account_id() == account));
        }
    }

    #[test]
    fn tracing_init_is_repeatable() {
        init_test_tracing();
        init_test_tracing();
    }
}
