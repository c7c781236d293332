//! Incremental in-memory cache of materialized DTOs.
//!
//! # Overview
//!
//! A [`ProjectionCache`] holds one DTO per primary key and applies every
//! message it is handed, through the handlers of its [`DtoSchema`]. Messages
//! from different streams arrive in no particular order relative to each
//! other, so the cache resolves correlations that are not known yet:
//!
//! ```text
//!             ┌──────────── primary key known? ───────────┐
//! message ──▶ │ entry exists    → apply                   │
//!             │ creation event  → create + apply          │
//!             │ otherwise       → primary stash[key]      │
//!             └───────────────────────────────────────────┘
//!             ┌──────────── foreign key only ─────────────┐
//!             │ index[fk] known → apply to index[fk]      │
//!             │ otherwise       → foreign stash[fk]       │
//!             └───────────────────────────────────────────┘
//! ```
//!
//! After every create or update the cache *settles* the entry: it indexes the
//! entry's foreign key values, drains both stashes for the entry, and repeats
//! while drained messages keep arriving.
//!
//! # Concurrency
//!
//! Entries, the foreign index and each stash sit behind their own lock. An
//! entry is written before it is indexed. Foreign resolution holds the foreign
//! stash lock while it reads or writes the index and applies messages, always
//! in the order stash, index, entries; so a value's stashed messages are
//! applied before any later message for that value. A primary message
//! stashed while its creation event is applied elsewhere is caught by
//! re-checking after the push. A stashed foreign message remembers which
//! entries it reached, so each entry sees it once however many of its foreign
//! keys it waited on.

use crate::schema::DtoSchema;
use crate::stash::{Evicted, Stash, StashConfig};
use eventview_core::event::Event;
use eventview_core::projection::EventHandler;
use eventview_runtime::metrics::CacheMetrics;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use uuid::Uuid;

const PRIMARY: &str = "primary";
const FOREIGN: &str = "foreign";

/// Stash sizes of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StashStats {
    /// Primary keys waiting for their creation event
    pub primary_keys: usize,
    /// Messages waiting for their creation event
    pub primary_messages: usize,
    /// Foreign key values not indexed yet
    pub foreign_keys: usize,
    /// Messages waiting for their foreign key to be indexed
    pub foreign_messages: usize,
}

/// Read-only view of every cached DTO, keyed by primary key.
///
/// Holds the cache's read lock; writers wait until it is dropped.
pub struct CacheView<'a, D> {
    entries: RwLockReadGuard<'a, HashMap<Uuid, D>>,
}

impl<D> Deref for CacheView<'_, D> {
    type Target = HashMap<Uuid, D>;

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

impl<D: fmt::Debug> fmt::Debug for CacheView<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// Keyed store of DTOs, fed by one or more streams.
pub struct ProjectionCache<M, D> {
    projection: String,
    schema: DtoSchema<M, D>,
    entries: RwLock<HashMap<Uuid, D>>,
    index: RwLock<HashMap<Uuid, Uuid>>,
    primary_stash: Mutex<Stash<M>>,
    foreign_stash: Mutex<Stash<Arc<Pending<M>>>>,
}

/// A foreign message waiting in the stash, shared by every value it waits on.
struct Pending<M> {
    message: M,
    reached: Mutex<SmallVec<[Uuid; 4]>>,
}

impl<M> Pending<M> {
    fn new(message: M, reached: SmallVec<[Uuid; 4]>) -> Self {
        Self {
            message,
            reached: Mutex::new(reached),
        }
    }

    /// Claim delivery to `key`; `false` if the message already reached it.
    fn reach(&self, key: Uuid) -> bool {
        let mut reached = lock(&self.reached);
        if reached.contains(&key) {
            return false;
        }
        reached.push(key);
        true
    }
}

impl<M, D> ProjectionCache<M, D>
where
    M: Event + Clone,
    D: Default + Clone + Send + Sync + 'static,
{
    /// An empty cache for `projection`.
    #[must_use]
    pub fn new(projection: impl Into<String>, schema: DtoSchema<M, D>, stash: StashConfig) -> Self {
        Self {
            projection: projection.into(),
            schema,
            entries: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            primary_stash: Mutex::new(Stash::new(stash)),
            foreign_stash: Mutex::new(Stash::new(stash)),
        }
    }

    /// The projection this cache belongs to.
    #[must_use]
    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// The registered DTO schema.
    #[must_use]
    pub const fn schema(&self) -> &DtoSchema<M, D> {
        &self.schema
    }

    /// Apply one message.
    ///
    /// Messages with no registered handler, or correlating to neither the
    /// primary key nor a foreign key, are dropped.
    pub fn process(&self, message: M) {
        let event_type = message.event_type();
        if !self.schema.handles(event_type) {
            tracing::debug!(projection = %self.projection, event_type, "No handler, dropping message");
            return;
        }

        if let Some(key) = self.schema.primary_of(&message) {
            self.process_primary(key, message);
            return;
        }

        let foreign = self.schema.foreign_of(&message);
        if foreign.is_empty() {
            tracing::debug!(
                projection = %self.projection,
                event_type,
                "Message carries no correlation id, dropping"
            );
            return;
        }
        self.process_foreign(&foreign, message);
    }

    /// Every cached DTO.
    ///
    /// The view holds a read lock; drop it before processing more messages on
    /// the same thread.
    #[must_use]
    pub fn get_all(&self) -> CacheView<'_, D> {
        CacheView {
            entries: self.entries.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// A copy of the DTO at `key`.
    #[must_use]
    pub fn get(&self, key: Uuid) -> Option<D> {
        self.read_entries().get(&key).cloned()
    }

    /// A copy of every cached DTO.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Uuid, D> {
        self.read_entries().clone()
    }

    /// Number of cached DTOs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// The primary key a foreign key value resolved to.
    #[must_use]
    pub fn resolve_foreign(&self, value: Uuid) -> Option<Uuid> {
        self.read_index().get(&value).copied()
    }

    /// Current stash sizes.
    #[must_use]
    pub fn stash_stats(&self) -> StashStats {
        let (primary_keys, primary_messages) = {
            let stash = lock(&self.primary_stash);
            (stash.keys(), stash.messages())
        };
        let (foreign_keys, foreign_messages) = {
            let stash = lock(&self.foreign_stash);
            (stash.keys(), stash.messages())
        };
        StashStats {
            primary_keys,
            primary_messages,
            foreign_keys,
            foreign_messages,
        }
    }

    fn process_primary(&self, key: Uuid, message: M) {
        if self.apply_or_create(key, &message) {
            self.settle(key);
            return;
        }

        tracing::debug!(
            projection = %self.projection,
            key = %key,
            event_type = message.event_type(),
            "Entry not created yet, stashing"
        );
        let evicted = lock(&self.primary_stash).push(key, message);
        self.record_stashed(PRIMARY, evicted);

        // The creation event may have been applied by another stream meanwhile
        if self.read_entries().contains_key(&key) {
            self.settle(key);
        }
    }

    fn process_foreign(&self, values: &[Uuid], message: M) {
        // Resolving against the index and stashing happen under the stash
        // lock, so a value's queue is always drained before newer messages
        // for it are applied.
        let mut stash = lock(&self.foreign_stash);
        let mut targets: SmallVec<[Uuid; 4]> = SmallVec::new();
        let mut pending: SmallVec<[Uuid; 4]> = SmallVec::new();
        {
            let index = self.read_index();
            for value in values {
                match index.get(value) {
                    Some(primary) if !targets.contains(primary) => targets.push(*primary),
                    Some(_) => {}
                    None => pending.push(*value),
                }
            }
        }

        for primary in &targets {
            self.apply_existing(*primary, &message);
        }

        if !pending.is_empty() {
            let shared = Arc::new(Pending::new(message, targets.clone()));
            for value in pending {
                tracing::debug!(
                    projection = %self.projection,
                    foreign_key = %value,
                    event_type = shared.message.event_type(),
                    "Foreign key not indexed yet, stashing"
                );
                let evicted = stash.push(value, Arc::clone(&shared));
                self.record_stashed(FOREIGN, evicted);
            }
        }
        drop(stash);

        for primary in targets {
            self.settle(primary);
        }
    }

    /// Drain the entry's primary stash, index its foreign keys and drain
    /// their stashes, until nothing more arrives.
    fn settle(&self, key: Uuid) {
        loop {
            let drained = lock(&self.primary_stash).take(key);
            if !drained.is_empty() {
                CacheMetrics::record_drained(&self.projection, PRIMARY, drained.len());
                tracing::debug!(
                    projection = %self.projection,
                    key = %key,
                    count = drained.len(),
                    "Draining primary stash"
                );
                for message in &drained {
                    self.apply_existing(key, message);
                }
            }

            let Some(values) = self
                .read_entries()
                .get(&key)
                .map(|dto| self.schema.foreign_values(dto))
            else {
                return;
            };

            let foreign_drained = !values.is_empty() && self.index_and_drain(key, &values);
            if drained.is_empty() && !foreign_drained {
                return;
            }
        }
    }

    /// Point `values` at `key` and apply whatever was waiting for them.
    ///
    /// Returns whether any message left the foreign stash.
    fn index_and_drain(&self, key: Uuid, values: &[Uuid]) -> bool {
        let mut stash = lock(&self.foreign_stash);
        {
            let mut index = self.write_index();
            for value in values {
                if index.insert(*value, key) != Some(key) {
                    tracing::debug!(
                        projection = %self.projection,
                        foreign_key = %value,
                        key = %key,
                        "Indexed foreign key"
                    );
                }
            }
        }

        let mut drained = Vec::new();
        for value in values {
            let queued = stash.take(*value);
            if !queued.is_empty() {
                CacheMetrics::record_drained(&self.projection, FOREIGN, queued.len());
                drained.extend(queued);
            }
        }
        if drained.is_empty() {
            return false;
        }

        tracing::debug!(
            projection = %self.projection,
            key = %key,
            count = drained.len(),
            "Draining foreign stash"
        );
        for pending in &drained {
            if pending.reach(key) {
                self.apply_existing(key, &pending.message);
            }
        }
        true
    }

    /// Apply to an existing entry, or create it for a creation event.
    fn apply_or_create(&self, key: Uuid, message: &M) -> bool {
        let created = {
            let mut entries = self.write_entries();
            if let Some(dto) = entries.get_mut(&key) {
                self.schema.apply(dto, message);
                false
            } else if self.schema.creates(message) {
                let mut dto = D::default();
                self.schema.apply(&mut dto, message);
                entries.insert(key, dto);
                CacheMetrics::record_entries(&self.projection, entries.len());
                true
            } else {
                return false;
            }
        };
        if created {
            tracing::debug!(projection = %self.projection, key = %key, "Created entry");
        }
        CacheMetrics::record_applied(&self.projection);
        true
    }

    fn apply_existing(&self, key: Uuid, message: &M) -> bool {
        let applied = self
            .write_entries()
            .get_mut(&key)
            .is_some_and(|dto| self.schema.apply(dto, message));
        if applied {
            CacheMetrics::record_applied(&self.projection);
        }
        applied
    }

    fn record_stashed(&self, stash: &'static str, evicted: Evicted) {
        CacheMetrics::record_stashed(&self.projection, stash);
        let total = evicted.total();
        if total > 0 {
            tracing::warn!(
                projection = %self.projection,
                stash,
                evicted = total,
                evicted_key = ?evicted.oldest_key.map(|(key, _)| key),
                "Stash full, dropped oldest messages"
            );
            CacheMetrics::record_evicted(&self.projection, stash, total);
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<Uuid, D>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, D>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Uuid>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Uuid>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M, D> EventHandler<M> for ProjectionCache<M, D>
where
    M: Event + Clone,
    D: Default + Clone + Send + Sync + 'static,
{
    fn handle(&self, message: M) {
        self.process(message);
    }
}

impl<M, D> fmt::Debug for ProjectionCache<M, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionCache")
            .field("projection", &self.projection)
            .field("schema", &self.schema)
            .field(
                "entries",
                &self.entries.read().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use eventview_testing::fixtures::{
        AccountView, BankEvent, account_created, event_types, funds_added, user_created,
    };

    fn schema() -> DtoSchema<BankEvent, AccountView> {
        DtoSchema::builder("AccountView")
            .primary_key("account_id", AccountView::key, BankEvent::account_id)
            .creation_event(event_types::ACCOUNT_CREATED)
            .foreign_key("user_id", AccountView::owner, BankEvent::user_id)
            .on(event_types::ACCOUNT_CREATED, AccountView::on_account_created)
            .on(event_types::FUNDS_ADDED, AccountView::on_funds_added)
            .on(event_types::ACCOUNT_RENAMED, AccountView::on_account_renamed)
            .on(event_types::USER_CREATED, AccountView::on_user_email)
            .on(event_types::USER_EMAIL_CHANGED, AccountView::on_user_email)
            .build()
            .unwrap()
    }

    fn cache() -> ProjectionCache<BankEvent, AccountView> {
        ProjectionCache::new("accounts", schema(), StashConfig::default())
    }

    #[test]
    fn creates_then_updates() {
        let cache = cache();
        let account = Uuid::new_v4();

        cache.process(account_created(account, "x", None));
        cache.process(funds_added(account, 100));

        let view = cache.get(account).unwrap();
        assert_eq!(view.name, "x");
        assert_eq!(view.balance, 100);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn redelivery_is_harmless() {
        let cache = cache();
        let account = Uuid::new_v4();
        let deposit = funds_added(account, 100);

        cache.process(account_created(account, "x", None));
        cache.process(deposit.clone());
        let once = cache.get(account).unwrap();
        cache.process(deposit);

        assert_eq!(cache.get(account).unwrap(), once);
    }

    #[test]
    fn update_before_creation_waits_in_the_primary_stash() {
        let cache = cache();
        let account = Uuid::new_v4();

        cache.process(funds_added(account, 40));
        assert!(cache.is_empty());
        assert_eq!(cache.stash_stats().primary_messages, 1);

        cache.process(account_created(account, "x", None));

        assert_eq!(cache.get(account).unwrap().balance, 40);
        assert_eq!(cache.stash_stats(), StashStats::default());
    }

    #[test]
    fn foreign_message_before_its_entry_is_drained_later() {
        let cache = cache();
        let account = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.process(user_created(user, "u@example.com"));
        assert_eq!(cache.stash_stats().foreign_messages, 1);

        cache.process(account_created(account, "x", Some(user)));

        let view = cache.get(account).unwrap();
        assert_eq!(view.user_email.as_deref(), Some("u@example.com"));
        assert_eq!(cache.resolve_foreign(user), Some(account));
        assert_eq!(cache.stash_stats(), StashStats::default());
    }

    #[test]
    fn foreign_message_after_indexing_applies_directly() {
        let cache = cache();
        let account = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.process(account_created(account, "x", Some(user)));
        cache.process(BankEvent::UserEmailChanged {
            user_id: user,
            email: "new@example.com".to_string(),
        });

        assert_eq!(
            cache.get(account).unwrap().user_email.as_deref(),
            Some("new@example.com")
        );
    }

    #[test]
    fn unresolved_foreign_message_is_never_applied_elsewhere() {
        let cache = cache();
        let account = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        cache.process(account_created(account, "x", Some(Uuid::new_v4())));
        cache.process(user_created(stranger, "s@example.com"));

        assert_eq!(cache.get(account).unwrap().user_email, None);
        assert_eq!(cache.stash_stats().foreign_messages, 1);
    }

    #[test]
    fn foreign_key_revealed_by_a_drained_message_settles_in_the_same_pass() {
        // Accounts learn their owner from a later event
        let schema = DtoSchema::builder("AccountView")
            .primary_key("account_id", AccountView::key, BankEvent::account_id)
            .creation_event(event_types::ACCOUNT_CREATED)
            .foreign_key("user_id", AccountView::owner, BankEvent::user_id)
            .on(event_types::ACCOUNT_CREATED, AccountView::on_account_created)
            .on(event_types::ACCOUNT_RENAMED, |view: &mut AccountView, event: &BankEvent| {
                view.on_account_renamed(event);
                if let BankEvent::AccountRenamed { name, .. } = event {
                    view.user_id = name.parse().ok();
                }
            })
            .on(event_types::USER_CREATED, AccountView::on_user_email)
            .build()
            .unwrap();
        let cache = ProjectionCache::new("accounts", schema, StashConfig::default());
        let account = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.process(user_created(user, "u@example.com"));
        cache.process(BankEvent::AccountRenamed {
            account_id: account,
            name: user.to_string(),
        });
        cache.process(account_created(account, "x", None));

        let view = cache.get(account).unwrap();
        assert_eq!(view.user_id, Some(user));
        assert_eq!(view.user_email.as_deref(), Some("u@example.com"));
        assert_eq!(cache.stash_stats(), StashStats::default());
    }

    /// Accounts with a second foreign key, the co-owner, kept in `name`.
    /// `UserCreated` names the co-owner in its email and bumps `balance`.
    fn co_owned_cache() -> ProjectionCache<BankEvent, AccountView> {
        let schema = DtoSchema::builder("AccountView")
            .primary_key("account_id", AccountView::key, BankEvent::account_id)
            .creation_event(event_types::ACCOUNT_CREATED)
            .foreign_key("user_id", AccountView::owner, BankEvent::user_id)
            .foreign_key(
                "co_owner",
                |view: &AccountView| view.name.parse().ok(),
                |event: &BankEvent| match event {
                    BankEvent::UserCreated { email, .. } => email.parse().ok(),
                    _ => None,
                },
            )
            .on(event_types::ACCOUNT_CREATED, AccountView::on_account_created)
            .on(event_types::ACCOUNT_RENAMED, AccountView::on_account_renamed)
            .on(event_types::USER_CREATED, |view: &mut AccountView, _: &BankEvent| {
                view.balance += 1;
            })
            .build()
            .unwrap();
        ProjectionCache::new("accounts", schema, StashConfig::default())
    }

    #[test]
    fn message_resolved_on_one_foreign_key_is_not_reapplied_through_another() {
        let cache = co_owned_cache();
        let account = Uuid::new_v4();
        let user = Uuid::new_v4();
        let co_owner = Uuid::new_v4();

        cache.process(account_created(account, "x", Some(user)));
        cache.process(user_created(user, &co_owner.to_string()));
        assert_eq!(cache.get(account).unwrap().balance, 1);
        assert_eq!(cache.stash_stats().foreign_messages, 1);

        cache.process(BankEvent::AccountRenamed {
            account_id: account,
            name: co_owner.to_string(),
        });

        assert_eq!(cache.resolve_foreign(co_owner), Some(account));
        assert_eq!(cache.get(account).unwrap().balance, 1);
        assert_eq!(cache.stash_stats(), StashStats::default());
    }

    #[test]
    fn message_stashed_under_two_foreign_keys_applies_once() {
        let cache = co_owned_cache();
        let account = Uuid::new_v4();
        let user = Uuid::new_v4();
        let co_owner = Uuid::new_v4();

        cache.process(user_created(user, &co_owner.to_string()));
        let stats = cache.stash_stats();
        assert_eq!((stats.foreign_keys, stats.foreign_messages), (2, 2));

        cache.process(account_created(account, &co_owner.to_string(), Some(user)));

        assert_eq!(cache.get(account).unwrap().balance, 1);
        assert_eq!(cache.stash_stats(), StashStats::default());
    }

    #[test]
    fn foreign_messages_keep_stream_order_while_their_key_is_indexed() {
        for _ in 0..500 {
            let cache = Arc::new(cache());
            let account = Uuid::new_v4();
            let user = Uuid::new_v4();
            cache.process(user_created(user, "old@example.com"));

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let accounts = {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.process(account_created(account, "x", Some(user)));
                })
            };
            let users = {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.process(BankEvent::UserEmailChanged {
                        user_id: user,
                        email: "new@example.com".to_string(),
                    });
                })
            };
            accounts.join().unwrap();
            users.join().unwrap();

            assert_eq!(
                cache.get(account).unwrap().user_email.as_deref(),
                Some("new@example.com")
            );
            assert_eq!(cache.stash_stats(), StashStats::default());
        }
    }

    #[test]
    fn unhandled_and_uncorrelated_messages_are_dropped() {
        let schema = DtoSchema::builder("AccountView")
            .primary_key("account_id", AccountView::key, BankEvent::account_id)
            .on(event_types::ACCOUNT_CREATED, AccountView::on_account_created)
            .on(event_types::USER_CREATED, AccountView::on_user_email)
            .build()
            .unwrap();
        let cache = ProjectionCache::new("accounts", schema, StashConfig::default());

        cache.process(funds_added(Uuid::new_v4(), 1));
        cache.process(user_created(Uuid::new_v4(), "u@example.com"));

        assert!(cache.is_empty());
        assert_eq!(cache.stash_stats(), StashStats::default());
    }

    #[test]
    fn stash_bound_evicts_oldest() {
        let cache = ProjectionCache::new(
            "accounts",
            schema(),
            StashConfig::new().with_max_per_key(2).with_max_keys(2),
        );
        let account = Uuid::new_v4();
        for amount in 1..=3 {
            cache.process(funds_added(account, amount));
        }
        assert_eq!(cache.stash_stats().primary_messages, 2);

        cache.process(funds_added(Uuid::new_v4(), 1));
        cache.process(funds_added(Uuid::new_v4(), 1));
        let stats = cache.stash_stats();
        assert_eq!(stats.primary_keys, 2);
        assert_eq!(stats.primary_messages, 2);

        // The evicted account's deposits are gone for good
        cache.process(account_created(account, "x", None));
        assert_eq!(cache.get(account).unwrap().balance, 0);
    }

    #[test]
    fn get_all_is_a_live_view() {
        let cache = cache();
        let account = Uuid::new_v4();
        cache.process(account_created(account, "x", None));

        {
            let all = cache.get_all();
            assert_eq!(all.len(), 1);
            assert_eq!(all[&account].name, "x");
        }

        cache.process(funds_added(account, 7));
        assert_eq!(cache.get_all()[&account].balance, 7);
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[test]
    fn concurrent_streams_converge() {
        let cache = Arc::new(cache());
        let pairs: Vec<(Uuid, Uuid)> = (0..200).map(|_| (Uuid::new_v4(), Uuid::new_v4())).collect();

        let accounts = {
            let cache = Arc::clone(&cache);
            let pairs = pairs.clone();
            std::thread::spawn(move || {
                for (account, user) in pairs {
                    cache.process(account_created(account, "x", Some(user)));
                    cache.process(funds_added(account, 1));
                }
            })
        };
        let users = {
            let cache = Arc::clone(&cache);
            let pairs = pairs.clone();
            std::thread::spawn(move || {
                for (_, user) in pairs {
                    cache.process(user_created(user, "u@example.com"));
                }
            })
        };
        accounts.join().unwrap();
        users.join().unwrap();

        for (account, _) in pairs {
            let view = cache.get(account).unwrap();
            assert_eq!(view.balance, 1);
            assert_eq!(view.user_email.as_deref(), Some("u@example.com"));
        }
        assert_eq!(cache.stash_stats(), StashStats::default());
    }
}
