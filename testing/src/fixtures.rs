//! A small banking domain shared by the workspace's tests.
//!
//! Two aggregates, `Account` and `User`, both emitting [`BankEvent`]s. The
//! [`AccountView`] DTO joins them: it is keyed by account id and carries the
//! owning user's email through the `user_id` foreign key.
//!
//! Every handler on [`AccountView`] is idempotent, so redelivered events leave
//! the view unchanged.

use eventview_core::event::Event;
use eventview_core::stream::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Event type tags of [`BankEvent`].
pub mod event_types {
    /// [`super::BankEvent::AccountCreated`]
    pub const ACCOUNT_CREATED: &str = "AccountCreated.v1";
    /// [`super::BankEvent::FundsAdded`]
    pub const FUNDS_ADDED: &str = "FundsAdded.v1";
    /// [`super::BankEvent::AccountRenamed`]
    pub const ACCOUNT_RENAMED: &str = "AccountRenamed.v1";
    /// [`super::BankEvent::UserCreated`]
    pub const USER_CREATED: &str = "UserCreated.v1";
    /// [`super::BankEvent::UserEmailChanged`]
    pub const USER_EMAIL_CHANGED: &str = "UserEmailChanged.v1";
}

/// Account aggregate category.
pub const ACCOUNT_CATEGORY: &str = "Account";

/// User aggregate category.
pub const USER_CATEGORY: &str = "User";

/// Events of the banking domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankEvent {
    /// An account was opened, optionally for a user.
    AccountCreated {
        /// Account id
        account_id: Uuid,
        /// Display name
        name: String,
        /// Owning user
        user_id: Option<Uuid>,
    },
    /// Money was deposited.
    FundsAdded {
        /// Account id
        account_id: Uuid,
        /// Unique per deposit
        transaction_id: Uuid,
        /// Amount in cents
        amount: i64,
    },
    /// An account got a new display name.
    AccountRenamed {
        /// Account id
        account_id: Uuid,
        /// New display name
        name: String,
    },
    /// A user registered.
    UserCreated {
        /// User id
        user_id: Uuid,
        /// Contact email
        email: String,
    },
    /// A user changed their email.
    UserEmailChanged {
        /// User id
        user_id: Uuid,
        /// New contact email
        email: String,
    },
}

impl Event for BankEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::AccountCreated { .. } => event_types::ACCOUNT_CREATED,
            Self::FundsAdded { .. } => event_types::FUNDS_ADDED,
            Self::AccountRenamed { .. } => event_types::ACCOUNT_RENAMED,
            Self::UserCreated { .. } => event_types::USER_CREATED,
            Self::UserEmailChanged { .. } => event_types::USER_EMAIL_CHANGED,
        }
    }
}

impl BankEvent {
    /// The account this event correlates to, if it is an account event.
    #[must_use]
    pub const fn account_id(&self) -> Option<Uuid> {
        match self {
            Self::AccountCreated { account_id, .. }
            | Self::FundsAdded { account_id, .. }
            | Self::AccountRenamed { account_id, .. } => Some(*account_id),
            Self::UserCreated { .. } | Self::UserEmailChanged { .. } => None,
        }
    }

    /// The user this event correlates to, if it is a user event.
    #[must_use]
    pub const fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::UserCreated { user_id, .. } | Self::UserEmailChanged { user_id, .. } => {
                Some(*user_id)
            }
            Self::AccountCreated { .. } | Self::FundsAdded { .. } | Self::AccountRenamed { .. } => {
                None
            }
        }
    }

    /// The aggregate stream this event is appended to.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match (self.account_id(), self.user_id()) {
            (Some(account_id), _) => StreamId::new(format!("{ACCOUNT_CATEGORY}-{account_id}")),
            (None, Some(user_id)) => StreamId::new(format!("{USER_CATEGORY}-{user_id}")),
            (None, None) => StreamId::new(ACCOUNT_CATEGORY),
        }
    }
}

/// Denormalized account view joining the owning user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountView {
    /// Primary key
    pub account_id: Option<Uuid>,
    /// Display name
    pub name: String,
    /// Sum of all deposits
    pub balance: i64,
    /// Foreign key to the owning user
    pub user_id: Option<Uuid>,
    /// Email of the owning user
    pub user_email: Option<String>,
    /// Deposits already counted
    pub transactions: BTreeSet<Uuid>,
}

impl AccountView {
    /// Primary key accessor.
    #[must_use]
    pub const fn key(&self) -> Option<Uuid> {
        self.account_id
    }

    /// Foreign key accessor for the owning user.
    #[must_use]
    pub const fn owner(&self) -> Option<Uuid> {
        self.user_id
    }

    /// Apply [`BankEvent::AccountCreated`].
    pub fn on_account_created(&mut self, event: &BankEvent) {
        if let BankEvent::AccountCreated {
            account_id,
            name,
            user_id,
        } = event
        {
            self.account_id = Some(*account_id);
            self.name.clone_from(name);
            self.user_id = *user_id;
        }
    }

    /// Apply [`BankEvent::FundsAdded`]; a repeated transaction is ignored.
    pub fn on_funds_added(&mut self, event: &BankEvent) {
        if let BankEvent::FundsAdded {
            transaction_id,
            amount,
            ..
        } = event
        {
            if self.transactions.insert(*transaction_id) {
                self.balance += amount;
            }
        }
    }

    /// Apply [`BankEvent::AccountRenamed`].
    pub fn on_account_renamed(&mut self, event: &BankEvent) {
        if let BankEvent::AccountRenamed { name, .. } = event {
            self.name.clone_from(name);
        }
    }

    /// Apply [`BankEvent::UserCreated`] or [`BankEvent::UserEmailChanged`].
    pub fn on_user_email(&mut self, event: &BankEvent) {
        if let BankEvent::UserCreated { email, .. } | BankEvent::UserEmailChanged { email, .. } =
            event
        {
            self.user_email = Some(email.clone());
        }
    }
}

/// Shorthand for [`BankEvent::AccountCreated`].
#[must_use]
pub fn account_created(account_id: Uuid, name: &str, user_id: Option<Uuid>) -> BankEvent {
    BankEvent::AccountCreated {
        account_id,
        name: name.to_string(),
        user_id,
    }
}

/// Shorthand for [`BankEvent::FundsAdded`] with a fresh transaction id.
#[must_use]
pub fn funds_added(account_id: Uuid, amount: i64) -> BankEvent {
    BankEvent::FundsAdded {
        account_id,
        transaction_id: Uuid::new_v4(),
        amount,
    }
}

/// Shorthand for [`BankEvent::UserCreated`].
#[must_use]
pub fn user_created(user_id: Uuid, email: &str) -> BankEvent {
    BankEvent::UserCreated {
        user_id,
        email: email.to_string(),
    }
}
