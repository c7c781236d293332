//! Explicit registration of cached DTO types.
//!
//! A [`DtoSchema`] tells a [`ProjectionCache`](crate::cache::ProjectionCache)
//! everything it needs to know about one DTO type:
//!
//! - the **primary key**: how to read it from a DTO, and how to read the
//!   matching correlation id from a message
//! - the **creation event**: which event type establishes a new entry
//!   (optional; without one, any primary message for an unknown key creates it)
//! - the **foreign keys**: correlation ids pointing at other entities, read
//!   from the DTO once known and from the messages of those entities
//! - the **handlers**: one applier per event type tag
//!
//! Every mistake is reported by [`DtoSchemaBuilder::build`] as a
//! [`ConfigurationError`], before any event is processed.
//!
//! # Example
//!
//! ```ignore
//! let schema = DtoSchema::<BankEvent, AccountView>::builder("AccountView")
//!     .primary_key("account_id", AccountView::key, BankEvent::account_id)
//!     .creation_event(event_types::ACCOUNT_CREATED)
//!     .foreign_key("user_id", AccountView::owner, BankEvent::user_id)
//!     .on(event_types::ACCOUNT_CREATED, AccountView::on_account_created)
//!     .on(event_types::FUNDS_ADDED, AccountView::on_funds_added)
//!     .on(event_types::USER_CREATED, AccountView::on_user_email)
//!     .build()?;
//! ```

use eventview_core::event::Event;
use eventview_core::projection::ConfigurationError;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Reads a correlation id from a DTO.
pub type DtoKey<D> = Arc<dyn Fn(&D) -> Option<Uuid> + Send + Sync>;

/// Reads a correlation id from a message.
pub type MessageKey<M> = Arc<dyn Fn(&M) -> Option<Uuid> + Send + Sync>;

/// Applies one message to a DTO.
pub type Applier<M, D> = Arc<dyn Fn(&mut D, &M) + Send + Sync>;

/// Correlation ids found on one DTO or message.
pub type Correlations = SmallVec<[Uuid; 4]>;

/// A named correlation id, read from both DTOs and messages.
pub struct KeySelector<M, D> {
    name: String,
    dto: DtoKey<D>,
    message: MessageKey<M>,
}

impl<M, D> KeySelector<M, D> {
    fn new<FD, FM>(name: impl Into<String>, dto: FD, message: FM) -> Self
    where
        FD: Fn(&D) -> Option<Uuid> + Send + Sync + 'static,
        FM: Fn(&M) -> Option<Uuid> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            dto: Arc::new(dto),
            message: Arc::new(message),
        }
    }

    /// The key's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key's value on `dto`.
    pub fn of_dto(&self, dto: &D) -> Option<Uuid> {
        (self.dto)(dto)
    }

    /// The key's value on `message`.
    pub fn of_message(&self, message: &M) -> Option<Uuid> {
        (self.message)(message)
    }
}

impl<M, D> Clone for KeySelector<M, D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            dto: Arc::clone(&self.dto),
            message: Arc::clone(&self.message),
        }
    }
}

impl<M, D> fmt::Debug for KeySelector<M, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySelector")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Validated registration of one DTO type.
///
/// Cheap to clone; accessors and handlers are shared.
pub struct DtoSchema<M, D> {
    dto: String,
    primary: KeySelector<M, D>,
    creation: Option<String>,
    foreign: Vec<KeySelector<M, D>>,
    handlers: HashMap<String, Applier<M, D>>,
}

impl<M, D> DtoSchema<M, D>
where
    M: Event,
{
    /// Start registering the DTO type `dto`.
    #[must_use]
    pub fn builder(dto: impl Into<String>) -> DtoSchemaBuilder<M, D> {
        DtoSchemaBuilder {
            dto: dto.into(),
            primary: None,
            creation: None,
            foreign: Vec::new(),
            handlers: HashMap::new(),
            error: None,
        }
    }

    /// The DTO type name.
    #[must_use]
    pub fn dto_name(&self) -> &str {
        &self.dto
    }

    /// The primary key.
    #[must_use]
    pub const fn primary_key(&self) -> &KeySelector<M, D> {
        &self.primary
    }

    /// The creation event type, if one was registered.
    #[must_use]
    pub fn creation_event(&self) -> Option<&str> {
        self.creation.as_deref()
    }

    /// The foreign keys.
    #[must_use]
    pub fn foreign_keys(&self) -> &[KeySelector<M, D>] {
        &self.foreign
    }

    /// Whether a handler is registered for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, in no particular order.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Whether `message` establishes a new entry.
    pub fn creates(&self, message: &M) -> bool {
        self.creation
            .as_deref()
            .is_none_or(|creation| creation == message.event_type())
    }

    /// The primary key a message correlates to.
    pub fn primary_of(&self, message: &M) -> Option<Uuid> {
        self.primary.of_message(message)
    }

    /// Foreign key values a message correlates to, without duplicates.
    pub fn foreign_of(&self, message: &M) -> Correlations {
        dedup(self.foreign.iter().filter_map(|key| key.of_message(message)))
    }

    /// Foreign key values currently set on a DTO, without duplicates.
    pub fn foreign_values(&self, dto: &D) -> Correlations {
        dedup(self.foreign.iter().filter_map(|key| key.of_dto(dto)))
    }

    /// Apply `message` to `dto` with its registered handler.
    ///
    /// Returns `false` if no handler is registered for the message's type.
    pub fn apply(&self, dto: &mut D, message: &M) -> bool {
        match self.handlers.get(message.event_type()) {
            Some(handler) => {
                handler(dto, message);
                true
            }
            None => false,
        }
    }
}

fn dedup(values: impl Iterator<Item = Uuid>) -> Correlations {
    let mut unique = Correlations::new();
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    unique
}

impl<M, D> Clone for DtoSchema<M, D> {
    fn clone(&self) -> Self {
        Self {
            dto: self.dto.clone(),
            primary: self.primary.clone(),
            creation: self.creation.clone(),
            foreign: self.foreign.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

impl<M, D> fmt::Debug for DtoSchema<M, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("DtoSchema")
            .field("dto", &self.dto)
            .field("primary", &self.primary.name)
            .field("creation", &self.creation)
            .field(
                "foreign",
                &self.foreign.iter().map(KeySelector::name).collect::<Vec<_>>(),
            )
            .field("handlers", &handlers)
            .finish()
    }
}

/// Builder for [`DtoSchema`].
///
/// Registration mistakes are remembered and reported by [`build`](Self::build);
/// the first one wins.
pub struct DtoSchemaBuilder<M, D> {
    dto: String,
    primary: Option<KeySelector<M, D>>,
    creation: Option<String>,
    foreign: Vec<KeySelector<M, D>>,
    handlers: HashMap<String, Applier<M, D>>,
    error: Option<ConfigurationError>,
}

impl<M, D> DtoSchemaBuilder<M, D>
where
    M: Event,
{
    /// Declare the primary key.
    ///
    /// `dto` reads it from a cached entry, `message` reads the correlation id
    /// from a message; messages returning `Some` are primary messages.
    #[must_use]
    pub fn primary_key<FD, FM>(mut self, name: impl Into<String>, dto: FD, message: FM) -> Self
    where
        FD: Fn(&D) -> Option<Uuid> + Send + Sync + 'static,
        FM: Fn(&M) -> Option<Uuid> + Send + Sync + 'static,
    {
        let key = KeySelector::new(name, dto, message);
        match &self.primary {
            Some(first) => {
                let error = ConfigurationError::DuplicatePrimaryKey {
                    dto: self.dto.clone(),
                    first: first.name.clone(),
                    second: key.name,
                };
                self.fail(error);
            }
            None => self.primary = Some(key),
        }
        self
    }

    /// Declare the event type that creates new entries.
    #[must_use]
    pub fn creation_event(mut self, event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        match &self.creation {
            Some(first) => {
                let error = ConfigurationError::DuplicateCreationEvent {
                    dto: self.dto.clone(),
                    first: first.clone(),
                    second: event_type,
                };
                self.fail(error);
            }
            None => self.creation = Some(event_type),
        }
        self
    }

    /// Declare a foreign key.
    ///
    /// `dto` reads the referenced id from a cached entry, `message` reads it
    /// from the referenced entity's messages.
    #[must_use]
    pub fn foreign_key<FD, FM>(mut self, name: impl Into<String>, dto: FD, message: FM) -> Self
    where
        FD: Fn(&D) -> Option<Uuid> + Send + Sync + 'static,
        FM: Fn(&M) -> Option<Uuid> + Send + Sync + 'static,
    {
        let key = KeySelector::new(name, dto, message);
        if self.foreign.iter().any(|existing| existing.name == key.name) {
            let error = ConfigurationError::DuplicateForeignKey {
                dto: self.dto.clone(),
                name: key.name,
            };
            self.fail(error);
        } else {
            self.foreign.push(key);
        }
        self
    }

    /// Register the handler for `event_type`.
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut D, &M) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            let error = ConfigurationError::DuplicateHandler {
                dto: self.dto.clone(),
                event_type,
            };
            self.fail(error);
        } else {
            self.handlers.insert(event_type, Arc::new(handler));
        }
        self
    }

    /// Validate the registration.
    ///
    /// # Errors
    ///
    /// - the first registration mistake (duplicate primary key, creation
    ///   event, foreign key or handler)
    /// - [`ConfigurationError::MissingPrimaryKey`] if no primary key was declared
    /// - [`ConfigurationError::UnhandledCreationEvent`] if the creation event
    ///   has no handler
    pub fn build(self) -> Result<DtoSchema<M, D>, ConfigurationError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let Some(primary) = self.primary else {
            return Err(ConfigurationError::MissingPrimaryKey { dto: self.dto });
        };
        if let Some(creation) = &self.creation {
            if !self.handlers.contains_key(creation) {
                return Err(ConfigurationError::UnhandledCreationEvent {
                    event_type: creation.clone(),
                });
            }
        }

        Ok(DtoSchema {
            dto: self.dto,
            primary,
            creation: self.creation,
            foreign: self.foreign,
            handlers: self.handlers,
        })
    }

    fn fail(&mut self, error: ConfigurationError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}
