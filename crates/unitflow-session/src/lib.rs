//! Session and unit of work for unitflow.
//!
//! `unitflow-session` is the **unit-of-work layer**. It owns the persistence context (identity
//! map plus entity and collection entries), the ordered action queue, the cascade engine and the
//! event listeners that decide what every session operation does.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: one managed instance per (root entity, identifier).
//! - **Action queue**: inserts, updates, deletes and collection actions, drained in
//!   dependency-safe order at flush time.
//! - **Cascades**: operations propagate along associations that carry the matching style.
//! - **Loading**: batched, polymorphic, two-phase loads through the initializer graph.
//!
//! Every operation that touches the database is `async`, takes a `Cx` and resolves to an
//! `Outcome`. A session is driven by one task at a time (`&mut self`).
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel).build();
//! let mut session = factory.open_session(connection);
//!
//! let pig = Entity::new(factory.persister("GuineaPig")?);
//! pig.set_id(5_i64);
//! pig.set("name", "Hamtaro")?;
//! session.persist(&cx, &pig).await?;
//! session.commit(&cx).await?;
//! ```

pub mod action;
pub mod cascade;
pub mod config;
pub mod context;
mod event;
pub mod factory;
pub mod listener;
mod loader;
pub mod query;

pub use action::{Action, ActionQueue, BeforeCompletion};
pub use cascade::{CascadeContext, CascadePoint, CascadingAction};
pub use config::{FlushMode, SessionConfig, SessionFactoryOptions};
pub use context::{EntityKey, EntityStatus, PersistenceContext};
pub use factory::{SessionFactory, SessionFactoryBuilder};
pub use listener::{EntityListener, EventType, Interceptor, ListenerRegistry};
pub use query::NativeQuery;

use asupersync::{Cx, Outcome};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use unitflow_core::{Connection, Entity, Error, PersistentCollection, Result, try_result};
use unitflow_query::BatchCoordinator;

/// Future of a recursive session step (cascades, loads).
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` will abort the operation (e.g., prevent commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send + Sync>;

/// Holds registered session-level event callbacks.
///
/// These are fired at key points in the session lifecycle:
/// before/after flush, commit, and rollback.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session
// ============================================================================

/// The unit-of-work manager over one connection.
///
/// It tracks instances loaded from or persisted to the database and coordinates writing their
/// changes back at flush time.
pub struct Session<C: Connection> {
    pub(crate) factory: SessionFactory,
    pub(crate) connection: C,
    pub(crate) config: SessionConfig,
    pub(crate) context: PersistenceContext,
    pub(crate) actions: ActionQueue,
    pub(crate) batch: BatchCoordinator,
    pub(crate) in_transaction: bool,
    pub(crate) closed: bool,
    /// Set while a flush is running, so nested auto-flushes are skipped.
    pub(crate) flushing: bool,
    pub(crate) callbacks: SessionEventCallbacks,
    /// Enabled filter names; part of every query-cache key.
    pub(crate) filters: BTreeSet<String>,
    /// Tables written since the transaction began; invalidated again when it ends.
    pub(crate) written_spaces: Vec<String>,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("entries", &self.context.entry_count())
            .field("collections", &self.context.collection_count())
            .field("pending_actions", &self.actions.len())
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.closed)
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl<C: Connection> Session<C> {
    pub(crate) fn new(factory: SessionFactory, connection: C, config: SessionConfig) -> Self {
        let options = factory.options();
        let actions = ActionQueue::new(options.order_updates);
        let batch = BatchCoordinator::new(options.jdbc_batch_size);
        Self {
            factory,
            connection,
            config,
            context: PersistenceContext::new(),
            actions,
            batch,
            in_transaction: false,
            closed: false,
            flushing: false,
            callbacks: SessionEventCallbacks::default(),
            filters: BTreeSet::new(),
            written_spaces: Vec::new(),
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.config.flush_mode = mode;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Batch round trips executed by this session so far.
    pub fn batch_round_trips(&self) -> u64 {
        self.batch.round_trips()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::IllegalState("session is closed".to_string()));
        }
        Ok(())
    }

    /// Refuse work after a failed flush.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.actions.is_poisoned() {
            return Err(Error::IllegalState(
                "a previous flush failed; the session must be discarded".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + Sync + 'static) {
        self.callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + Sync + 'static) {
        self.callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit; it can abort the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + Sync + 'static) {
        self.callbacks.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + Sync + 'static) {
        self.callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + Sync + 'static) {
        self.callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Persistence context
    // ========================================================================

    /// Is `entity` associated with this session (managed, read-only, deleted or a registered
    /// reference)?
    pub fn contains(&self, entity: &Entity) -> bool {
        if self
            .context
            .entry(entity)
            .is_some_and(|entry| !entry.status.is_deleted_or_gone())
        {
            return true;
        }
        let key = EntityKey::of(&entity.persister(), entity.id());
        self.context
            .entity(&key)
            .is_some_and(|registered| registered.ptr_eq(entity) && !entity.is_initialized())
    }

    pub fn status_of(&self, entity: &Entity) -> Option<EntityStatus> {
        self.context.entry(entity).map(|entry| entry.status)
    }

    /// Mark a managed instance read-only (never dirty-checked) or back to managed.
    pub fn set_read_only(&mut self, entity: &Entity, read_only: bool) -> Result<()> {
        let entry = self.context.entry_mut(entity).ok_or_else(|| {
            Error::IllegalArgument(format!("instance is not managed: {:?}", entity))
        })?;
        match (entry.status, read_only) {
            (EntityStatus::Managed, true) => entry.status = EntityStatus::ReadOnly,
            (EntityStatus::ReadOnly, false) => {
                entry.status = EntityStatus::Managed;
                entry.loaded_state = Some(entity.snapshot()?);
            }
            _ => {}
        }
        Ok(())
    }

    /// Stop managing `entity` and its collections; pending actions are unaffected.
    pub fn detach(&mut self, entity: &Entity) {
        let Some(entry) = self.context.remove_entry(entity) else {
            return;
        };
        let key = entry.key();
        if self
            .context
            .entity(&key)
            .is_some_and(|registered| registered.ptr_eq(entity))
        {
            self.context.remove_entity(&key);
        }
        self.context.remove_natural_id(&key);
        let owned: Vec<PersistentCollection> = self
            .context
            .collection_entries()
            .filter(|ce| ce.owner.ptr_eq(entity))
            .map(|ce| ce.collection.clone())
            .collect();
        for collection in &owned {
            self.context.remove_collection(collection);
        }
        tracing::debug!(entity = ?entity, "Detached");
    }

    /// Detach everything and forget pending actions.
    pub fn clear(&mut self) {
        self.context.clear();
        self.actions.clear();
        self.batch.abort();
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    /// Pending actions in execution order, one description each.
    pub fn action_queue_description(&self) -> Vec<String> {
        self.actions.describe()
    }

    pub fn has_pending_actions(&self) -> bool {
        self.actions.has_pending()
    }

    pub fn enable_filter(&mut self, name: impl Into<String>) {
        self.filters.insert(name.into());
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.filters.remove(name);
    }

    pub(crate) fn enabled_filters(&self) -> Vec<String> {
        self.filters.iter().cloned().collect()
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_open());
        if self.in_transaction {
            return Outcome::Ok(());
        }

        match self.connection.execute(cx, "BEGIN", &[]).await {
            Outcome::Ok(_) => {
                tracing::debug!("Transaction started");
                self.in_transaction = true;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Begin a transaction when `auto_begin` is set and none is active.
    pub(crate) async fn begin_if_needed(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction || !self.config.auto_begin {
            return Outcome::Ok(());
        }
        self.begin(cx).await
    }

    /// Flush (unless the flush mode is manual), run before-completion checks and commit.
    ///
    /// A failed before-completion check rolls the transaction back.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_open());
        if self.config.flush_mode != FlushMode::Manual {
            match self.flush(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        match self.before_completion(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Before-completion check failed, rolling back");
                match self.rollback(cx).await {
                    Outcome::Ok(()) | Outcome::Err(_) => {}
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        // Fire before_commit event (can abort)
        if let Err(e) = self.callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if self.in_transaction {
            match self.connection.execute(cx, "COMMIT", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.invalidate_written_spaces();
        self.reset_lock_modes();
        tracing::debug!("Transaction committed");

        if let Err(e) = self.callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Roll back the current transaction and forget pending actions.
    ///
    /// In-memory instances keep their state.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            match self.connection.execute(cx, "ROLLBACK", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction = false;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.invalidate_written_spaces();
        self.actions.clear();
        self.context.clear_deleted_unloaded();
        self.batch.abort();
        self.reset_lock_modes();

        if let Err(e) = self.callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }

        Outcome::Ok(())
    }

    /// Roll back any open transaction and end the session.
    ///
    /// The connection is released when the session is dropped.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Ok(());
        }
        let outcome = if self.in_transaction {
            self.rollback(cx).await
        } else {
            Outcome::Ok(())
        };
        self.clear();
        self.closed = true;
        tracing::debug!("Session closed");
        outcome
    }

    /// Invalidate cached results read from `spaces` and remember them until the transaction ends.
    ///
    /// Another session may cache rows it read while this transaction was open; the second
    /// invalidation at commit or rollback discards those.
    pub(crate) fn record_written_spaces(&mut self, spaces: &[String]) {
        self.factory.invalidate_spaces(spaces);
        for space in spaces {
            if !self.written_spaces.contains(space) {
                self.written_spaces.push(space.clone());
            }
        }
    }

    fn invalidate_written_spaces(&mut self) {
        let spaces = std::mem::take(&mut self.written_spaces);
        if !spaces.is_empty() {
            tracing::trace!(spaces = ?spaces, "Invalidating tables written by the transaction");
            self.factory.invalidate_spaces(&spaces);
        }
    }

    /// Locks are held for one transaction.
    fn reset_lock_modes(&mut self) {
        let entities = self.context.entities_in_order();
        for entity in entities {
            if let Some(entry) = self.context.entry_mut(&entity) {
                entry.lock_mode = unitflow_core::LockMode::None;
            }
        }
    }
}
