//! Entity lifecycle listeners and the session interceptor.
//!
//! Listeners are registered once per session factory. The registry is immutable after it is
//! built, so sessions read it without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use unitflow_core::{Entity, Result};

/// Entity lifecycle events delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `persist` reached a transient instance, before its identifier is generated.
    PrePersist,
    /// `remove` reached a managed instance, before it is marked deleted.
    PreRemove,
    PreInsert,
    PostInsert,
    PreUpdate,
    PostUpdate,
    PreDelete,
    PostDelete,
    /// A row is about to hydrate an instance.
    PreLoad,
    /// An instance finished loading.
    PostLoad,
}

/// Receives entity lifecycle events.
///
/// Returning `Err` aborts the operation that fired the event.
pub trait EntityListener: Send + Sync {
    fn on_event(&self, event: EventType, entity: &Entity) -> Result<()>;
}

impl<F> EntityListener for F
where
    F: Fn(EventType, &Entity) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: EventType, entity: &Entity) -> Result<()> {
        self(event, entity)
    }
}

struct Registration {
    /// Entity name the listener is restricted to, if any.
    entity: Option<String>,
    listener: Arc<dyn EntityListener>,
}

impl Registration {
    fn applies_to(&self, entity_name: &str) -> bool {
        self.entity.as_deref().is_none_or(|name| name == entity_name)
    }
}

/// Event type → listeners, in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<EventType, Vec<Registration>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(EventType, usize)> = self
            .listeners
            .iter()
            .map(|(event, regs)| (*event, regs.len()))
            .collect();
        counts.sort_by_key(|(event, _)| format!("{:?}", event));
        f.debug_struct("ListenerRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

impl ListenerRegistry {
    pub fn builder() -> ListenerRegistryBuilder {
        ListenerRegistryBuilder::default()
    }

    /// Deliver `event` to every listener registered for it and the entity's type.
    pub fn fire(&self, event: EventType, entity: &Entity) -> Result<()> {
        let Some(registrations) = self.listeners.get(&event) else {
            return Ok(());
        };
        let name = entity.entity_name();
        for registration in registrations.iter().filter(|r| r.applies_to(&name)) {
            registration.listener.on_event(event, entity)?;
        }
        Ok(())
    }

    /// Is any listener registered for `event` on entities named `entity_name`?
    pub fn has_any(&self, event: EventType, entity_name: &str) -> bool {
        self.listeners
            .get(&event)
            .is_some_and(|regs| regs.iter().any(|r| r.applies_to(entity_name)))
    }

    /// Number of listeners registered for `event`.
    pub fn count(&self, event: EventType) -> usize {
        self.listeners.get(&event).map_or(0, Vec::len)
    }
}

/// Collects listeners into an immutable [`ListenerRegistry`].
#[derive(Default)]
pub struct ListenerRegistryBuilder {
    listeners: HashMap<EventType, Vec<Registration>>,
}

impl ListenerRegistryBuilder {
    /// Listen to `event` on every entity.
    pub fn on(mut self, event: EventType, listener: impl EntityListener + 'static) -> Self {
        self.listeners
            .entry(event)
            .or_default()
            .push(Registration {
                entity: None,
                listener: Arc::new(listener),
            });
        self
    }

    /// Listen to `event` on entities named `entity`.
    pub fn on_entity(
        mut self,
        event: EventType,
        entity: impl Into<String>,
        listener: impl EntityListener + 'static,
    ) -> Self {
        self.listeners
            .entry(event)
            .or_default()
            .push(Registration {
                entity: Some(entity.into()),
                listener: Arc::new(listener),
            });
        self
    }

    pub fn build(self) -> ListenerRegistry {
        ListenerRegistry {
            listeners: self.listeners,
        }
    }
}

/// Session-wide notifications about entity state changes.
///
/// Every method defaults to doing nothing; returning `Err` aborts the operation.
pub trait Interceptor: Send + Sync {
    /// A transient instance is about to be scheduled for insertion.
    fn on_persist(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    /// A managed instance is about to be scheduled for deletion.
    fn on_remove(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    /// Flush found modified properties of a managed instance.
    fn on_flush_dirty(&self, _entity: &Entity, _dirty: &[&str]) -> Result<()> {
        Ok(())
    }
}
