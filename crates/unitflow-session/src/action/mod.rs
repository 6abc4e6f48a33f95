//! Pending mutations.
//!
//! Actions are scheduled by the event listeners and the flush, owned by the
//! [`ActionQueue`] until executed, and executed strictly in queue order.

mod execute;
mod queue;

pub use queue::{ActionQueue, BeforeCompletion, QueueCheckpoint};

use std::sync::Arc;
use unitflow_core::{CollectionPersister, Entity, EntityPersister, PersistentCollection, Value};

/// Insert of a new instance. The row state is read when the action executes.
#[derive(Debug, Clone)]
pub struct EntityInsertAction {
    pub entity: Entity,
    pub persister: Arc<EntityPersister>,
    /// Generated or assigned identifier; `Null` for identity columns until the insert runs.
    pub id: Value,
}

/// Update of a managed instance found dirty by a flush.
#[derive(Debug, Clone)]
pub struct EntityUpdateAction {
    pub entity: Entity,
    pub persister: Arc<EntityPersister>,
    pub id: Value,
    /// Full column state to write, carrying `next_version` at the version index.
    pub state: Vec<Value>,
    /// Indices of the modified properties.
    pub dirty: Vec<usize>,
    pub previous_version: Option<Value>,
    pub next_version: Option<Value>,
}

/// Delete of a managed instance or of an uninitialized reference.
#[derive(Debug, Clone)]
pub struct EntityDeleteAction {
    pub entity: Entity,
    pub persister: Arc<EntityPersister>,
    pub id: Value,
    pub version: Option<Value>,
    /// Deleted by identifier alone, without loading; no version check.
    pub unloaded: bool,
}

/// First write of a collection's rows.
#[derive(Debug, Clone)]
pub struct CollectionRecreateAction {
    pub collection: PersistentCollection,
    pub persister: Arc<CollectionPersister>,
    pub key: Value,
    pub elements: Vec<Entity>,
}

/// Row-level changes of a loaded collection.
#[derive(Debug, Clone)]
pub struct CollectionUpdateAction {
    pub collection: PersistentCollection,
    pub persister: Arc<CollectionPersister>,
    pub key: Value,
    pub added: Vec<Entity>,
    pub removed: Vec<Entity>,
}

/// Removal of every row of a collection.
#[derive(Debug, Clone)]
pub struct CollectionRemoveAction {
    pub collection: PersistentCollection,
    pub persister: Arc<CollectionPersister>,
    pub key: Value,
    /// The database deletes the rows with the owner; nothing to execute.
    pub cascade_delete_enabled: bool,
}

/// A pending mutation.
#[derive(Debug, Clone)]
pub enum Action {
    Insert(EntityInsertAction),
    /// Insert whose identifier is generated by the database; executed immediately.
    IdentityInsert(EntityInsertAction),
    Update(EntityUpdateAction),
    Delete(EntityDeleteAction),
    /// Delete of an element orphaned by its owner; runs before any update.
    OrphanRemoval(EntityDeleteAction),
    CollectionRecreate(CollectionRecreateAction),
    CollectionUpdate(CollectionUpdateAction),
    CollectionRemove(CollectionRemoveAction),
}

impl Action {
    /// Short description used in logs, errors and [`ActionQueue::describe`].
    pub fn describe(&self) -> String {
        match self {
            Action::Insert(a) => format!("insert {}", entity_label(&a.persister, &a.id)),
            Action::IdentityInsert(a) => {
                format!("identity-insert {}", entity_label(&a.persister, &a.id))
            }
            Action::Update(a) => format!("update {}", entity_label(&a.persister, &a.id)),
            Action::Delete(a) => format!("delete {}", entity_label(&a.persister, &a.id)),
            Action::OrphanRemoval(a) => {
                format!("orphan-removal {}", entity_label(&a.persister, &a.id))
            }
            Action::CollectionRecreate(a) => {
                format!("collection-recreate {}#{}", a.persister.role(), a.key)
            }
            Action::CollectionUpdate(a) => {
                format!("collection-update {}#{}", a.persister.role(), a.key)
            }
            Action::CollectionRemove(a) => {
                format!("collection-remove {}#{}", a.persister.role(), a.key)
            }
        }
    }

    /// Tables the action writes.
    pub fn spaces(&self) -> Vec<String> {
        let entity_tables = |p: &Arc<EntityPersister>| -> Vec<String> {
            p.tables().into_iter().map(str::to_string).collect()
        };
        match self {
            Action::Insert(a) | Action::IdentityInsert(a) => entity_tables(&a.persister),
            Action::Update(a) => entity_tables(&a.persister),
            Action::Delete(a) | Action::OrphanRemoval(a) => entity_tables(&a.persister),
            Action::CollectionRecreate(a) => vec![a.persister.table().to_string()],
            Action::CollectionUpdate(a) => vec![a.persister.table().to_string()],
            Action::CollectionRemove(a) => vec![a.persister.table().to_string()],
        }
    }

    /// Entity the action targets, for entity actions.
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Action::Insert(a) | Action::IdentityInsert(a) => Some(&a.entity),
            Action::Update(a) => Some(&a.entity),
            Action::Delete(a) | Action::OrphanRemoval(a) => Some(&a.entity),
            _ => None,
        }
    }
}

fn entity_label(persister: &EntityPersister, id: &Value) -> String {
    if id.is_null() {
        format!("{}#<unsaved>", persister.name())
    } else {
        format!("{}#{}", persister.name(), id)
    }
}
