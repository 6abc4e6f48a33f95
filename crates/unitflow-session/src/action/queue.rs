//! The ordered queue of pending actions.

use super::{Action, EntityDeleteAction};
use std::sync::Arc;
use unitflow_core::{Entity, EntityPersister, Value};

/// Work run when the transaction completes (optimistic lock modes).
#[derive(Debug, Clone)]
pub enum BeforeCompletion {
    /// Re-read the version and fail if the row changed.
    VerifyVersion {
        entity: Entity,
        persister: Arc<EntityPersister>,
        id: Value,
        version: Value,
    },
    /// Increment the version even though the instance is not dirty.
    ForceIncrement {
        entity: Entity,
        persister: Arc<EntityPersister>,
        id: Value,
        version: Value,
    },
}

/// Partition sizes recorded before an auto-flush prepares its actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCheckpoint {
    updates: usize,
    collection_removals: usize,
    collection_updates: usize,
    collection_creations: usize,
}

/// Pending actions, partitioned by kind.
///
/// Execution order: orphan removals, inserts, updates, collection removals, collection updates,
/// collection creations, deletes. Within a partition actions keep insertion order.
#[derive(Debug, Default)]
pub struct ActionQueue {
    orphan_removals: Vec<Action>,
    inserts: Vec<Action>,
    updates: Vec<Action>,
    collection_removals: Vec<Action>,
    collection_updates: Vec<Action>,
    collection_creations: Vec<Action>,
    deletions: Vec<Action>,
    before_completion: Vec<BeforeCompletion>,
    order_updates: bool,
    poisoned: bool,
}

impl ActionQueue {
    pub fn new(order_updates: bool) -> Self {
        Self {
            order_updates,
            ..Self::default()
        }
    }

    pub fn add_action(&mut self, action: Action) {
        tracing::trace!(action = %action.describe(), "Action scheduled");
        let partition = match &action {
            Action::OrphanRemoval(_) => &mut self.orphan_removals,
            Action::Insert(_) | Action::IdentityInsert(_) => &mut self.inserts,
            Action::Update(_) => &mut self.updates,
            Action::CollectionRemove(_) => &mut self.collection_removals,
            Action::CollectionUpdate(_) => &mut self.collection_updates,
            Action::CollectionRecreate(_) => &mut self.collection_creations,
            Action::Delete(_) => &mut self.deletions,
        };
        partition.push(action);
    }

    /// Remove the pending inserts, in order.
    pub fn take_inserts(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.inserts)
    }

    /// Remove every pending action in execution order.
    pub fn drain(&mut self) -> Vec<Action> {
        if self.order_updates {
            self.updates.sort_by_cached_key(|action| match action {
                Action::Update(a) => (a.persister.name().to_string(), a.id.to_string()),
                _ => (String::new(), String::new()),
            });
        }
        let mut actions = Vec::with_capacity(self.len());
        actions.append(&mut self.orphan_removals);
        actions.append(&mut self.inserts);
        actions.append(&mut self.updates);
        actions.append(&mut self.collection_removals);
        actions.append(&mut self.collection_updates);
        actions.append(&mut self.collection_creations);
        actions.append(&mut self.deletions);
        actions
    }

    /// Drop the pending deletion of `entity`; returns whether one was scheduled.
    pub fn unschedule_deletion(&mut self, entity: &Entity) -> bool {
        let before = self.deletions.len() + self.orphan_removals.len();
        let targets =
            |action: &Action| action.entity().is_some_and(|target| target.ptr_eq(entity));
        self.deletions.retain(|action| !targets(action));
        self.orphan_removals.retain(|action| !targets(action));
        before != self.deletions.len() + self.orphan_removals.len()
    }

    /// Is a deletion of `entity` pending?
    pub fn has_deletion(&self, entity: &Entity) -> bool {
        self.deletions
            .iter()
            .chain(&self.orphan_removals)
            .any(|action| action.entity().is_some_and(|target| target.ptr_eq(entity)))
    }

    /// Pending deletions, in execution order.
    pub fn deletions(&self) -> impl Iterator<Item = &EntityDeleteAction> {
        self.orphan_removals
            .iter()
            .chain(&self.deletions)
            .filter_map(|action| match action {
                Action::Delete(a) | Action::OrphanRemoval(a) => Some(a),
                _ => None,
            })
    }

    fn partitions(&self) -> [&Vec<Action>; 7] {
        [
            &self.orphan_removals,
            &self.inserts,
            &self.updates,
            &self.collection_removals,
            &self.collection_updates,
            &self.collection_creations,
            &self.deletions,
        ]
    }

    /// Descriptions of the pending actions in execution order.
    pub fn describe(&self) -> Vec<String> {
        self.partitions()
            .into_iter()
            .flatten()
            .map(Action::describe)
            .collect()
    }

    /// Do pending actions write any of `spaces`?
    pub fn are_tables_to_be_updated<S: AsRef<str>>(&self, spaces: &[S]) -> bool {
        self.partitions().into_iter().flatten().any(|action| {
            action
                .spaces()
                .iter()
                .any(|table| spaces.iter().any(|s| s.as_ref() == table))
        })
    }

    pub fn has_pending(&self) -> bool {
        self.partitions().iter().any(|p| !p.is_empty())
    }

    pub fn len(&self) -> usize {
        self.partitions().iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Remember the flush-time partitions before preparing an auto-flush.
    pub fn checkpoint(&self) -> QueueCheckpoint {
        QueueCheckpoint {
            updates: self.updates.len(),
            collection_removals: self.collection_removals.len(),
            collection_updates: self.collection_updates.len(),
            collection_creations: self.collection_creations.len(),
        }
    }

    /// Discard updates and collection actions prepared since `checkpoint`.
    ///
    /// Inserts and deletions scheduled by the preparation stay queued.
    pub fn truncate_to(&mut self, checkpoint: QueueCheckpoint) {
        self.updates.truncate(checkpoint.updates);
        self.collection_removals
            .truncate(checkpoint.collection_removals);
        self.collection_updates
            .truncate(checkpoint.collection_updates);
        self.collection_creations
            .truncate(checkpoint.collection_creations);
    }

    /// Refuse further execution: a failed flush leaves the session unusable.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn register_before_completion(&mut self, process: BeforeCompletion) {
        self.before_completion.push(process);
    }

    pub fn take_before_completion(&mut self) -> Vec<BeforeCompletion> {
        std::mem::take(&mut self.before_completion)
    }

    /// Forget pending actions and completion processes.
    pub fn clear(&mut self) {
        let order_updates = self.order_updates;
        let poisoned = self.poisoned;
        *self = Self::new(order_updates);
        self.poisoned = poisoned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        CollectionRemoveAction, EntityInsertAction, EntityUpdateAction,
    };
    use unitflow_core::{CollectionMetadata, EntityMetadata, Metamodel, PropertyMapping};

    fn model() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityMetadata::new("Parent", "parent").property(PropertyMapping::collection(
                    "children",
                    CollectionMetadata::one_to_many("Child", "parent_id"),
                )),
            )
            .entity(EntityMetadata::new("Child", "child").property(PropertyMapping::basic("name", "name")))
            .build()
            .unwrap()
    }

    fn delete(model: &Metamodel, name: &str, id: i64) -> (Entity, Action) {
        let persister = model.persister(name).unwrap();
        let entity = Entity::new(Arc::clone(&persister));
        entity.set_id(id);
        let action = Action::Delete(EntityDeleteAction {
            entity: entity.clone(),
            persister,
            id: Value::BigInt(id),
            version: None,
            unloaded: false,
        });
        (entity, action)
    }

    fn update(model: &Metamodel, name: &str, id: i64) -> Action {
        let persister = model.persister(name).unwrap();
        let entity = Entity::new(Arc::clone(&persister));
        Action::Update(EntityUpdateAction {
            entity,
            persister,
            id: Value::BigInt(id),
            state: Vec::new(),
            dirty: Vec::new(),
            previous_version: None,
            next_version: None,
        })
    }

    #[test]
    fn partitions_drain_in_dependency_order() {
        let model = model();
        let mut queue = ActionQueue::new(false);
        let (_, parent_delete) = delete(&model, "Parent", 1);
        queue.add_action(parent_delete);
        let child = model.persister("Child").unwrap();
        queue.add_action(Action::Insert(EntityInsertAction {
            entity: Entity::new(Arc::clone(&child)),
            persister: child,
            id: Value::BigInt(3),
        }));
        queue.add_action(update(&model, "Child", 2));
        let collection = model.collection("Parent.children").unwrap();
        queue.add_action(Action::CollectionRemove(CollectionRemoveAction {
            collection: unitflow_core::PersistentCollection::new("Parent.children"),
            persister: collection,
            key: Value::BigInt(1),
            cascade_delete_enabled: false,
        }));
        assert_eq!(
            queue.describe(),
            vec![
                "insert Child#3",
                "update Child#2",
                "collection-remove Parent.children#1",
                "delete Parent#1",
            ]
        );
        let drained: Vec<String> = queue.drain().iter().map(Action::describe).collect();
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[3], "delete Parent#1");
        assert!(queue.is_empty());
    }

    #[test]
    fn deletion_can_be_unscheduled() {
        let model = model();
        let mut queue = ActionQueue::new(false);
        let (child, action) = delete(&model, "Child", 1);
        queue.add_action(action);
        assert!(queue.has_deletion(&child));
        assert!(queue.unschedule_deletion(&child));
        assert!(!queue.has_pending());
        assert!(!queue.unschedule_deletion(&child));
    }

    #[test]
    fn ordered_updates_sort_by_entity_and_id() {
        let model = model();
        let mut queue = ActionQueue::new(true);
        queue.add_action(update(&model, "Parent", 1));
        queue.add_action(update(&model, "Child", 2));
        queue.add_action(update(&model, "Child", 1));
        let drained: Vec<String> = queue.drain().iter().map(Action::describe).collect();
        assert_eq!(drained, vec!["update Child#1", "update Child#2", "update Parent#1"]);
    }

    #[test]
    fn table_check_and_truncation() {
        let model = model();
        let mut queue = ActionQueue::new(false);
        let checkpoint = queue.checkpoint();
        queue.add_action(update(&model, "Child", 2));
        assert!(queue.are_tables_to_be_updated(&["child"]));
        assert!(!queue.are_tables_to_be_updated(&["parent"]));
        queue.truncate_to(checkpoint);
        assert!(queue.is_empty());
    }

    #[test]
    fn poison_survives_clear() {
        let mut queue = ActionQueue::new(false);
        queue.poison();
        queue.clear();
        assert!(queue.is_poisoned());
    }
}
