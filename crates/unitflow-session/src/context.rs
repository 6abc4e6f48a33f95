//! The persistence context: identity map, entity and collection entries.
//!
//! At most one instance per (root entity, identifier) is associated with a session. Managed
//! instances carry an [`EntityEntry`]; uninitialized references are registered by key only.
//! Entries are iterated in registration order so flushes are deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use unitflow_core::{
    CollectionIdentity, CollectionPersister, Entity, EntityIdentity, EntityPersister, Error,
    LockMode, PersistentCollection, Result, Value,
};

/// Identity-map key: root entity name and identifier.
#[derive(Debug, Clone)]
pub struct EntityKey {
    root: String,
    id: Value,
}

impl EntityKey {
    pub fn new(root: impl Into<String>, id: Value) -> Self {
        Self {
            root: root.into(),
            id,
        }
    }

    /// Key of an instance of `persister` with identifier `id`.
    pub fn of(persister: &EntityPersister, id: Value) -> Self {
        Self::new(persister.root_name(), id)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.id.same_identifier(&other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        self.id.hash_into(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root, self.id)
    }
}

/// Collection role plus owner key.
#[derive(Debug, Clone)]
pub struct CollectionKey {
    role: String,
    key: Value,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, key: Value) -> Self {
        Self {
            role: role.into(),
            key,
        }
    }
}

impl PartialEq for CollectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role && self.key.same_identifier(&other.key)
    }
}

impl Eq for CollectionKey {}

impl Hash for CollectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.key.hash_into(state);
    }
}

/// Natural-id values of one entity type.
#[derive(Debug, Clone)]
struct NaturalIdKey {
    root: String,
    values: Vec<Value>,
}

impl PartialEq for NaturalIdKey {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.same_identifier(b))
    }
}

impl Eq for NaturalIdKey {}

impl Hash for NaturalIdKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        for value in &self.values {
            value.hash_into(state);
        }
    }
}

/// Lifecycle status of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    /// Loaded read-only; never dirty-checked.
    ReadOnly,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted from the database by a flush.
    Gone,
    /// Being hydrated from a result set.
    Loading,
    /// Scheduled for insertion.
    Saving,
}

impl EntityStatus {
    pub fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }
}

/// Session bookkeeping for one managed instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub entity: Entity,
    pub persister: Arc<EntityPersister>,
    pub id: Value,
    pub status: EntityStatus,
    /// Column-level state as last read from or written to the database.
    pub loaded_state: Option<Vec<Value>>,
    /// State frozen when the deletion was scheduled.
    pub deleted_state: Option<Vec<Value>>,
    pub version: Option<Value>,
    pub lock_mode: LockMode,
    pub exists_in_database: bool,
    seq: u64,
}

impl EntityEntry {
    pub fn new(entity: Entity, persister: Arc<EntityPersister>, id: Value, status: EntityStatus) -> Self {
        Self {
            entity,
            persister,
            id,
            status,
            loaded_state: None,
            deleted_state: None,
            version: None,
            lock_mode: LockMode::None,
            exists_in_database: false,
            seq: 0,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::of(&self.persister, self.id.clone())
    }

    pub fn is_read_only(&self) -> bool {
        self.status == EntityStatus::ReadOnly
    }
}

/// Session bookkeeping for one persistent collection.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub collection: PersistentCollection,
    pub persister: Arc<CollectionPersister>,
    pub owner: Entity,
    /// Owner key the rows were last written with; `None` for collections never flushed.
    pub loaded_key: Option<Value>,
    /// Elements as last loaded or flushed; `None` while uninitialized.
    pub snapshot: Option<Vec<Entity>>,
    /// Reached from a managed owner during the current flush.
    pub reached: bool,
    pub current_key: Option<Value>,
}

impl CollectionEntry {
    /// Entry for a collection loaded (or to be loaded) under `key`.
    pub fn loaded(
        collection: PersistentCollection,
        persister: Arc<CollectionPersister>,
        owner: Entity,
        key: Value,
    ) -> Self {
        let snapshot = collection.loaded_elements();
        Self {
            collection,
            persister,
            owner,
            loaded_key: Some(key),
            snapshot,
            reached: false,
            current_key: None,
        }
    }

    /// Entry for a collection first seen on a new or re-associated owner.
    pub fn new_instance(
        collection: PersistentCollection,
        persister: Arc<CollectionPersister>,
        owner: Entity,
    ) -> Self {
        Self {
            collection,
            persister,
            owner,
            loaded_key: None,
            snapshot: None,
            reached: false,
            current_key: None,
        }
    }
}

/// Identity map plus entity and collection entries for one session.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities: HashMap<EntityKey, Entity>,
    entries: HashMap<EntityIdentity, EntityEntry>,
    order: BTreeMap<u64, EntityIdentity>,
    next_seq: u64,
    collections: HashMap<CollectionIdentity, CollectionEntry>,
    collection_order: Vec<CollectionIdentity>,
    collections_by_key: HashMap<CollectionKey, PersistentCollection>,
    nullifiable: HashSet<EntityKey>,
    deleted_unloaded: HashSet<EntityKey>,
    natural_ids: HashMap<NaturalIdKey, Value>,
    natural_ids_by_key: HashMap<EntityKey, NaturalIdKey>,
    batch_entities: Vec<EntityKey>,
    batch_collections: Vec<CollectionKey>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Identity map
    // ========================================================================

    /// Instance (managed or uninitialized reference) registered under `key`.
    pub fn entity(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn add_entity(&mut self, key: EntityKey, entity: Entity) {
        self.entities.insert(key, entity);
    }

    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<Entity> {
        self.entities.remove(key)
    }

    /// Number of instances in the identity map, references included.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // ========================================================================
    // Entity entries
    // ========================================================================

    pub fn entry(&self, entity: &Entity) -> Option<&EntityEntry> {
        self.entries.get(&entity.identity())
    }

    pub fn entry_mut(&mut self, entity: &Entity) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&entity.identity())
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.entries.contains_key(&entity.identity())
    }

    /// Register `entry`, placing its instance in the identity map when its identifier is known.
    ///
    /// Fails when a different instance is already registered under the same key.
    pub fn add_entry(&mut self, mut entry: EntityEntry) -> Result<()> {
        if !entry.id.is_null() {
            let key = entry.key();
            if let Some(existing) = self.entities.get(&key) {
                if !existing.ptr_eq(&entry.entity) {
                    return Err(Error::NonUniqueObject {
                        entity: entry.persister.name().to_string(),
                        id: entry.id.to_string(),
                    });
                }
            }
            self.entities.insert(key, entry.entity.clone());
        }
        let identity = entry.entity.identity();
        if let Some(previous) = self.entries.get(&identity) {
            entry.seq = previous.seq;
        } else {
            self.next_seq += 1;
            entry.seq = self.next_seq;
            self.order.insert(entry.seq, identity);
        }
        self.entries.insert(identity, entry);
        Ok(())
    }

    /// Drop the entry of `entity` and its identity-map registration.
    pub fn remove_entry(&mut self, entity: &Entity) -> Option<EntityEntry> {
        let entry = self.entries.remove(&entity.identity())?;
        self.order.remove(&entry.seq);
        if !entry.id.is_null() {
            let key = entry.key();
            if self.entities.get(&key).is_some_and(|e| e.ptr_eq(entity)) {
                self.entities.remove(&key);
            }
        }
        Some(entry)
    }

    /// Managed instances in registration order.
    pub fn entities_in_order(&self) -> Vec<Entity> {
        self.order
            .values()
            .filter_map(|identity| self.entries.get(identity))
            .map(|entry| entry.entity.clone())
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.order
            .values()
            .filter_map(|identity| self.entries.get(identity))
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    // ========================================================================
    // Collection entries
    // ========================================================================

    pub fn add_collection(&mut self, entry: CollectionEntry) {
        let identity = entry.collection.identity();
        if let Some(key) = &entry.loaded_key {
            self.collections_by_key.insert(
                CollectionKey::new(entry.persister.role(), key.clone()),
                entry.collection.clone(),
            );
        }
        if !self.collections.contains_key(&identity) {
            self.collection_order.push(identity);
        }
        self.collections.insert(identity, entry);
    }

    pub fn collection_entry(&self, collection: &PersistentCollection) -> Option<&CollectionEntry> {
        self.collections.get(&collection.identity())
    }

    pub fn collection_entry_mut(
        &mut self,
        collection: &PersistentCollection,
    ) -> Option<&mut CollectionEntry> {
        self.collections.get_mut(&collection.identity())
    }

    /// Collection loaded for `role` with owner `key`.
    pub fn collection_by_key(&self, role: &str, key: &Value) -> Option<&PersistentCollection> {
        self.collections_by_key
            .get(&CollectionKey::new(role, key.clone()))
    }

    /// Collections in registration order.
    pub fn collections_in_order(&self) -> Vec<PersistentCollection> {
        self.collection_order
            .iter()
            .filter_map(|identity| self.collections.get(identity))
            .map(|entry| entry.collection.clone())
            .collect()
    }

    pub fn collection_entries(&self) -> impl Iterator<Item = &CollectionEntry> {
        self.collection_order
            .iter()
            .filter_map(|identity| self.collections.get(identity))
    }

    pub fn collection_entries_mut(&mut self) -> impl Iterator<Item = &mut CollectionEntry> {
        self.collections.values_mut()
    }

    pub fn remove_collection(&mut self, collection: &PersistentCollection) -> Option<CollectionEntry> {
        let identity = collection.identity();
        let entry = self.collections.remove(&identity)?;
        self.collection_order.retain(|c| *c != identity);
        if let Some(key) = &entry.loaded_key {
            let by_key = CollectionKey::new(entry.persister.role(), key.clone());
            if self
                .collections_by_key
                .get(&by_key)
                .is_some_and(|c| c.ptr_eq(collection))
            {
                self.collections_by_key.remove(&by_key);
            }
        }
        Some(entry)
    }

    /// Re-index a collection after its rows were written under `key`.
    pub fn rekey_collection(&mut self, collection: &PersistentCollection, key: Option<Value>) {
        let Some(entry) = self.collections.get_mut(&collection.identity()) else {
            return;
        };
        let role = entry.persister.role().to_string();
        if let Some(old) = entry.loaded_key.take() {
            let old_key = CollectionKey::new(role.clone(), old);
            if self
                .collections_by_key
                .get(&old_key)
                .is_some_and(|c| c.ptr_eq(collection))
            {
                self.collections_by_key.remove(&old_key);
            }
        }
        if let Some(new) = &key {
            self.collections_by_key
                .insert(CollectionKey::new(role, new.clone()), collection.clone());
        }
        entry.loaded_key = key;
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    // ========================================================================
    // Deletion bookkeeping
    // ========================================================================

    /// Mark `key` as being deleted in this flush; references to it are nulled out.
    pub fn add_nullifiable(&mut self, key: EntityKey) {
        self.nullifiable.insert(key);
    }

    pub fn is_nullifiable(&self, key: &EntityKey) -> bool {
        self.nullifiable.contains(key)
    }

    pub fn remove_nullifiable(&mut self, key: &EntityKey) {
        self.nullifiable.remove(key);
    }

    pub fn clear_nullifiable(&mut self) {
        self.nullifiable.clear();
    }

    /// Record a deletion scheduled without loading; `false` if it was already recorded.
    pub fn mark_deleted_unloaded(&mut self, key: EntityKey) -> bool {
        self.deleted_unloaded.insert(key)
    }

    pub fn is_deleted_unloaded(&self, key: &EntityKey) -> bool {
        self.deleted_unloaded.contains(key)
    }

    /// Drop the record once the row is gone or the deletion was abandoned.
    pub fn forget_deleted_unloaded(&mut self, key: &EntityKey) {
        self.deleted_unloaded.remove(key);
    }

    pub fn clear_deleted_unloaded(&mut self) {
        self.deleted_unloaded.clear();
    }

    // ========================================================================
    // Natural ids
    // ========================================================================

    pub fn cache_natural_id(&mut self, persister: &EntityPersister, values: Vec<Value>, id: Value) {
        let key = EntityKey::of(persister, id.clone());
        let natural = NaturalIdKey {
            root: persister.root_name().to_string(),
            values,
        };
        if let Some(previous) = self.natural_ids_by_key.insert(key, natural.clone()) {
            self.natural_ids.remove(&previous);
        }
        self.natural_ids.insert(natural, id);
    }

    pub fn natural_id_lookup(&self, persister: &EntityPersister, values: &[Value]) -> Option<&Value> {
        self.natural_ids.get(&NaturalIdKey {
            root: persister.root_name().to_string(),
            values: values.to_vec(),
        })
    }

    pub fn remove_natural_id(&mut self, key: &EntityKey) {
        if let Some(natural) = self.natural_ids_by_key.remove(key) {
            self.natural_ids.remove(&natural);
        }
    }

    // ========================================================================
    // Batch-fetch queue
    // ========================================================================

    /// Queue an uninitialized reference so loading one of its type loads it too.
    pub fn queue_entity_batch(&mut self, key: EntityKey) {
        if !self.batch_entities.contains(&key) {
            self.batch_entities.push(key);
        }
    }

    pub fn dequeue_entity_batch(&mut self, key: &EntityKey) {
        self.batch_entities.retain(|k| k != key);
    }

    /// Identifiers to load together with `first`: `first` itself, then queued references of
    /// the same hierarchy still uninitialized, up to `max`.
    pub fn entity_batch(&self, first: &EntityKey, max: usize) -> Vec<Value> {
        let mut ids = vec![first.id.clone()];
        for key in &self.batch_entities {
            if ids.len() >= max {
                break;
            }
            if key.root != first.root || key == first {
                continue;
            }
            let pending = self
                .entities
                .get(key)
                .is_some_and(|e| !e.is_initialized());
            if pending {
                ids.push(key.id.clone());
            }
        }
        ids
    }

    pub fn queue_collection_batch(&mut self, role: &str, key: Value) {
        let key = CollectionKey::new(role, key);
        if !self.batch_collections.contains(&key) {
            self.batch_collections.push(key);
        }
    }

    pub fn dequeue_collection_batch(&mut self, role: &str, key: &Value) {
        let key = CollectionKey::new(role, key.clone());
        self.batch_collections.retain(|k| *k != key);
    }

    /// Owner keys to load together with `first` for `role`, up to `max`.
    pub fn collection_batch(&self, role: &str, first: &Value, max: usize) -> Vec<Value> {
        let mut keys = vec![first.clone()];
        for queued in &self.batch_collections {
            if keys.len() >= max {
                break;
            }
            if queued.role != role || queued.key.same_identifier(first) {
                continue;
            }
            let pending = self
                .collections_by_key
                .get(queued)
                .is_some_and(|c| !c.is_initialized());
            if pending {
                keys.push(queued.key.clone());
            }
        }
        keys
    }

    /// Forget every instance, entry and queued load.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
