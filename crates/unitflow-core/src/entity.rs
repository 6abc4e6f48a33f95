//! Entity and collection instances.
//!
//! Instances are shared handles with reference identity: two `Entity` values are the same
//! object only when they point at the same cell. Uninitialized references (proxies) carry only
//! their identifier and are hydrated in place when loaded, so every holder observes the data.

use crate::error::{Error, Result};
use crate::metadata::{EntityPersister, PropertyKind};
use crate::value::Value;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Address of an entity cell; stable for the life of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityIdentity(usize);

/// Address of a collection cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionIdentity(usize);

/// Current value of one mapped attribute.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Basic(Value),
    ToOne(Option<Entity>),
    Collection(PersistentCollection),
}

impl PropertyValue {
    /// Column-level value used for snapshots: the referenced identifier for to-ones.
    pub fn snapshot(&self) -> Value {
        match self {
            PropertyValue::Basic(v) => v.clone(),
            PropertyValue::ToOne(Some(target)) => target.id(),
            PropertyValue::ToOne(None) | PropertyValue::Collection(_) => Value::Null,
        }
    }
}

/// Mutable state behind an [`Entity`] handle.
#[derive(Debug)]
pub struct EntityState {
    persister: Arc<EntityPersister>,
    id: Value,
    initialized: bool,
    values: Vec<PropertyValue>,
}

impl EntityState {
    pub fn persister(&self) -> &Arc<EntityPersister> {
        &self.persister
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct Entity(Arc<RwLock<EntityState>>);

fn default_values(persister: &EntityPersister) -> Vec<PropertyValue> {
    persister
        .properties()
        .iter()
        .map(|p| match &p.kind {
            PropertyKind::Basic { .. } => PropertyValue::Basic(Value::Null),
            PropertyKind::ToOne { .. } => PropertyValue::ToOne(None),
            PropertyKind::Collection(c) => {
                PropertyValue::Collection(PersistentCollection::new(c.role.clone()))
            }
        })
        .collect()
}

impl Entity {
    /// A new transient instance with every property unset.
    pub fn new(persister: Arc<EntityPersister>) -> Entity {
        let values = default_values(&persister);
        Entity(Arc::new(RwLock::new(EntityState {
            persister,
            id: Value::Null,
            initialized: true,
            values,
        })))
    }

    /// An uninitialized reference carrying only its identifier.
    pub fn reference(persister: Arc<EntityPersister>, id: Value) -> Entity {
        Entity(Arc::new(RwLock::new(EntityState {
            persister,
            id,
            initialized: false,
            values: Vec::new(),
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the locked state.
    pub fn with_state<R>(&self, f: impl FnOnce(&EntityState) -> R) -> R {
        f(&self.read())
    }

    pub fn identity(&self) -> EntityIdentity {
        EntityIdentity(Arc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn persister(&self) -> Arc<EntityPersister> {
        Arc::clone(&self.read().persister)
    }

    pub fn entity_name(&self) -> String {
        self.read().persister.name().to_string()
    }

    pub fn id(&self) -> Value {
        self.read().id.clone()
    }

    pub fn set_id(&self, id: impl Into<Value>) {
        self.write().id = id.into();
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    fn lazy_error(state: &EntityState) -> Error {
        Error::IllegalState(format!(
            "could not initialize reference [{}#{}]: fetch it through its session first",
            state.persister.name(),
            state.id
        ))
    }

    fn index(state: &EntityState, name: &str) -> Result<usize> {
        if !state.initialized {
            return Err(Self::lazy_error(state));
        }
        state.persister.property_index(name)
    }

    /// Value of a basic property.
    pub fn get(&self, name: &str) -> Result<Value> {
        let state = self.read();
        let index = Self::index(&state, name)?;
        match &state.values[index] {
            PropertyValue::Basic(v) => Ok(v.clone()),
            _ => Err(Error::IllegalArgument(format!(
                "{}.{} is an association",
                state.persister.name(),
                name
            ))),
        }
    }

    /// Set a basic property.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let mut state = self.write();
        let index = Self::index(&state, name)?;
        match &mut state.values[index] {
            PropertyValue::Basic(v) => {
                *v = value.into();
                Ok(())
            }
            _ => Err(Error::IllegalArgument(format!(
                "{}.{} is an association",
                state.persister.name(),
                name
            ))),
        }
    }

    /// Target of a to-one association.
    pub fn get_ref(&self, name: &str) -> Result<Option<Entity>> {
        let state = self.read();
        let index = Self::index(&state, name)?;
        match &state.values[index] {
            PropertyValue::ToOne(target) => Ok(target.clone()),
            _ => Err(Error::IllegalArgument(format!(
                "{}.{} is not a to-one association",
                state.persister.name(),
                name
            ))),
        }
    }

    /// Point a to-one association at `target`.
    pub fn set_ref(&self, name: &str, target: Option<&Entity>) -> Result<()> {
        let mut state = self.write();
        let index = Self::index(&state, name)?;
        match &mut state.values[index] {
            PropertyValue::ToOne(slot) => {
                *slot = target.cloned();
                Ok(())
            }
            _ => Err(Error::IllegalArgument(format!(
                "{}.{} is not a to-one association",
                state.persister.name(),
                name
            ))),
        }
    }

    /// The persistent collection held by a to-many property.
    pub fn collection(&self, name: &str) -> Result<PersistentCollection> {
        let state = self.read();
        let index = Self::index(&state, name)?;
        match &state.values[index] {
            PropertyValue::Collection(c) => Ok(c.clone()),
            _ => Err(Error::IllegalArgument(format!(
                "{}.{} is not a collection",
                state.persister.name(),
                name
            ))),
        }
    }

    /// Value of the property at `index`.
    pub fn property(&self, index: usize) -> Result<PropertyValue> {
        let state = self.read();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        state
            .values
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Assertion(format!("property index {} out of range", index)))
    }

    pub fn set_property(&self, index: usize, value: PropertyValue) -> Result<()> {
        let mut state = self.write();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        match state.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::Assertion(format!(
                "property index {} out of range",
                index
            ))),
        }
    }

    /// All property values, in persister order.
    pub fn values(&self) -> Result<Vec<PropertyValue>> {
        let state = self.read();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        Ok(state.values.clone())
    }

    /// Column-level snapshot of the current state.
    pub fn snapshot(&self) -> Result<Vec<Value>> {
        let values = self.values()?;
        Ok(values.iter().map(PropertyValue::snapshot).collect())
    }

    /// Current version, if the entity is versioned and initialized.
    pub fn version(&self) -> Option<Value> {
        let state = self.read();
        let index = state.persister.version_index()?;
        match state.values.get(index) {
            Some(PropertyValue::Basic(v)) if state.initialized => Some(v.clone()),
            _ => None,
        }
    }

    pub fn set_version(&self, version: Value) -> Result<()> {
        let index = self
            .read()
            .persister
            .version_index()
            .ok_or_else(|| Error::Assertion("entity is not versioned".to_string()))?;
        self.set_property(index, PropertyValue::Basic(version))
    }

    /// Current natural-id values in declaration order.
    pub fn natural_id(&self) -> Result<Vec<Value>> {
        let state = self.read();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        Ok(state
            .persister
            .natural_id_indices()
            .iter()
            .map(|&i| state.values[i].snapshot())
            .collect())
    }

    /// Fill an instance with loaded state, possibly narrowing it to a concrete subtype.
    pub fn hydrate(&self, persister: Arc<EntityPersister>, values: Vec<PropertyValue>) {
        let mut state = self.write();
        state.persister = persister;
        state.values = values;
        state.initialized = true;
    }

    /// Replace the values of an initialized instance and keep its identity.
    pub fn overwrite(&self, values: Vec<PropertyValue>) {
        self.write().values = values;
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        if state.id.is_null() {
            write!(f, "{}#<unsaved>", state.persister.name())
        } else {
            write!(f, "{}#{}", state.persister.name(), state.id)
        }
    }
}

#[derive(Debug)]
struct CollectionState {
    role: String,
    key: Value,
    elements: Vec<Entity>,
    initialized: bool,
}

/// Shared handle to a to-many association's elements.
///
/// Elements keep insertion (persisted) order. An uninitialized collection knows only its role
/// and owner key until a session loads it.
#[derive(Clone)]
pub struct PersistentCollection(Arc<RwLock<CollectionState>>);

impl PersistentCollection {
    /// An empty initialized collection.
    pub fn new(role: impl Into<String>) -> PersistentCollection {
        PersistentCollection(Arc::new(RwLock::new(CollectionState {
            role: role.into(),
            key: Value::Null,
            elements: Vec::new(),
            initialized: true,
        })))
    }

    /// An unloaded collection for the owner identified by `key`.
    pub fn uninitialized(role: impl Into<String>, key: Value) -> PersistentCollection {
        PersistentCollection(Arc::new(RwLock::new(CollectionState {
            role: role.into(),
            key,
            elements: Vec::new(),
            initialized: false,
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, CollectionState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lazy_error(state: &CollectionState) -> Error {
        Error::IllegalState(format!(
            "failed to lazily initialize a collection of role {} with key {}: fetch it through its session first",
            state.role, state.key
        ))
    }

    pub fn identity(&self) -> CollectionIdentity {
        CollectionIdentity(Arc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn ptr_eq(&self, other: &PersistentCollection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn role(&self) -> String {
        self.read().role.clone()
    }

    pub fn key(&self) -> Value {
        self.read().key.clone()
    }

    pub fn set_key(&self, key: Value) {
        self.write().key = key;
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Elements in persisted order.
    pub fn elements(&self) -> Result<Vec<Entity>> {
        let state = self.read();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        Ok(state.elements.clone())
    }

    /// Elements if loaded, without failing on an unloaded collection.
    pub fn loaded_elements(&self) -> Option<Vec<Entity>> {
        let state = self.read();
        state.initialized.then(|| state.elements.clone())
    }

    pub fn len(&self) -> Result<usize> {
        let state = self.read();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        Ok(state.elements.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    pub fn contains(&self, element: &Entity) -> Result<bool> {
        Ok(self.elements()?.iter().any(|e| e.ptr_eq(element)))
    }

    pub fn push(&self, element: Entity) -> Result<()> {
        let mut state = self.write();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        state.elements.push(element);
        Ok(())
    }

    /// Remove `element` by identity; returns whether it was present.
    pub fn remove(&self, element: &Entity) -> Result<bool> {
        let mut state = self.write();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        let before = state.elements.len();
        state.elements.retain(|e| !e.ptr_eq(element));
        Ok(state.elements.len() != before)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.write();
        if !state.initialized {
            return Err(Self::lazy_error(&state));
        }
        state.elements.clear();
        Ok(())
    }

    /// Install loaded elements and mark the collection initialized.
    pub fn initialize(&self, elements: Vec<Entity>) {
        let mut state = self.write();
        state.elements = elements;
        state.initialized = true;
    }

    /// Forget loaded elements so the next access reloads them.
    pub fn uninitialize(&self) {
        let mut state = self.write();
        state.elements.clear();
        state.initialized = false;
    }
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        if state.initialized {
            write!(f, "{}#{}{:?}", state.role, state.key, state.elements)
        } else {
            write!(f, "{}#{}<uninitialized>", state.role, state.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CollectionMetadata, EntityMetadata, Metamodel, PropertyMapping};

    fn model() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityMetadata::new("GuineaPig", "pig")
                    .version("version", "version")
                    .property(PropertyMapping::basic("name", "name"))
                    .property(PropertyMapping::to_one("cage", "Cage", "cage_id")),
            )
            .entity(EntityMetadata::new("Cage", "cage").property(
                PropertyMapping::collection(
                    "pigs",
                    CollectionMetadata::one_to_many("GuineaPig", "cage_id").inverse(),
                ),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn identity_is_by_reference() {
        let model = model();
        let pig = Entity::new(model.persister("GuineaPig").unwrap());
        let same = pig.clone();
        let other = Entity::new(model.persister("GuineaPig").unwrap());
        assert!(pig.ptr_eq(&same));
        assert_eq!(pig.identity(), same.identity());
        assert!(!pig.ptr_eq(&other));
    }

    #[test]
    fn snapshot_records_foreign_keys() {
        let model = model();
        let cage = Entity::new(model.persister("Cage").unwrap());
        cage.set_id(3_i64);
        let pig = Entity::new(model.persister("GuineaPig").unwrap());
        pig.set_id(5_i64);
        pig.set("name", "Hamtaro").unwrap();
        pig.set_ref("cage", Some(&cage)).unwrap();
        assert_eq!(
            pig.snapshot().unwrap(),
            vec![Value::Null, Value::Text("Hamtaro".into()), Value::BigInt(3)]
        );
        assert_eq!(format!("{:?}", pig), "GuineaPig#5");
    }

    #[test]
    fn references_refuse_access_until_hydrated() {
        let model = model();
        let persister = model.persister("GuineaPig").unwrap();
        let proxy = Entity::reference(Arc::clone(&persister), Value::BigInt(5));
        assert!(matches!(proxy.get("name"), Err(Error::IllegalState(_))));
        assert_eq!(proxy.version(), None);

        proxy.hydrate(
            persister,
            vec![
                PropertyValue::Basic(Value::Int(0)),
                PropertyValue::Basic(Value::Text("McCloud".into())),
                PropertyValue::ToOne(None),
            ],
        );
        assert!(proxy.is_initialized());
        assert_eq!(proxy.get("name").unwrap(), Value::Text("McCloud".into()));
        assert_eq!(proxy.version(), Some(Value::Int(0)));
    }

    #[test]
    fn collections_track_elements_by_identity() {
        let model = model();
        let cage = Entity::new(model.persister("Cage").unwrap());
        let pigs = cage.collection("pigs").unwrap();
        assert_eq!(pigs.role(), "Cage.pigs");
        let a = Entity::new(model.persister("GuineaPig").unwrap());
        let b = Entity::new(model.persister("GuineaPig").unwrap());
        pigs.push(a.clone()).unwrap();
        pigs.push(b.clone()).unwrap();
        assert!(pigs.remove(&a).unwrap());
        assert!(!pigs.remove(&a).unwrap());
        assert_eq!(pigs.len().unwrap(), 1);

        let lazy = PersistentCollection::uninitialized("Cage.pigs", Value::BigInt(1));
        assert!(lazy.elements().is_err());
        assert!(lazy.loaded_elements().is_none());
        lazy.initialize(vec![b]);
        assert_eq!(lazy.len().unwrap(), 1);
    }
}
