//! Row-by-row entity initialization.
//!
//! For every row the initializer resolves the identifier, the concrete subtype (discriminator),
//! and the instance to fill (identity map, in-place hydration of references, or a new instance),
//! then reads property values and registers the instance as `Loading`. Deferred work (eager
//! references and collections) is collected for the caller to run once all rows are read.

use crate::context::{CollectionEntry, EntityEntry, EntityKey, EntityStatus, PersistenceContext};
use crate::factory::SessionFactory;
use crate::listener::EventType;
use std::sync::Arc;
use unitflow_core::{
    Entity, EntityPersister, Error, Inheritance, PersistentCollection, PropertyKind,
    PropertyValue, Result, Row, Value,
};
use unitflow_query::RowProcessor;

/// Resolve a foreign key into the instance it references.
///
/// Returns the registered instance or a new uninitialized reference, and whether the
/// reference must be loaded eagerly. Lazy references join the batch-fetch queue.
pub(crate) fn resolve_reference(
    context: &mut PersistenceContext,
    factory: &SessionFactory,
    target: &str,
    key: Value,
    lazy: bool,
) -> Result<(Entity, bool)> {
    let persister = factory.persister(target)?;
    let eager = !lazy || !persister.is_lazy();
    let entity_key = EntityKey::of(&persister, key.clone());
    if let Some(existing) = context.entity(&entity_key) {
        return Ok((existing.clone(), eager && !existing.is_initialized()));
    }
    let reference = Entity::reference(Arc::clone(&persister), key);
    context.add_entity(entity_key.clone(), reference.clone());
    if !eager && factory.batch_fetch_size(persister.batch_size()) > 1 {
        context.queue_entity_batch(entity_key);
    }
    Ok((reference, eager))
}

/// Turns entity rows into registered instances.
pub(crate) struct EntityInitializer<'a> {
    context: &'a mut PersistenceContext,
    factory: &'a SessionFactory,
    /// Persister read by each statement branch.
    branches: Vec<Arc<EntityPersister>>,
    /// Column whose value is returned alongside each instance (collection key or identifier).
    key_column: String,
    refresh: bool,
    /// Instances hydrated by this load, in row order.
    pub(crate) loaded: Vec<Entity>,
    /// Uninitialized references to load once all rows are read.
    pub(crate) eager_references: Vec<Entity>,
    pub(crate) eager_collections: Vec<PersistentCollection>,
}

impl<'a> EntityInitializer<'a> {
    pub(crate) fn new(
        context: &'a mut PersistenceContext,
        factory: &'a SessionFactory,
        branches: Vec<Arc<EntityPersister>>,
        key_column: impl Into<String>,
        refresh: bool,
    ) -> Self {
        Self {
            context,
            factory,
            branches,
            key_column: key_column.into(),
            refresh,
            loaded: Vec::new(),
            eager_references: Vec::new(),
            eager_collections: Vec::new(),
        }
    }

    /// Concrete persister of the row: the branch itself, or the subtype its discriminator names.
    fn concrete_persister(
        &self,
        branch: &Arc<EntityPersister>,
        id: &Value,
        row: &Row,
    ) -> Result<Arc<EntityPersister>> {
        if branch.inheritance() != Inheritance::SingleTable {
            return Ok(Arc::clone(branch));
        }
        let root = self.factory.persister(branch.root_name())?;
        let Some(discriminator) = root.discriminator() else {
            return Ok(Arc::clone(branch));
        };
        let value = row
            .get_by_name(&discriminator.column)
            .cloned()
            .unwrap_or(Value::Null);
        self.factory
            .metamodel()
            .subtype_for_discriminator(&root, &value)
            .ok_or_else(|| {
                Error::IllegalState(format!(
                    "Object [{}#{}] has unknown discriminator value: {}",
                    root.name(),
                    id,
                    value
                ))
            })
    }

    fn read_values(
        &mut self,
        persister: &EntityPersister,
        id: &Value,
        owner: &Entity,
        row: &Row,
    ) -> Result<Vec<PropertyValue>> {
        let mut values = Vec::with_capacity(persister.properties().len());
        for (index, property) in persister.properties().iter().enumerate() {
            // Secondary-table columns are filled by a follow-up select.
            let column_value = |column: &str| {
                if property.table.is_some() {
                    Value::Null
                } else {
                    row.get_by_name(column).cloned().unwrap_or(Value::Null)
                }
            };
            let value = match &property.kind {
                PropertyKind::Basic { column } => PropertyValue::Basic(column_value(column)),
                PropertyKind::ToOne {
                    target,
                    column,
                    lazy,
                } => {
                    let key = column_value(column);
                    if key.is_null() {
                        PropertyValue::ToOne(None)
                    } else {
                        let (reference, eager) =
                            resolve_reference(self.context, self.factory, target, key, *lazy)?;
                        if eager {
                            self.eager_references.push(reference.clone());
                        }
                        PropertyValue::ToOne(Some(reference))
                    }
                }
                PropertyKind::Collection(metadata) => {
                    let collection = self.owner_collection(owner, index, &metadata.role, id)?;
                    if !metadata.lazy {
                        self.eager_collections.push(collection.clone());
                    } else if self.factory.batch_fetch_size(metadata.batch_size) > 1 {
                        self.context.queue_collection_batch(&metadata.role, id.clone());
                    }
                    PropertyValue::Collection(collection)
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Collection instance for `owner`: reused (and reset) on refresh, shared with the context,
    /// or a new uninitialized one.
    fn owner_collection(
        &mut self,
        owner: &Entity,
        index: usize,
        role: &str,
        id: &Value,
    ) -> Result<PersistentCollection> {
        let reused = owner
            .is_initialized()
            .then(|| owner.property(index).ok())
            .flatten()
            .and_then(|value| match value {
                PropertyValue::Collection(c) => Some(c),
                _ => None,
            });
        let collection = match reused {
            Some(collection) => {
                collection.uninitialize();
                if let Some(entry) = self.context.collection_entry_mut(&collection) {
                    entry.snapshot = None;
                }
                collection
            }
            None => match self.context.collection_by_key(role, id) {
                Some(collection) => collection.clone(),
                None => PersistentCollection::uninitialized(role, id.clone()),
            },
        };
        collection.set_key(id.clone());
        if self.context.collection_entry(&collection).is_none() {
            let persister = self.factory.metamodel().collection(role)?;
            self.context.add_collection(CollectionEntry::loaded(
                collection.clone(),
                persister,
                owner.clone(),
                id.clone(),
            ));
        }
        Ok(collection)
    }
}

impl RowProcessor for EntityInitializer<'_> {
    type Output = (Entity, Value);

    fn process_row(&mut self, branch: usize, row: &Row) -> Result<Option<(Entity, Value)>> {
        let branch_persister = self
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| Error::Assertion(format!("no persister for branch {}", branch)))?;
        let id = row
            .get_by_name(branch_persister.id_column())
            .cloned()
            .ok_or_else(|| {
                Error::Assertion(format!(
                    "identifier column {} missing from result",
                    branch_persister.id_column()
                ))
            })?;
        if id.is_null() {
            return Ok(None);
        }
        let key_value = row
            .get_by_name(&self.key_column)
            .cloned()
            .unwrap_or(Value::Null);
        let persister = self.concrete_persister(&branch_persister, &id, row)?;
        let key = EntityKey::of(&persister, id.clone());

        let entity = match self.context.entity(&key).cloned() {
            Some(entity) if entity.is_initialized() => {
                let loading = self
                    .context
                    .entry(&entity)
                    .is_some_and(|e| e.status == EntityStatus::Loading);
                if !self.refresh || loading {
                    return Ok(Some((entity, key_value)));
                }
                entity
            }
            Some(reference) => reference,
            None => {
                let instance = Entity::reference(Arc::clone(&persister), id.clone());
                self.context.add_entity(key.clone(), instance.clone());
                instance
            }
        };
        self.context.dequeue_entity_batch(&key);

        let values = self.read_values(&persister, &id, &entity, row)?;
        entity.hydrate(Arc::clone(&persister), values);
        let mut entry = match self.context.entry(&entity) {
            Some(existing) => existing.clone(),
            None => EntityEntry::new(
                entity.clone(),
                Arc::clone(&persister),
                id.clone(),
                EntityStatus::Loading,
            ),
        };
        entry.persister = persister;
        entry.id = id;
        entry.status = EntityStatus::Loading;
        self.context.add_entry(entry)?;
        self.factory.listeners().fire(EventType::PreLoad, &entity)?;
        tracing::trace!(entity = ?entity, "Row hydrated");
        self.loaded.push(entity.clone());
        Ok(Some((entity, key_value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitflow_core::{EntityMetadata, Metamodel, PropertyMapping};

    fn factory() -> SessionFactory {
        let model = Metamodel::builder()
            .entity(
                EntityMetadata::new("Animal", "animal")
                    .discriminator("kind", "animal")
                    .property(PropertyMapping::basic("name", "name")),
            )
            .entity(
                EntityMetadata::new("GuineaPig", "animal")
                    .extends("Animal")
                    .discriminator("kind", "pig")
                    .property(PropertyMapping::to_one("cage", "Cage", "cage_id")),
            )
            .entity(EntityMetadata::new("Cage", "cage").batch_size(8))
            .build()
            .unwrap();
        SessionFactory::builder(model).build()
    }

    fn row(kind: &str, id: i64, cage: Value) -> Row {
        Row::new(
            vec!["id".into(), "kind".into(), "name".into(), "cage_id".into()],
            vec![Value::BigInt(id), Value::from(kind), Value::from("Hamtaro"), cage],
        )
    }

    #[test]
    fn discriminator_selects_subtype_and_registers_loading_entry() {
        let factory = factory();
        let mut context = PersistenceContext::new();
        let animal = factory.persister("Animal").unwrap();
        let mut initializer =
            EntityInitializer::new(&mut context, &factory, vec![animal], "id", false);
        let (entity, key) = initializer
            .process_row(0, &row("pig", 5, Value::BigInt(2)))
            .unwrap()
            .unwrap();
        assert_eq!(entity.entity_name(), "GuineaPig");
        assert_eq!(key, Value::BigInt(5));
        let cage = entity.get_ref("cage").unwrap().unwrap();
        assert!(!cage.is_initialized());
        assert!(initializer.eager_references.is_empty());
        assert_eq!(initializer.loaded.len(), 1);
        assert_eq!(context.entry(&entity).unwrap().status, EntityStatus::Loading);
        // The lazy reference joined the batch-fetch queue of its type.
        assert_eq!(
            context.entity_batch(&EntityKey::new("Cage", Value::BigInt(9)), 8),
            vec![Value::BigInt(9), Value::BigInt(2)]
        );
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let factory = factory();
        let mut context = PersistenceContext::new();
        let animal = factory.persister("Animal").unwrap();
        let mut initializer =
            EntityInitializer::new(&mut context, &factory, vec![animal], "id", false);
        let err = initializer
            .process_row(0, &row("hamster", 5, Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn references_are_hydrated_in_place() {
        let factory = factory();
        let mut context = PersistenceContext::new();
        let animal = factory.persister("Animal").unwrap();
        let reference = Entity::reference(Arc::clone(&animal), Value::BigInt(5));
        context.add_entity(EntityKey::of(&animal, Value::BigInt(5)), reference.clone());
        let mut initializer =
            EntityInitializer::new(&mut context, &factory, vec![animal], "id", false);
        let (entity, _) = initializer
            .process_row(0, &row("animal", 5, Value::Null))
            .unwrap()
            .unwrap();
        assert!(entity.ptr_eq(&reference));
        assert!(reference.is_initialized());
        assert_eq!(reference.get("name").unwrap(), Value::from("Hamtaro"));
        // A second row for the same instance is not hydrated twice.
        let again = initializer
            .process_row(0, &row("animal", 5, Value::Null))
            .unwrap()
            .unwrap();
        assert!(again.0.ptr_eq(&reference));
        assert_eq!(initializer.loaded.len(), 1);
    }
}
