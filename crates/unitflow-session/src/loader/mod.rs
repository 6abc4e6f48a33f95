//! Entity and collection loading.
//!
//! Loads run in two phases: rows are hydrated by the [`EntityInitializer`] and registered as
//! `Loading`, then secondary tables, eager references and eager collections are resolved and
//! every instance is completed (`Managed` or `ReadOnly`, snapshot taken, `PostLoad` fired).
//! Identifier lists are split and padded to the batch-size ladder so few SQL shapes exist.

mod initializer;

pub(crate) use initializer::{EntityInitializer, resolve_reference};

use crate::context::{EntityKey, EntityStatus};
use crate::listener::EventType;
use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    CollectionPersister, Connection, Entity, EntityPersister, Error, LockMode,
    PersistentCollection, PropertyKind, PropertyValue, Result, Value, try_outcome, try_result,
};
use unitflow_query::plan::{collection_load_plan, entity_load_plan};
use unitflow_query::{
    BatchSizes, LoadPlan, Paging, PlanKey, PlanKind, SecondarySelect, SelectBranch,
    SelectExecutor, TupleProcessor,
};

/// Work deferred until every row of a load has been read.
#[derive(Debug, Default)]
pub(crate) struct PendingLoad {
    pub(crate) loaded: Vec<Entity>,
    pub(crate) eager_references: Vec<Entity>,
    pub(crate) eager_collections: Vec<PersistentCollection>,
}

/// Elements read for one collection key.
type KeyedElements = Vec<(Value, Vec<Entity>)>;

fn push_unique(entities: &mut Vec<Entity>, entity: Entity) {
    if !entities.iter().any(|e| e.ptr_eq(&entity)) {
        entities.push(entity);
    }
}

fn group_for<'g>(groups: &'g mut KeyedElements, key: &Value) -> &'g mut Vec<Entity> {
    let position = match groups.iter().position(|(k, _)| k.same_identifier(key)) {
        Some(position) => position,
        None => {
            groups.push((key.clone(), Vec::new()));
            groups.len() - 1
        }
    };
    &mut groups[position].1
}

impl<C: Connection> Session<C> {
    /// Load instances of `persister` by identifier, in batches.
    ///
    /// Returns the distinct instances read, in row order. Identifiers without a row are simply
    /// absent from the result.
    pub(crate) fn load_entities<'a>(
        &'a mut self,
        cx: &'a Cx,
        persister: Arc<EntityPersister>,
        ids: Vec<Value>,
        lock: LockMode,
        refresh: bool,
    ) -> BoxFuture<'a, Vec<Entity>> {
        Box::pin(async move {
            let dialect = self.connection.dialect();
            let sizes = BatchSizes::new(self.factory.batch_fetch_size(persister.batch_size()));
            let read_only = self.config.default_read_only;
            let mut results: Vec<Entity> = Vec::new();
            for chunk in sizes.chunks(ids) {
                let key = PlanKey::new(
                    persister.name(),
                    PlanKind::ById { keys: chunk.len() },
                    lock,
                    dialect,
                );
                let plan = try_result!(self.factory.plan(&key, || {
                    entity_load_plan(self.factory.metamodel(), &persister, dialect, chunk.len(), lock)
                }));
                tracing::debug!(entity = %persister.name(), keys = chunk.len(), ?lock, "Loading by id");
                let persisters = try_result!(self.branch_persisters(&plan));
                let branches: Vec<SelectBranch> = plan
                    .branches
                    .iter()
                    .map(|b| SelectBranch::new(b.sql.clone(), chunk.clone()))
                    .collect();
                let (rows, pending) = try_outcome!(
                    self.run_entity_branches(
                        cx,
                        persisters,
                        &branches,
                        &plan.key_column,
                        Paging::default(),
                        refresh
                    )
                    .await
                );
                try_outcome!(
                    self.finish_load(cx, &plan.secondary, pending, lock, read_only)
                        .await
                );
                for (entity, _) in rows {
                    push_unique(&mut results, entity);
                }
            }
            Outcome::Ok(results)
        })
    }

    /// Persisters read by each branch of `plan`.
    pub(crate) fn branch_persisters(&self, plan: &LoadPlan) -> Result<Vec<Arc<EntityPersister>>> {
        plan.branches
            .iter()
            .map(|branch| self.factory.persister(&branch.entity))
            .collect()
    }

    /// Run entity SELECT branches through an initializer.
    ///
    /// Returns `(instance, key column value)` per row plus the deferred work. A failing row
    /// aborts the remaining rows; instances already registered stay registered.
    pub(crate) async fn run_entity_branches(
        &mut self,
        cx: &Cx,
        persisters: Vec<Arc<EntityPersister>>,
        branches: &[SelectBranch],
        key_column: &str,
        paging: Paging,
        refresh: bool,
    ) -> Outcome<(Vec<(Entity, Value)>, PendingLoad), Error> {
        let mut initializer =
            EntityInitializer::new(&mut self.context, &self.factory, persisters, key_column, refresh);
        let outcome =
            SelectExecutor::list_branches(cx, &self.connection, branches, paging, &mut initializer)
                .await;
        let pending = PendingLoad {
            loaded: std::mem::take(&mut initializer.loaded),
            eager_references: std::mem::take(&mut initializer.eager_references),
            eager_collections: std::mem::take(&mut initializer.eager_collections),
        };
        let rows = try_outcome!(outcome);
        Outcome::Ok((rows, pending))
    }

    /// Second phase of a load: secondary tables, eager associations, completion.
    pub(crate) async fn finish_load(
        &mut self,
        cx: &Cx,
        secondary: &[SecondarySelect],
        mut pending: PendingLoad,
        lock: LockMode,
        read_only: bool,
    ) -> Outcome<(), Error> {
        for select in secondary {
            try_outcome!(self.load_secondary(cx, select, &mut pending).await);
        }

        // Eager references, grouped per entity type into batched loads.
        let mut groups: Vec<(Arc<EntityPersister>, Vec<Value>)> = Vec::new();
        for reference in &pending.eager_references {
            if reference.is_initialized() {
                continue;
            }
            let persister = reference.persister();
            let id = reference.id();
            match groups.iter_mut().find(|(p, _)| p.name() == persister.name()) {
                Some((_, ids)) => {
                    if !ids.iter().any(|i| i.same_identifier(&id)) {
                        ids.push(id);
                    }
                }
                None => groups.push((persister, vec![id])),
            }
        }
        for (persister, ids) in groups {
            try_outcome!(
                self.load_entities(cx, persister, ids, LockMode::None, false)
                    .await
            );
        }
        for reference in &pending.eager_references {
            if !reference.is_initialized() {
                return Outcome::Err(Error::ObjectNotFound {
                    entity: reference.entity_name(),
                    id: reference.id().to_string(),
                });
            }
        }

        for collection in &pending.eager_collections {
            try_outcome!(self.initialize_collection(cx, collection.clone()).await);
        }

        try_result!(self.complete_load(&pending.loaded, lock, read_only));
        Outcome::Ok(())
    }

    /// Read one secondary table for the instances loaded so far and patch their properties.
    async fn load_secondary(
        &mut self,
        cx: &Cx,
        select: &SecondarySelect,
        pending: &mut PendingLoad,
    ) -> Outcome<(), Error> {
        let targets: Vec<Entity> = pending
            .loaded
            .iter()
            .filter(|e| {
                e.persister()
                    .secondary_tables()
                    .iter()
                    .any(|t| t.table == select.table)
            })
            .cloned()
            .collect();
        if targets.is_empty() {
            return Outcome::Ok(());
        }
        let ids: Vec<Value> = targets.iter().map(Entity::id).collect();
        let sql = select.sql(self.connection.dialect(), ids.len());
        let cursor = match self.connection.select(cx, &sql, &ids).await {
            Outcome::Ok(cursor) => cursor,
            Outcome::Err(e) => return Outcome::Err(e.with_statement(&sql, "secondary table load")),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for row in cursor {
            let key = row.get_by_name(&select.key_column).cloned().unwrap_or(Value::Null);
            let Some(entity) = targets.iter().find(|e| e.id().same_identifier(&key)) else {
                continue;
            };
            let persister = entity.persister();
            for index in persister.table_properties(&select.table) {
                let value = match &persister.property(index).kind {
                    PropertyKind::Basic { column } => {
                        PropertyValue::Basic(row.get_by_name(column).cloned().unwrap_or(Value::Null))
                    }
                    PropertyKind::ToOne {
                        target,
                        column,
                        lazy,
                    } => {
                        let fk = row.get_by_name(column).cloned().unwrap_or(Value::Null);
                        if fk.is_null() {
                            PropertyValue::ToOne(None)
                        } else {
                            let (reference, eager) = try_result!(resolve_reference(
                                &mut self.context,
                                &self.factory,
                                target,
                                fk,
                                *lazy
                            ));
                            if eager {
                                pending.eager_references.push(reference.clone());
                            }
                            PropertyValue::ToOne(Some(reference))
                        }
                    }
                    PropertyKind::Collection(_) => continue,
                };
                try_result!(entity.set_property(index, value));
            }
        }
        Outcome::Ok(())
    }

    /// Move loaded instances from `Loading` to `Managed` (or `ReadOnly`).
    pub(crate) fn complete_load(&mut self, entities: &[Entity], lock: LockMode, read_only: bool) -> Result<()> {
        for entity in entities {
            let persister = entity.persister();
            let snapshot = entity.snapshot()?;
            let version = entity.version();
            let entry = self.context.entry_mut(entity).ok_or_else(|| {
                Error::Assertion(format!("no entry for loaded instance {:?}", entity))
            })?;
            if entry.status != EntityStatus::Loading {
                continue;
            }
            entry.status = if read_only || !persister.is_mutable() {
                EntityStatus::ReadOnly
            } else {
                EntityStatus::Managed
            };
            entry.loaded_state = Some(snapshot);
            entry.deleted_state = None;
            entry.version = version;
            entry.exists_in_database = true;
            if lock != LockMode::None {
                entry.lock_mode = lock;
            } else if entry.lock_mode == LockMode::None {
                entry.lock_mode = LockMode::Read;
            }
            let id = entry.id.clone();
            if persister.has_natural_id() {
                let natural = entity.natural_id()?;
                self.context.cache_natural_id(&persister, natural, id);
            }
            self.factory.listeners().fire(EventType::PostLoad, entity)?;
        }
        if !entities.is_empty() {
            tracing::trace!(count = entities.len(), "Load completed");
        }
        Ok(())
    }

    /// Load an uninitialized reference, together with queued references of its type.
    pub(crate) fn initialize_reference<'a>(&'a mut self, cx: &'a Cx, entity: Entity) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if entity.is_initialized() {
                return Outcome::Ok(());
            }
            let persister = entity.persister();
            let id = entity.id();
            let not_found = || Error::ObjectNotFound {
                entity: persister.name().to_string(),
                id: id.to_string(),
            };
            let key = EntityKey::of(&persister, id.clone());
            if self.context.is_deleted_unloaded(&key) {
                return Outcome::Err(not_found());
            }
            let max = self.factory.batch_fetch_size(persister.batch_size());
            let ids = self.context.entity_batch(&key, max);
            tracing::debug!(entity = ?entity, batch = ids.len(), "Initializing reference");
            try_outcome!(
                self.load_entities(cx, Arc::clone(&persister), ids, LockMode::None, false)
                    .await
            );
            if !entity.is_initialized() {
                return Outcome::Err(not_found());
            }
            Outcome::Ok(())
        })
    }

    /// Load an uninitialized collection, together with queued collections of its role.
    pub(crate) fn initialize_collection<'a>(
        &'a mut self,
        cx: &'a Cx,
        collection: PersistentCollection,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if collection.is_initialized() {
                return Outcome::Ok(());
            }
            let role = collection.role();
            let key = collection.key();
            let persister = try_result!(self.factory.metamodel().collection(&role));
            let max = self.factory.batch_fetch_size(persister.batch_size());
            let keys = self.context.collection_batch(&role, &key, max);
            tracing::debug!(role = %role, key = %key, batch = keys.len(), "Initializing collection");
            let mut groups = try_outcome!(self.load_collections(cx, persister, keys).await);
            if !collection.is_initialized() {
                let elements = std::mem::take(group_for(&mut groups, &key));
                collection.initialize(elements.clone());
                if let Some(entry) = self.context.collection_entry_mut(&collection) {
                    entry.snapshot = Some(elements);
                }
            }
            Outcome::Ok(())
        })
    }

    /// Load the elements of `persister`'s collections for `keys` and initialize the registered
    /// collections. Returns the elements read per key.
    pub(crate) fn load_collections<'a>(
        &'a mut self,
        cx: &'a Cx,
        persister: Arc<CollectionPersister>,
        keys: Vec<Value>,
    ) -> BoxFuture<'a, KeyedElements> {
        Box::pin(async move {
            let dialect = self.connection.dialect();
            let role = persister.role().to_string();
            let sizes = BatchSizes::new(self.factory.batch_fetch_size(persister.batch_size()));
            let read_only = self.config.default_read_only;
            let mut grouped: KeyedElements = Vec::new();

            for chunk in sizes.chunks(keys) {
                let mut groups: KeyedElements = Vec::new();
                for key in &chunk {
                    self.context.dequeue_collection_batch(&role, key);
                    group_for(&mut groups, key);
                }
                let plan_key = PlanKey::new(
                    role.clone(),
                    PlanKind::CollectionByKey { keys: chunk.len() },
                    LockMode::None,
                    dialect,
                );
                let plan = try_result!(self.factory.plan(&plan_key, || {
                    collection_load_plan(self.factory.metamodel(), &persister, dialect, chunk.len())
                }));

                if persister.is_many_to_many() {
                    let Some(branch) = plan.branches.first() else {
                        return Outcome::Err(Error::Assertion(format!("empty load plan for {}", role)));
                    };
                    let rows = try_outcome!(
                        SelectExecutor::list(
                            cx,
                            &self.connection,
                            &branch.sql,
                            &chunk,
                            Paging::default(),
                            &mut TupleProcessor
                        )
                        .await
                    );
                    let element_name = persister.element.name().to_string();
                    let mut missing: Vec<Value> = Vec::new();
                    for row in rows {
                        let (Some(owner), Some(element_id)) = (row.first(), row.get(1)) else {
                            continue;
                        };
                        if element_id.is_null() {
                            continue;
                        }
                        let (element, _) = try_result!(resolve_reference(
                            &mut self.context,
                            &self.factory,
                            &element_name,
                            element_id.clone(),
                            true
                        ));
                        if !element.is_initialized() {
                            missing.push(element_id.clone());
                        }
                        push_unique(group_for(&mut groups, owner), element);
                    }
                    if !missing.is_empty() {
                        try_outcome!(
                            self.load_entities(
                                cx,
                                Arc::clone(&persister.element),
                                missing,
                                LockMode::None,
                                false
                            )
                            .await
                        );
                    }
                } else {
                    let persisters = try_result!(self.branch_persisters(&plan));
                    let branches: Vec<SelectBranch> = plan
                        .branches
                        .iter()
                        .map(|b| SelectBranch::new(b.sql.clone(), chunk.clone()))
                        .collect();
                    let (rows, pending) = try_outcome!(
                        self.run_entity_branches(
                            cx,
                            persisters,
                            &branches,
                            &plan.key_column,
                            Paging::default(),
                            false
                        )
                        .await
                    );
                    try_outcome!(
                        self.finish_load(cx, &plan.secondary, pending, LockMode::None, read_only)
                            .await
                    );
                    for (element, owner) in rows {
                        push_unique(group_for(&mut groups, &owner), element);
                    }
                }

                for (key, elements) in &groups {
                    let Some(collection) = self.context.collection_by_key(&role, key).cloned() else {
                        continue;
                    };
                    if collection.is_initialized() {
                        continue;
                    }
                    collection.initialize(elements.clone());
                    if let Some(entry) = self.context.collection_entry_mut(&collection) {
                        entry.snapshot = Some(elements.clone());
                    }
                }
                grouped.extend(groups);
            }
            Outcome::Ok(grouped)
        })
    }
}
