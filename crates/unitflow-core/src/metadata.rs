//! Read-only mapping metadata: entity and collection descriptors compiled into persisters.
//!
//! `EntityMetadata` is the declarative description an application builds once. A
//! [`Metamodel`] validates the set of descriptors, flattens inherited properties, resolves the
//! subclass closure and collection roles, and hands out shared [`EntityPersister`]s.

use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Set of operations that propagate across an association.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CascadeStyle(u16);

impl CascadeStyle {
    pub const NONE: CascadeStyle = CascadeStyle(0);
    pub const PERSIST: CascadeStyle = CascadeStyle(1);
    pub const MERGE: CascadeStyle = CascadeStyle(1 << 1);
    pub const REMOVE: CascadeStyle = CascadeStyle(1 << 2);
    pub const REFRESH: CascadeStyle = CascadeStyle(1 << 3);
    pub const LOCK: CascadeStyle = CascadeStyle(1 << 4);
    pub const REPLICATE: CascadeStyle = CascadeStyle(1 << 5);
    pub const DELETE_ORPHAN: CascadeStyle = CascadeStyle(1 << 6);
    /// Every operation except orphan deletion.
    pub const ALL: CascadeStyle = CascadeStyle(0b0011_1111);

    /// Does this style include every operation in `other`?
    pub const fn contains(self, other: CascadeStyle) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn has_orphan_delete(self) -> bool {
        self.0 & Self::DELETE_ORPHAN.0 != 0
    }
}

impl BitOr for CascadeStyle {
    type Output = CascadeStyle;

    fn bitor(self, rhs: CascadeStyle) -> CascadeStyle {
        CascadeStyle(self.0 | rhs.0)
    }
}

impl fmt::Debug for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CascadeStyle, &str); 7] = [
            (CascadeStyle::PERSIST, "persist"),
            (CascadeStyle::MERGE, "merge"),
            (CascadeStyle::REMOVE, "remove"),
            (CascadeStyle::REFRESH, "refresh"),
            (CascadeStyle::LOCK, "lock"),
            (CascadeStyle::REPLICATE, "replicate"),
            (CascadeStyle::DELETE_ORPHAN, "delete-orphan"),
        ];
        if self.is_none() {
            return write!(f, "none");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(style, _)| self.contains(*style))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// How identifiers are assigned to new instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdGeneration {
    /// The application sets the identifier before persisting.
    Assigned,
    /// The database generates the key on insert; the insert runs immediately.
    Identity,
    /// Identifiers come from a database sequence, fetched in blocks of `allocation_size`.
    Sequence { name: String, allocation_size: u32 },
}

impl IdGeneration {
    pub const fn is_generated(&self) -> bool {
        !matches!(self, IdGeneration::Assigned)
    }
}

/// A many-to-many link table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Column referencing the element's identifier.
    pub element_column: String,
}

/// Mapping of a to-many association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMetadata {
    /// `Owner.property`; filled in by the metamodel.
    pub role: String,
    /// Element entity name.
    pub element: String,
    /// Column holding the owner's identifier: in the element table for one-to-many, in the
    /// join table for many-to-many.
    pub key_column: String,
    /// The other side owns the association; this side never writes.
    pub inverse: bool,
    pub join_table: Option<JoinTable>,
    pub lazy: bool,
    pub batch_size: Option<usize>,
    /// The database removes the rows itself when the owner is deleted (`ON DELETE CASCADE`).
    pub on_delete_cascade: bool,
}

impl CollectionMetadata {
    /// One-to-many collection keyed by `key_column` in the element table.
    pub fn one_to_many(element: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            role: String::new(),
            element: element.into(),
            key_column: key_column.into(),
            inverse: false,
            join_table: None,
            lazy: true,
            batch_size: None,
            on_delete_cascade: false,
        }
    }

    /// Many-to-many collection through a join table.
    pub fn many_to_many(
        element: impl Into<String>,
        join_table: impl Into<String>,
        key_column: impl Into<String>,
        element_column: impl Into<String>,
    ) -> Self {
        Self {
            role: String::new(),
            element: element.into(),
            key_column: key_column.into(),
            inverse: false,
            join_table: Some(JoinTable {
                table: join_table.into(),
                element_column: element_column.into(),
            }),
            lazy: true,
            batch_size: None,
            on_delete_cascade: false,
        }
    }

    pub fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn on_delete_cascade(mut self) -> Self {
        self.on_delete_cascade = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Basic {
        column: String,
    },
    /// Many-to-one / one-to-one owning a foreign key column.
    ToOne {
        target: String,
        column: String,
        lazy: bool,
    },
    Collection(CollectionMetadata),
}

/// One mapped attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMapping {
    pub name: String,
    pub kind: PropertyKind,
    pub cascade: CascadeStyle,
    pub nullable: bool,
    /// Secondary table holding the column; `None` for the primary table.
    pub table: Option<String>,
}

impl PropertyMapping {
    pub fn basic(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Basic {
                column: column.into(),
            },
            cascade: CascadeStyle::NONE,
            nullable: true,
            table: None,
        }
    }

    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::ToOne {
                target: target.into(),
                column: column.into(),
                lazy: true,
            },
            cascade: CascadeStyle::NONE,
            nullable: true,
            table: None,
        }
    }

    pub fn collection(name: impl Into<String>, collection: CollectionMetadata) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Collection(collection),
            cascade: CascadeStyle::NONE,
            nullable: true,
            table: None,
        }
    }

    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Load a to-one reference together with its owner instead of as a proxy.
    pub fn eager(mut self) -> Self {
        match &mut self.kind {
            PropertyKind::ToOne { lazy, .. } => *lazy = false,
            PropertyKind::Collection(c) => c.lazy = false,
            PropertyKind::Basic { .. } => {}
        }
        self
    }

    /// Store this property's column in a secondary table.
    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Column stored in the owning row, if any.
    pub fn column(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Basic { column } | PropertyKind::ToOne { column, .. } => Some(column),
            PropertyKind::Collection(_) => None,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection(_))
    }

    pub fn is_association(&self) -> bool {
        !matches!(self.kind, PropertyKind::Basic { .. })
    }
}

/// Single-table inheritance discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Discriminator {
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryTable {
    pub table: String,
    /// Column referencing the primary table's identifier.
    pub key_column: String,
}

/// Declarative description of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub id_generation: IdGeneration,
    pub properties: Vec<PropertyMapping>,
    /// Name of the version property.
    pub version: Option<String>,
    pub natural_id: Vec<String>,
    pub natural_id_mutable: bool,
    pub discriminator: Option<Discriminator>,
    pub superclass: Option<String>,
    pub secondary_tables: Vec<SecondaryTable>,
    pub batch_size: Option<usize>,
    pub mutable: bool,
    /// Hand out uninitialized references from `get_reference` and lazy to-ones.
    pub lazy: bool,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: "id".to_string(),
            id_generation: IdGeneration::Assigned,
            properties: Vec::new(),
            version: None,
            natural_id: Vec::new(),
            natural_id_mutable: false,
            discriminator: None,
            superclass: None,
            secondary_tables: Vec::new(),
            batch_size: None,
            mutable: true,
            lazy: true,
        }
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn id_generation(mut self, generation: IdGeneration) -> Self {
        self.id_generation = generation;
        self
    }

    pub fn property(mut self, property: PropertyMapping) -> Self {
        self.properties.push(property);
        self
    }

    /// Declare a version property (an integer column incremented on every update).
    pub fn version(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        let name = name.into();
        self.properties
            .push(PropertyMapping::basic(name.clone(), column).not_null());
        self.version = Some(name);
        self
    }

    pub fn natural_id(mut self, properties: &[&str], mutable: bool) -> Self {
        self.natural_id = properties.iter().map(|p| (*p).to_string()).collect();
        self.natural_id_mutable = mutable;
        self
    }

    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.discriminator = Some(Discriminator {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn secondary_table(mut self, table: impl Into<String>, key_column: impl Into<String>) -> Self {
        self.secondary_tables.push(SecondaryTable {
            table: table.into(),
            key_column: key_column.into(),
        });
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }
}

/// How an entity's rows are laid out relative to its hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inheritance {
    None,
    /// Every class of the hierarchy shares the root table; rows carry a discriminator.
    SingleTable,
    /// Every concrete class has its own table holding all its columns.
    TablePerClass,
}

/// Resolved descriptor of one entity type, shared by every instance and action.
#[derive(Debug)]
pub struct EntityPersister {
    name: String,
    root: String,
    superclass: Option<String>,
    table: String,
    id_column: String,
    id_generation: IdGeneration,
    properties: Vec<PropertyMapping>,
    version_index: Option<usize>,
    natural_id: Vec<usize>,
    natural_id_mutable: bool,
    discriminator: Option<Discriminator>,
    inheritance: Inheritance,
    subclasses: Vec<String>,
    secondary_tables: Vec<SecondaryTable>,
    batch_size: Option<usize>,
    mutable: bool,
    lazy: bool,
}

impl EntityPersister {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root of the inheritance hierarchy; identity-map keys use this name.
    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn id_generation(&self) -> &IdGeneration {
        &self.id_generation
    }

    /// All properties, inherited first, in declaration order.
    pub fn properties(&self) -> &[PropertyMapping] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> &PropertyMapping {
        &self.properties[index]
    }

    pub fn property_index(&self, name: &str) -> Result<usize> {
        self.properties
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| {
                Error::IllegalArgument(format!(
                    "Unknown property '{}' of entity {}",
                    name, self.name
                ))
            })
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version_index
    }

    pub fn is_versioned(&self) -> bool {
        self.version_index.is_some()
    }

    pub fn natural_id_indices(&self) -> &[usize] {
        &self.natural_id
    }

    pub fn has_natural_id(&self) -> bool {
        !self.natural_id.is_empty()
    }

    pub fn is_natural_id_mutable(&self) -> bool {
        self.natural_id_mutable
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    pub fn inheritance(&self) -> Inheritance {
        self.inheritance
    }

    /// Names of all transitive subclasses, excluding this entity.
    pub fn subclasses(&self) -> &[String] {
        &self.subclasses
    }

    pub fn has_subclasses(&self) -> bool {
        !self.subclasses.is_empty()
    }

    pub fn secondary_tables(&self) -> &[SecondaryTable] {
        &self.secondary_tables
    }

    pub fn is_multi_table(&self) -> bool {
        !self.secondary_tables.is_empty()
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Tables written by instances of exactly this entity type, primary first.
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.table.as_str())
            .chain(self.secondary_tables.iter().map(|t| t.table.as_str()))
            .collect()
    }

    /// Key column joining `table` to the identifier.
    pub fn key_column_of(&self, table: &str) -> &str {
        self.secondary_tables
            .iter()
            .find(|t| t.table == table)
            .map_or(self.id_column.as_str(), |t| t.key_column.as_str())
    }

    /// Indices of properties whose column lives in `table`.
    pub fn table_properties(&self, table: &str) -> Vec<usize> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.column().is_some() && p.table.as_deref().unwrap_or(&self.table) == table
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_collections(&self) -> bool {
        self.properties.iter().any(PropertyMapping::is_collection)
    }

    /// Collections this side writes (neither inverse nor empty of storage).
    pub fn has_owned_collections(&self) -> bool {
        self.properties.iter().any(|p| match &p.kind {
            PropertyKind::Collection(c) => !c.inverse,
            _ => false,
        })
    }

    /// Collections the other side owns (inverse); their element rows point at this entity.
    pub fn has_unowned_collections(&self) -> bool {
        self.properties.iter().any(|p| match &p.kind {
            PropertyKind::Collection(c) => c.inverse,
            _ => false,
        })
    }

    pub fn has_cascade(&self, style: CascadeStyle) -> bool {
        self.properties.iter().any(|p| p.cascade.contains(style))
    }

    /// Can an uninitialized reference be deleted by identifier alone?
    ///
    /// Every collection kind blocks it. Un-owned (inverse) collections hold rows keyed by this
    /// entity that only the loaded path sees. Owned collections (one-to-many keyed in the element
    /// table, many-to-many through a join table) are removed by collection actions, which the
    /// identifier-only delete never schedules.
    ///
    /// Listener and interceptor registrations are checked by the session on top of this.
    pub fn can_delete_unloaded(&self) -> bool {
        !self.has_subclasses()
            && self.inheritance == Inheritance::None
            && !self.has_cascade(CascadeStyle::REMOVE)
            && !self.has_natural_id()
            && !self.has_unowned_collections()
            && !self.has_owned_collections()
    }
}

/// A resolved collection role.
#[derive(Debug)]
pub struct CollectionPersister {
    pub owner: Arc<EntityPersister>,
    pub property_index: usize,
    pub element: Arc<EntityPersister>,
    pub metadata: CollectionMetadata,
}

impl CollectionPersister {
    pub fn role(&self) -> &str {
        &self.metadata.role
    }

    pub fn is_inverse(&self) -> bool {
        self.metadata.inverse
    }

    pub fn is_many_to_many(&self) -> bool {
        self.metadata.join_table.is_some()
    }

    pub fn cascade(&self) -> CascadeStyle {
        self.owner.property(self.property_index).cascade
    }

    /// Table written by collection actions (join table or element table).
    pub fn table(&self) -> &str {
        self.metadata
            .join_table
            .as_ref()
            .map_or(self.element.table(), |j| j.table.as_str())
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.metadata.batch_size
    }
}

/// Compiled set of persisters.
#[derive(Debug, Default, Clone)]
pub struct Metamodel {
    entities: BTreeMap<String, Arc<EntityPersister>>,
    collections: HashMap<String, Arc<CollectionPersister>>,
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    pub fn persister(&self, name: &str) -> Result<Arc<EntityPersister>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IllegalArgument(format!("Unknown entity: {}", name)))
    }

    pub fn collection(&self, role: &str) -> Result<Arc<CollectionPersister>> {
        self.collections
            .get(role)
            .cloned()
            .ok_or_else(|| Error::IllegalArgument(format!("Unknown collection role: {}", role)))
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Concrete persister for a discriminator value within `root`'s hierarchy.
    pub fn subtype_for_discriminator(
        &self,
        root: &EntityPersister,
        value: &Value,
    ) -> Option<Arc<EntityPersister>> {
        std::iter::once(root.name())
            .chain(root.subclasses().iter().map(String::as_str))
            .filter_map(|name| self.entities.get(name))
            .find(|p| {
                p.discriminator()
                    .is_some_and(|d| d.value.same_identifier(value))
            })
            .cloned()
    }

    /// Tables touched by queries over `name`, including subclass tables.
    pub fn query_spaces(&self, name: &str) -> Result<Vec<String>> {
        let persister = self.persister(name)?;
        let mut spaces: Vec<String> = Vec::new();
        let closure = std::iter::once(persister.name().to_string())
            .chain(persister.subclasses().iter().cloned());
        for entity in closure {
            for table in self.persister(&entity)?.tables() {
                if !spaces.iter().any(|s| s == table) {
                    spaces.push(table.to_string());
                }
            }
        }
        Ok(spaces)
    }
}

/// Collects [`EntityMetadata`] and compiles them into a [`Metamodel`].
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    entities: Vec<EntityMetadata>,
}

impl MetamodelBuilder {
    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.entities.push(metadata);
        self
    }

    pub fn build(self) -> Result<Metamodel> {
        let declared: HashMap<String, EntityMetadata> = self
            .entities
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        let mut entities = BTreeMap::new();
        for name in declared.keys() {
            let persister = compile(name, &declared)?;
            entities.insert(name.clone(), Arc::new(persister));
        }

        let mut collections = HashMap::new();
        for persister in entities.values() {
            for (index, property) in persister.properties().iter().enumerate() {
                match &property.kind {
                    PropertyKind::ToOne { target, .. } if !entities.contains_key(target) => {
                        return Err(config_error(format!(
                            "{}.{} references unknown entity {}",
                            persister.name(),
                            property.name,
                            target
                        )));
                    }
                    PropertyKind::Collection(meta) => {
                        let element = entities.get(&meta.element).cloned().ok_or_else(|| {
                            config_error(format!(
                                "{}.{} references unknown entity {}",
                                persister.name(),
                                property.name,
                                meta.element
                            ))
                        })?;
                        // Inherited collections belong to the declaring entity.
                        let declared_here = meta
                            .role
                            .strip_prefix(persister.name())
                            .is_some_and(|rest| rest.starts_with('.'));
                        if !declared_here {
                            continue;
                        }
                        let role = meta.role.clone();
                        collections.insert(
                            role,
                            Arc::new(CollectionPersister {
                                owner: Arc::clone(persister),
                                property_index: index,
                                element,
                                metadata: meta.clone(),
                            }),
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(Metamodel {
            entities,
            collections,
        })
    }
}

fn config_error(message: String) -> Error {
    Error::Config(crate::error::ConfigError {
        message,
        source: None,
    })
}

fn ancestry<'a>(
    name: &str,
    declared: &'a HashMap<String, EntityMetadata>,
) -> Result<Vec<&'a EntityMetadata>> {
    let mut chain = Vec::new();
    let mut current = Some(name.to_string());
    while let Some(n) = current {
        let meta = declared
            .get(&n)
            .ok_or_else(|| config_error(format!("Unknown superclass: {}", n)))?;
        if chain.iter().any(|m: &&EntityMetadata| m.name == meta.name) {
            return Err(config_error(format!("Inheritance cycle at {}", n)));
        }
        chain.push(meta);
        current = meta.superclass.clone();
    }
    chain.reverse();
    Ok(chain)
}

fn compile(name: &str, declared: &HashMap<String, EntityMetadata>) -> Result<EntityPersister> {
    let chain = ancestry(name, declared)?;
    let root = chain[0];
    let own = chain[chain.len() - 1];

    let mut properties: Vec<PropertyMapping> = Vec::new();
    let mut version = None;
    let mut natural_id_names: Vec<String> = Vec::new();
    for meta in &chain {
        for property in &meta.properties {
            let mut property = property.clone();
            if let PropertyKind::Collection(c) = &mut property.kind {
                c.role = format!("{}.{}", meta.name, property.name);
            }
            properties.push(property);
        }
        if meta.version.is_some() {
            version.clone_from(&meta.version);
        }
        if !meta.natural_id.is_empty() {
            natural_id_names.clone_from(&meta.natural_id);
        }
    }

    let index_of = |prop: &str| {
        properties
            .iter()
            .position(|p| p.name == prop)
            .ok_or_else(|| config_error(format!("{} has no property {}", name, prop)))
    };
    let version_index = version.as_deref().map(index_of).transpose()?;
    let natural_id = natural_id_names
        .iter()
        .map(|p| index_of(p))
        .collect::<Result<Vec<_>>>()?;

    let inheritance = if chain.len() == 1 && !has_children(name, declared) {
        Inheritance::None
    } else if declared
        .values()
        .filter(|m| ancestry(&m.name, declared).is_ok_and(|c| c[0].name == root.name))
        .all(|m| m.table == root.table)
    {
        Inheritance::SingleTable
    } else {
        Inheritance::TablePerClass
    };

    // Single-table subclasses share the root's discriminator column.
    let discriminator = match (&own.discriminator, &root.discriminator) {
        (Some(d), Some(r)) => Some(Discriminator {
            column: r.column.clone(),
            value: d.value.clone(),
        }),
        _ if inheritance == Inheritance::SingleTable => {
            return Err(config_error(format!(
                "{} is part of a single-table hierarchy and needs a discriminator value",
                name
            )));
        }
        (d, _) => d.clone(),
    };

    let mut subclasses = Vec::new();
    collect_subclasses(name, declared, &mut subclasses);

    let mut secondary_tables = Vec::new();
    for meta in &chain {
        secondary_tables.extend(meta.secondary_tables.iter().cloned());
    }

    Ok(EntityPersister {
        name: own.name.clone(),
        root: root.name.clone(),
        superclass: own.superclass.clone(),
        table: own.table.clone(),
        id_column: root.id_column.clone(),
        id_generation: root.id_generation.clone(),
        properties,
        version_index,
        natural_id,
        natural_id_mutable: root.natural_id_mutable || own.natural_id_mutable,
        discriminator,
        inheritance,
        subclasses,
        secondary_tables,
        batch_size: own.batch_size.or(root.batch_size),
        mutable: own.mutable,
        lazy: own.lazy,
    })
}

fn has_children(name: &str, declared: &HashMap<String, EntityMetadata>) -> bool {
    declared
        .values()
        .any(|m| m.superclass.as_deref() == Some(name))
}

fn collect_subclasses(name: &str, declared: &HashMap<String, EntityMetadata>, out: &mut Vec<String>) {
    let mut children: Vec<&EntityMetadata> = declared
        .values()
        .filter(|m| m.superclass.as_deref() == Some(name))
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    for child in children {
        out.push(child.name.clone());
        collect_subclasses(&child.name, declared, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zoo() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityMetadata::new("Animal", "animal")
                    .discriminator("kind", "animal")
                    .property(PropertyMapping::basic("name", "name")),
            )
            .entity(
                EntityMetadata::new("Dog", "animal")
                    .extends("Animal")
                    .discriminator("kind", "dog")
                    .property(PropertyMapping::basic("breed", "breed")),
            )
            .entity(
                EntityMetadata::new("Owner", "owner")
                    .version("version", "version")
                    .property(PropertyMapping::basic("name", "name"))
                    .property(
                        PropertyMapping::collection(
                            "pets",
                            CollectionMetadata::one_to_many("Animal", "owner_id"),
                        )
                        .cascade(CascadeStyle::ALL),
                    ),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn subclass_flattens_properties() {
        let model = zoo();
        let dog = model.persister("Dog").unwrap();
        assert_eq!(dog.root_name(), "Animal");
        assert_eq!(dog.properties().len(), 2);
        assert_eq!(dog.property_index("breed").unwrap(), 1);
        assert_eq!(dog.inheritance(), Inheritance::SingleTable);

        let animal = model.persister("Animal").unwrap();
        assert_eq!(animal.subclasses(), ["Dog".to_string()]);
        assert!(!animal.can_delete_unloaded());
        let found = model
            .subtype_for_discriminator(&animal, &Value::Text("dog".into()))
            .unwrap();
        assert_eq!(found.name(), "Dog");
    }

    #[test]
    fn collection_roles_are_registered() {
        let model = zoo();
        let pets = model.collection("Owner.pets").unwrap();
        assert_eq!(pets.element.name(), "Animal");
        assert_eq!(pets.table(), "animal");
        assert!(pets.cascade().contains(CascadeStyle::REMOVE));
        let owner = model.persister("Owner").unwrap();
        assert_eq!(owner.version_index(), Some(0));
        assert!(!owner.can_delete_unloaded());
    }

    #[test]
    fn any_collection_blocks_deleting_unloaded() {
        let model = Metamodel::builder()
            .entity(
                EntityMetadata::new("Pig", "pig").property(PropertyMapping::basic("name", "name")),
            )
            .entity(
                EntityMetadata::new("Farmer", "farmer").property(PropertyMapping::collection(
                    "pigs",
                    CollectionMetadata::one_to_many("Pig", "farmer_id").inverse(),
                )),
            )
            .entity(
                EntityMetadata::new("Barn", "barn").property(PropertyMapping::collection(
                    "pigs",
                    CollectionMetadata::many_to_many("Pig", "barn_pig", "barn_id", "pig_id"),
                )),
            )
            .build()
            .unwrap();

        assert!(model.persister("Pig").unwrap().can_delete_unloaded());

        let farmer = model.persister("Farmer").unwrap();
        assert!(farmer.has_unowned_collections());
        assert!(!farmer.has_owned_collections());
        assert!(!farmer.can_delete_unloaded());

        let barn = model.persister("Barn").unwrap();
        assert!(!barn.has_unowned_collections());
        assert!(barn.has_owned_collections());
        assert!(!barn.can_delete_unloaded());
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let err = Metamodel::builder()
            .entity(
                EntityMetadata::new("Pig", "pig")
                    .property(PropertyMapping::to_one("owner", "Farmer", "farmer_id")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn cascade_style_sets() {
        let style = CascadeStyle::PERSIST | CascadeStyle::REMOVE;
        assert!(style.contains(CascadeStyle::REMOVE));
        assert!(!style.contains(CascadeStyle::MERGE));
        assert!(CascadeStyle::ALL.contains(CascadeStyle::LOCK));
        assert!(!CascadeStyle::ALL.has_orphan_delete());
        assert_eq!(format!("{:?}", style), "persist,remove");
    }

    #[test]
    fn query_spaces_cover_secondary_tables() {
        let model = Metamodel::builder()
            .entity(
                EntityMetadata::new("Pig", "pig")
                    .secondary_table("pig_details", "pig_id")
                    .property(PropertyMapping::basic("name", "name"))
                    .property(PropertyMapping::basic("diet", "diet").in_table("pig_details")),
            )
            .build()
            .unwrap();
        let pig = model.persister("Pig").unwrap();
        assert_eq!(model.query_spaces("Pig").unwrap(), ["pig", "pig_details"]);
        assert_eq!(pig.table_properties("pig_details"), vec![1]);
        assert_eq!(pig.key_column_of("pig_details"), "pig_id");
        assert_eq!(pig.key_column_of("pig"), "id");
    }
}
