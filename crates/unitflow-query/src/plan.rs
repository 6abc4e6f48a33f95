//! Load plans: the SELECT statements used to hydrate entities and collections.
//!
//! A plan depends only on the persister, the plan kind, the lock mode and the number of keys,
//! so plans are built once and shared through the [`PlanCache`](crate::PlanCache).

use crate::statement::select_columns;
use unitflow_core::{
    CollectionPersister, Dialect, EntityPersister, Error, Inheritance, LockMode, Metamodel,
    Result,
};

/// What a plan loads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlanKind {
    /// Entities by a batch of `keys` identifiers.
    ById { keys: usize },
    /// Identifier by natural-id values.
    NaturalId,
    /// Elements of a collection by a batch of `keys` owner keys.
    CollectionByKey { keys: usize },
    /// Current version (optimistic verification).
    Version,
    /// Locking re-read of id and version.
    Lock,
    /// Row existence by identifier.
    Existence,
}

/// One SELECT of a plan. Polymorphic table-per-class plans have one branch per concrete class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanBranch {
    /// Entity whose table the branch reads; rows of single-table hierarchies resolve their
    /// concrete type through the discriminator instead.
    pub entity: String,
    pub sql: String,
}

/// Follow-up SELECT reading a secondary table by identifier batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondarySelect {
    pub table: String,
    pub key_column: String,
    /// SQL with `keys` placeholders; filled per identifier batch.
    pub sql_prefix: String,
    pub columns: Vec<String>,
}

impl SecondarySelect {
    pub fn sql(&self, dialect: Dialect, keys: usize) -> String {
        format!("{}{})", self.sql_prefix, dialect.placeholders(1, keys))
    }
}

/// Immutable translation of a load into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub kind: PlanKind,
    pub lock: LockMode,
    pub branches: Vec<PlanBranch>,
    pub secondary: Vec<SecondarySelect>,
    /// Column carrying the restriction key in every branch (identifier or collection key).
    pub key_column: String,
}

fn concrete_closure(
    metamodel: &Metamodel,
    persister: &EntityPersister,
) -> Result<Vec<std::sync::Arc<EntityPersister>>> {
    std::iter::once(persister.name())
        .chain(persister.subclasses().iter().map(String::as_str))
        .map(|name| metamodel.persister(name))
        .collect()
}

fn restriction(dialect: Dialect, column: &str, keys: usize) -> String {
    if keys == 1 {
        format!(
            "{} = {}",
            dialect.quote_identifier(column),
            dialect.placeholder(1)
        )
    } else {
        format!(
            "{} IN ({})",
            dialect.quote_identifier(column),
            dialect.placeholders(1, keys)
        )
    }
}

fn push_unique(columns: &mut Vec<String>, column: &str) {
    if !columns.iter().any(|c| c == column) {
        columns.push(column.to_string());
    }
}

/// SELECT hydrating `persister` (and its subclasses) restricted by `key_column`.
fn entity_select(
    metamodel: &Metamodel,
    persister: &EntityPersister,
    dialect: Dialect,
    key_column: &str,
    keys: usize,
    lock: LockMode,
    kind: PlanKind,
) -> Result<LoadPlan> {
    let closure = concrete_closure(metamodel, persister)?;
    let mut branches = Vec::new();
    let quote_all = |columns: &[String]| {
        columns
            .iter()
            .map(|c| dialect.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let branch_sources: Vec<Vec<&EntityPersister>> = match persister.inheritance() {
        Inheritance::TablePerClass => closure.iter().map(|p| vec![p.as_ref()]).collect(),
        Inheritance::None | Inheritance::SingleTable => {
            vec![closure.iter().map(AsRef::as_ref).collect()]
        }
    };

    for sources in branch_sources {
        let head = sources[0];
        let mut columns = vec![head.id_column().to_string()];
        push_unique(&mut columns, key_column);
        if let Some(d) = head.discriminator() {
            push_unique(&mut columns, &d.column);
        }
        for source in &sources {
            for column in select_columns(source, source.table()) {
                push_unique(&mut columns, &column);
            }
        }
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            quote_all(&columns),
            dialect.quote_identifier(head.table()),
            restriction(dialect, key_column, keys)
        );
        // Subclass loads in a shared table only see their own rows.
        if persister.inheritance() == Inheritance::SingleTable && persister.superclass().is_some()
        {
            if let Some(d) = persister.discriminator() {
                let values: Vec<String> = sources
                    .iter()
                    .filter_map(|p| p.discriminator())
                    .map(|d| sql_literal(&d.value))
                    .collect();
                sql.push_str(&format!(
                    " AND {} IN ({})",
                    dialect.quote_identifier(&d.column),
                    values.join(", ")
                ));
            }
        }
        sql.push_str(dialect.lock_suffix(lock));
        branches.push(PlanBranch {
            entity: head.name().to_string(),
            sql,
        });
    }

    let mut secondary: Vec<SecondarySelect> = Vec::new();
    for source in &closure {
        for table in source.secondary_tables() {
            if secondary.iter().any(|s| s.table == table.table) {
                continue;
            }
            let mut columns = vec![table.key_column.clone()];
            for column in select_columns(source, &table.table) {
                push_unique(&mut columns, &column);
            }
            let sql_prefix = format!(
                "SELECT {} FROM {} WHERE {} IN (",
                quote_all(&columns),
                dialect.quote_identifier(&table.table),
                dialect.quote_identifier(&table.key_column)
            );
            secondary.push(SecondarySelect {
                table: table.table.clone(),
                key_column: table.key_column.clone(),
                sql_prefix,
                columns,
            });
        }
    }

    Ok(LoadPlan {
        kind,
        lock,
        branches,
        secondary,
        key_column: key_column.to_string(),
    })
}

fn sql_literal(value: &unitflow_core::Value) -> String {
    match value {
        unitflow_core::Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

/// Plan loading entities of `persister` by `keys` identifiers.
pub fn entity_load_plan(
    metamodel: &Metamodel,
    persister: &EntityPersister,
    dialect: Dialect,
    keys: usize,
    lock: LockMode,
) -> Result<LoadPlan> {
    entity_select(
        metamodel,
        persister,
        dialect,
        persister.id_column(),
        keys,
        lock,
        PlanKind::ById { keys },
    )
}

/// Plan loading the elements of `collection` for `keys` owners.
///
/// One-to-many collections read the element table by key column. Many-to-many collections
/// read the join table; the elements themselves are then loaded by identifier.
pub fn collection_load_plan(
    metamodel: &Metamodel,
    collection: &CollectionPersister,
    dialect: Dialect,
    keys: usize,
) -> Result<LoadPlan> {
    let kind = PlanKind::CollectionByKey { keys };
    match &collection.metadata.join_table {
        None => entity_select(
            metamodel,
            &collection.element,
            dialect,
            &collection.metadata.key_column,
            keys,
            LockMode::None,
            kind,
        ),
        Some(join) => {
            let sql = format!(
                "SELECT {}, {} FROM {} WHERE {}",
                dialect.quote_identifier(&collection.metadata.key_column),
                dialect.quote_identifier(&join.element_column),
                dialect.quote_identifier(&join.table),
                restriction(dialect, &collection.metadata.key_column, keys)
            );
            Ok(LoadPlan {
                kind,
                lock: LockMode::None,
                branches: vec![PlanBranch {
                    entity: collection.element.name().to_string(),
                    sql,
                }],
                secondary: Vec::new(),
                key_column: collection.metadata.key_column.clone(),
            })
        }
    }
}

/// Plan resolving an identifier from natural-id values.
pub fn natural_id_plan(persister: &EntityPersister, dialect: Dialect) -> Result<LoadPlan> {
    if !persister.has_natural_id() {
        return Err(Error::IllegalArgument(format!(
            "Entity {} does not define a natural id",
            persister.name()
        )));
    }
    let conditions: Vec<String> = persister
        .natural_id_indices()
        .iter()
        .enumerate()
        .map(|(n, &i)| {
            format!(
                "{} = {}",
                dialect.quote_identifier(persister.property(i).column().unwrap_or_default()),
                dialect.placeholder(n + 1)
            )
        })
        .collect();
    Ok(single_branch(
        persister,
        PlanKind::NaturalId,
        LockMode::None,
        format!(
            "SELECT {} FROM {} WHERE {}",
            dialect.quote_identifier(persister.id_column()),
            dialect.quote_identifier(persister.table()),
            conditions.join(" AND ")
        ),
    ))
}

/// Plan re-reading the version column of one row.
pub fn version_plan(persister: &EntityPersister, dialect: Dialect) -> Result<LoadPlan> {
    let version = version_column(persister)?;
    Ok(single_branch(
        persister,
        PlanKind::Version,
        LockMode::None,
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            dialect.quote_identifier(version),
            dialect.quote_identifier(persister.table()),
            dialect.quote_identifier(persister.id_column()),
            dialect.placeholder(1)
        ),
    ))
}

/// Plan acquiring a pessimistic lock; versioned rows must still carry the expected version.
pub fn lock_plan(persister: &EntityPersister, dialect: Dialect, lock: LockMode) -> LoadPlan {
    let id = dialect.quote_identifier(persister.id_column());
    let mut sql = match persister.version_index() {
        Some(_) => {
            let version =
                dialect.quote_identifier(version_column(persister).unwrap_or_default());
            format!(
                "SELECT {} FROM {} WHERE {} = {} AND {} = {}",
                id,
                dialect.quote_identifier(persister.table()),
                id,
                dialect.placeholder(1),
                version,
                dialect.placeholder(2)
            )
        }
        None => format!(
            "SELECT {} FROM {} WHERE {} = {}",
            id,
            dialect.quote_identifier(persister.table()),
            id,
            dialect.placeholder(1)
        ),
    };
    sql.push_str(dialect.lock_suffix(lock));
    single_branch(persister, PlanKind::Lock, lock, sql)
}

/// Plan checking whether a row exists for an identifier.
pub fn existence_plan(persister: &EntityPersister, dialect: Dialect) -> LoadPlan {
    let id = dialect.quote_identifier(persister.id_column());
    single_branch(
        persister,
        PlanKind::Existence,
        LockMode::None,
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            id,
            dialect.quote_identifier(persister.table()),
            id,
            dialect.placeholder(1)
        ),
    )
}

fn version_column(persister: &EntityPersister) -> Result<&str> {
    persister
        .version_index()
        .and_then(|i| persister.property(i).column())
        .ok_or_else(|| {
            Error::IllegalArgument(format!("Entity {} is not versioned", persister.name()))
        })
}

fn single_branch(persister: &EntityPersister, kind: PlanKind, lock: LockMode, sql: String) -> LoadPlan {
    LoadPlan {
        kind,
        lock,
        branches: vec![PlanBranch {
            entity: persister.name().to_string(),
            sql,
        }],
        secondary: Vec::new(),
        key_column: persister.id_column().to_string(),
    }
}
