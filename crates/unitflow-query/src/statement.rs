//! Mutation statement templates.
//!
//! A template is the SQL text for one table plus a description of how to bind values to its
//! placeholders. Templates depend only on the persister and dialect, so every instance of an
//! entity produces identical SQL and same-shaped statements can be batched together.

use crate::mutation::Expectation;
use unitflow_core::{CollectionPersister, Dialect, EntityPersister, PropertyKind, Value};

/// Source of one bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// The entity identifier.
    Id,
    /// Value of the property at this index in the state snapshot.
    Property(usize),
    /// The version the row is expected to carry.
    PreviousVersion,
    /// The entity's discriminator value.
    Discriminator,
    /// Identifier of a collection owner.
    OwnerKey,
    /// Identifier of a collection element.
    ElementKey,
}

/// Values available when binding a template.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindingSource<'a> {
    pub id: Option<&'a Value>,
    pub state: &'a [Value],
    pub previous_version: Option<&'a Value>,
    pub discriminator: Option<&'a Value>,
    pub owner_key: Option<&'a Value>,
    pub element_key: Option<&'a Value>,
}

/// One table's statement.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStatement {
    pub table: String,
    pub sql: String,
    pub bindings: Vec<Binding>,
    pub expectation: Expectation,
}

impl TableStatement {
    /// Bind parameter values in placeholder order.
    pub fn bind(&self, source: &BindingSource<'_>) -> Vec<Value> {
        let pick = |v: Option<&Value>| v.cloned().unwrap_or(Value::Null);
        self.bindings
            .iter()
            .map(|binding| match binding {
                Binding::Id => pick(source.id),
                Binding::Property(i) => source.state.get(*i).cloned().unwrap_or(Value::Null),
                Binding::PreviousVersion => pick(source.previous_version),
                Binding::Discriminator => pick(source.discriminator),
                Binding::OwnerKey => pick(source.owner_key),
                Binding::ElementKey => pick(source.element_key),
            })
            .collect()
    }
}

fn column_of(persister: &EntityPersister, index: usize) -> &str {
    persister.property(index).column().unwrap_or_default()
}

/// INSERT statements, primary table first.
///
/// With `include_id == false` the primary statement leaves the identifier to the database;
/// secondary tables always bind it.
pub fn insert_statements(
    persister: &EntityPersister,
    dialect: Dialect,
    include_id: bool,
) -> Vec<TableStatement> {
    let mut statements = Vec::new();
    for table in persister.tables() {
        let mut columns: Vec<String> = Vec::new();
        let mut bindings = Vec::new();
        let primary = table == persister.table();
        if !primary || include_id {
            columns.push(persister.key_column_of(table).to_string());
            bindings.push(Binding::Id);
        }
        if let Some(d) = persister.discriminator().filter(|_| primary) {
            columns.push(d.column.clone());
            bindings.push(Binding::Discriminator);
        }
        for index in persister.table_properties(table) {
            columns.push(column_of(persister, index).to_string());
            bindings.push(Binding::Property(index));
        }
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", dialect.quote_identifier(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                dialect.quote_identifier(table),
                columns
                    .iter()
                    .map(|c| dialect.quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                dialect.placeholders(1, columns.len())
            )
        };
        statements.push(TableStatement {
            table: table.to_string(),
            sql,
            bindings,
            expectation: Expectation::RowCount(1),
        });
    }
    statements
}

/// UPDATE statements for every table holding a dirty property.
///
/// All columns of an affected table are written so the SQL text does not depend on which
/// properties changed. The primary table is always written for versioned entities.
pub fn update_statements(
    persister: &EntityPersister,
    dialect: Dialect,
    dirty: &[usize],
) -> Vec<TableStatement> {
    let mut statements = Vec::new();
    for table in persister.tables() {
        let properties = persister.table_properties(table);
        let primary = table == persister.table();
        let touched = properties.iter().any(|i| dirty.contains(i))
            || (primary && persister.is_versioned());
        if properties.is_empty() || !touched {
            continue;
        }
        let mut bindings = Vec::new();
        let mut assignments = Vec::new();
        for (n, index) in properties.iter().enumerate() {
            assignments.push(format!(
                "{} = {}",
                dialect.quote_identifier(column_of(persister, *index)),
                dialect.placeholder(n + 1)
            ));
            bindings.push(Binding::Property(*index));
        }
        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            dialect.quote_identifier(table),
            assignments.join(", "),
            dialect.quote_identifier(persister.key_column_of(table)),
            dialect.placeholder(bindings.len() + 1)
        );
        bindings.push(Binding::Id);
        if let Some(version) = persister.version_index().filter(|_| primary) {
            sql.push_str(&format!(
                " AND {} = {}",
                dialect.quote_identifier(column_of(persister, version)),
                dialect.placeholder(bindings.len() + 1)
            ));
            bindings.push(Binding::PreviousVersion);
        }
        statements.push(TableStatement {
            table: table.to_string(),
            sql,
            bindings,
            expectation: Expectation::RowCount(1),
        });
    }
    statements
}

/// DELETE statements, secondary tables first.
pub fn delete_statements(
    persister: &EntityPersister,
    dialect: Dialect,
    check_version: bool,
) -> Vec<TableStatement> {
    let mut statements = Vec::new();
    for table in persister.tables().into_iter().rev() {
        let primary = table == persister.table();
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_identifier(table),
            dialect.quote_identifier(persister.key_column_of(table)),
            dialect.placeholder(1)
        );
        let mut bindings = vec![Binding::Id];
        if let Some(version) = persister
            .version_index()
            .filter(|_| primary && check_version)
        {
            sql.push_str(&format!(
                " AND {} = {}",
                dialect.quote_identifier(column_of(persister, version)),
                dialect.placeholder(2)
            ));
            bindings.push(Binding::PreviousVersion);
        }
        statements.push(TableStatement {
            table: table.to_string(),
            sql,
            bindings,
            expectation: Expectation::RowCount(1),
        });
    }
    statements
}

/// UPDATE incrementing only the version column (forced increments).
pub fn version_increment_statement(
    persister: &EntityPersister,
    dialect: Dialect,
) -> Option<TableStatement> {
    let version = persister.version_index()?;
    let column = dialect.quote_identifier(column_of(persister, version));
    Some(TableStatement {
        table: persister.table().to_string(),
        sql: format!(
            "UPDATE {} SET {} = {} WHERE {} = {} AND {} = {}",
            dialect.quote_identifier(persister.table()),
            column,
            dialect.placeholder(1),
            dialect.quote_identifier(persister.id_column()),
            dialect.placeholder(2),
            column,
            dialect.placeholder(3)
        ),
        bindings: vec![
            Binding::Property(version),
            Binding::Id,
            Binding::PreviousVersion,
        ],
        expectation: Expectation::RowCount(1),
    })
}

/// Statements maintaining the rows of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionStatements {
    /// Link one element to the owner.
    pub insert_row: TableStatement,
    /// Unlink one element from the owner.
    pub delete_row: TableStatement,
    /// Unlink every element of the owner.
    pub remove_all: TableStatement,
}

/// Collection statements: join-table rows for many-to-many, foreign key updates for
/// one-to-many.
pub fn collection_statements(
    collection: &CollectionPersister,
    dialect: Dialect,
) -> CollectionStatements {
    let key = dialect.quote_identifier(&collection.metadata.key_column);
    let table = collection.table().to_string();
    let quoted_table = dialect.quote_identifier(&table);
    let statement = |sql: String, bindings: Vec<Binding>| TableStatement {
        table: table.clone(),
        sql,
        bindings,
        expectation: Expectation::None,
    };
    match &collection.metadata.join_table {
        Some(join) => {
            let element = dialect.quote_identifier(&join.element_column);
            CollectionStatements {
                insert_row: statement(
                    format!(
                        "INSERT INTO {} ({}, {}) VALUES ({})",
                        quoted_table,
                        key,
                        element,
                        dialect.placeholders(1, 2)
                    ),
                    vec![Binding::OwnerKey, Binding::ElementKey],
                ),
                delete_row: statement(
                    format!(
                        "DELETE FROM {} WHERE {} = {} AND {} = {}",
                        quoted_table,
                        key,
                        dialect.placeholder(1),
                        element,
                        dialect.placeholder(2)
                    ),
                    vec![Binding::OwnerKey, Binding::ElementKey],
                ),
                remove_all: statement(
                    format!(
                        "DELETE FROM {} WHERE {} = {}",
                        quoted_table,
                        key,
                        dialect.placeholder(1)
                    ),
                    vec![Binding::OwnerKey],
                ),
            }
        }
        None => {
            let element_id = dialect.quote_identifier(collection.element.id_column());
            CollectionStatements {
                insert_row: statement(
                    format!(
                        "UPDATE {} SET {} = {} WHERE {} = {}",
                        quoted_table,
                        key,
                        dialect.placeholder(1),
                        element_id,
                        dialect.placeholder(2)
                    ),
                    vec![Binding::OwnerKey, Binding::ElementKey],
                ),
                delete_row: statement(
                    format!(
                        "UPDATE {} SET {} = NULL WHERE {} = {} AND {} = {}",
                        quoted_table,
                        key,
                        key,
                        dialect.placeholder(1),
                        element_id,
                        dialect.placeholder(2)
                    ),
                    vec![Binding::OwnerKey, Binding::ElementKey],
                ),
                remove_all: statement(
                    format!(
                        "UPDATE {} SET {} = NULL WHERE {} = {}",
                        quoted_table,
                        key,
                        key,
                        dialect.placeholder(1)
                    ),
                    vec![Binding::OwnerKey],
                ),
            }
        }
    }
}

/// Columns a SELECT must read to hydrate `persister` from `table`.
pub fn select_columns(persister: &EntityPersister, table: &str) -> Vec<String> {
    persister
        .table_properties(table)
        .into_iter()
        .filter_map(|i| match &persister.property(i).kind {
            PropertyKind::Basic { column } | PropertyKind::ToOne { column, .. } => {
                Some(column.clone())
            }
            PropertyKind::Collection(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitflow_core::{CollectionMetadata, EntityMetadata, Metamodel, PropertyMapping};

    fn model() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityMetadata::new("GuineaPig", "pig")
                    .version("version", "version")
                    .secondary_table("pig_details", "pig_id")
                    .property(PropertyMapping::basic("name", "name"))
                    .property(PropertyMapping::basic("diet", "diet").in_table("pig_details")),
            )
            .entity(
                EntityMetadata::new("Cage", "cage").property(PropertyMapping::collection(
                    "pigs",
                    CollectionMetadata::many_to_many("GuineaPig", "cage_pig", "cage_id", "pig_id"),
                )),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn insert_covers_every_table() {
        let model = model();
        let pig = model.persister("GuineaPig").unwrap();
        let statements = insert_statements(&pig, Dialect::Postgres, true);
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO \"pig\" (\"id\", \"version\", \"name\") VALUES ($1, $2, $3)"
        );
        assert_eq!(
            statements[1].sql,
            "INSERT INTO \"pig_details\" (\"pig_id\", \"diet\") VALUES ($1, $2)"
        );
        let state = [Value::Int(0), Value::from("Hamtaro"), Value::from("seeds")];
        let id = Value::BigInt(5);
        let params = statements[1].bind(&BindingSource {
            id: Some(&id),
            state: &state,
            ..BindingSource::default()
        });
        assert_eq!(params, vec![Value::BigInt(5), Value::from("seeds")]);

        let identity = insert_statements(&pig, Dialect::Postgres, false);
        assert_eq!(
            identity[0].sql,
            "INSERT INTO \"pig\" (\"version\", \"name\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn versioned_update_checks_previous_version() {
        let model = model();
        let pig = model.persister("GuineaPig").unwrap();
        let statements = update_statements(&pig, Dialect::Postgres, &[1]);
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "UPDATE \"pig\" SET \"version\" = $1, \"name\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(
            statements[0].bindings.last(),
            Some(&Binding::PreviousVersion)
        );

        let both = update_statements(&pig, Dialect::Postgres, &[2]);
        assert_eq!(both.len(), 2);
        assert_eq!(
            both[1].sql,
            "UPDATE \"pig_details\" SET \"diet\" = $1 WHERE \"pig_id\" = $2"
        );
    }

    #[test]
    fn delete_runs_secondary_tables_first() {
        let model = model();
        let pig = model.persister("GuineaPig").unwrap();
        let statements = delete_statements(&pig, Dialect::Postgres, true);
        assert_eq!(statements[0].table, "pig_details");
        assert_eq!(
            statements[1].sql,
            "DELETE FROM \"pig\" WHERE \"id\" = $1 AND \"version\" = $2"
        );
    }

    #[test]
    fn many_to_many_uses_the_join_table() {
        let model = model();
        let pigs = model.collection("Cage.pigs").unwrap();
        let statements = collection_statements(&pigs, Dialect::Postgres);
        assert_eq!(
            statements.insert_row.sql,
            "INSERT INTO \"cage_pig\" (\"cage_id\", \"pig_id\") VALUES ($1, $2)"
        );
        assert_eq!(
            statements.remove_all.sql,
            "DELETE FROM \"cage_pig\" WHERE \"cage_id\" = $1"
        );
        assert_eq!(statements.remove_all.expectation, Expectation::None);
    }
}
