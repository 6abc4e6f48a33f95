//! Shared fixtures for the integration tests: an in-memory SQLite database that logs what the
//! executors send, plus a few mapped models.

#![allow(dead_code)]

mod sqlite;

pub use sqlite::{Record, SqliteDb};

use unitflow::prelude::*;

// ============================================================================
// Runtime helpers
// ============================================================================

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

// ============================================================================
// Models
// ============================================================================

/// `GuineaPig` in table `pig`: assigned id, versioned, with a name.
pub fn pig_model() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMetadata::new("GuineaPig", "pig")
                .property(PropertyMapping::basic("name", "name"))
                .version("version", "version"),
        )
        .build()
        .expect("pig model")
}

pub fn pig_db() -> SqliteDb {
    SqliteDb::new().schema(r#"CREATE TABLE "pig" ("id" BIGINT PRIMARY KEY, "name" TEXT, "version" INTEGER)"#)
}

pub fn new_pig(factory: &SessionFactory, id: i64, name: &str) -> Entity {
    let pig = Entity::new(factory.persister("GuineaPig").expect("pig persister"));
    pig.set_id(id);
    pig.set("name", name).expect("name");
    pig
}

/// `Parent` owning `Child`ren through `child.parent_id`, with the cascade styles of both ends.
pub fn family_model(child_to_parent: CascadeStyle, children: CascadeStyle) -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMetadata::new("Parent", "parent")
                .property(PropertyMapping::basic("name", "name"))
                .property(
                    PropertyMapping::collection(
                        "children",
                        CollectionMetadata::one_to_many("Child", "parent_id"),
                    )
                    .cascade(children),
                ),
        )
        .entity(
            EntityMetadata::new("Child", "child")
                .property(PropertyMapping::basic("name", "name"))
                .property(PropertyMapping::to_one("parent", "Parent", "parent_id").cascade(child_to_parent)),
        )
        .build()
        .expect("family model")
}

pub fn family_db() -> SqliteDb {
    SqliteDb::new()
        .schema(r#"CREATE TABLE "parent" ("id" BIGINT PRIMARY KEY, "name" TEXT)"#)
        .schema(r#"CREATE TABLE "child" ("id" BIGINT PRIMARY KEY, "name" TEXT, "parent_id" BIGINT)"#)
}

pub fn seed_pig(db: &SqliteDb, id: i64, name: &str) {
    db.seed(
        "pig",
        &[
            ("id", Value::BigInt(id)),
            ("name", Value::from(name)),
            ("version", Value::Int(0)),
        ],
    );
}

/// Parent 1 "Moe" with children 10 "Larry" and 11 "Curly".
pub fn seed_family(db: &SqliteDb) {
    db.seed("parent", &[("id", Value::BigInt(1)), ("name", Value::from("Moe"))]);
    for (id, name) in [(10, "Larry"), (11, "Curly")] {
        db.seed(
            "child",
            &[
                ("id", Value::BigInt(id)),
                ("name", Value::from(name)),
                ("parent_id", Value::BigInt(1)),
            ],
        );
    }
}
