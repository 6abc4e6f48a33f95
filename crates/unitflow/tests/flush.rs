//! Flush: dirty checking, statement batching, identifier generation and failure handling.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{SqliteDb, expect_err, new_pig, pig_db, pig_model, seed_pig, unwrap_outcome};
use unitflow::prelude::*;
use unitflow_core::QueryErrorKind;

fn ticket_model(generation: IdGeneration) -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMetadata::new("Ticket", "ticket")
                .id_generation(generation)
                .property(PropertyMapping::basic("title", "title")),
        )
        .build()
        .expect("ticket model")
}

fn new_ticket(factory: &SessionFactory, title: &str) -> Entity {
    let ticket = Entity::new(factory.persister("Ticket").expect("ticket persister"));
    ticket.set("title", title).expect("title");
    ticket
}

/// Pigs and unversioned cages, for statements that interleave.
fn barn_model() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityMetadata::new("GuineaPig", "pig")
                .property(PropertyMapping::basic("name", "name"))
                .version("version", "version"),
        )
        .entity(EntityMetadata::new("Cage", "cage").property(PropertyMapping::basic("label", "label")))
        .build()
        .expect("barn model")
}

const PIG_UPDATE: &str = r#"UPDATE "pig" SET "name" = ?1, "version" = ?2 WHERE "id" = ?3 AND "version" = ?4"#;
const CAGE_UPDATE: &str = r#"UPDATE "cage" SET "label" = ?1 WHERE "id" = ?2"#;

#[test]
fn clean_instances_write_nothing() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        unwrap_outcome(session.commit(&cx).await);
        assert!(db.writes().is_empty());

        pig.set("name", "Hamtaro").expect("name");
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.writes(), vec![format!("execute {PIG_UPDATE}")]);
        assert_eq!(pig.version(), Some(Value::Int(1)));
        let row = db.row("pig", 5_i64).expect("row");
        assert_eq!(row.get("version"), Some(&Value::Int(1)));
    });
}

#[test]
fn identical_updates_share_one_batch() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        for (id, name) in [(1, "Peanut"), (2, "Pip"), (3, "Biscuit")] {
            seed_pig(&db, id, name);
        }
        let factory = SessionFactory::builder(pig_model())
            .options(SessionFactoryOptions::default().batch_size(10))
            .build();
        let mut session = factory.open_session(db.clone());

        for id in 1_i64..=3 {
            let pig = unwrap_outcome(session.find(&cx, "GuineaPig", id).await).expect("pig");
            pig.set("name", format!("renamed {id}").as_str()).expect("name");
        }
        db.clear_log();
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.writes(), vec![format!("batch[3] {PIG_UPDATE}")]);
        assert_eq!(session.batch_round_trips(), 1);
        for id in 1_i64..=3 {
            let row = db.row("pig", id).expect("row");
            assert_eq!(row.get("name"), Some(&Value::from(format!("renamed {id}").as_str())));
        }
    });
}

#[test]
fn interleaved_statements_break_batches_unless_updates_are_ordered() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();

        for ordered in [false, true] {
            let db = pig_db().schema(r#"CREATE TABLE "cage" ("id" BIGINT PRIMARY KEY, "label" TEXT)"#);
            seed_pig(&db, 1, "Peanut");
            seed_pig(&db, 2, "Pip");
            db.seed("cage", &[("id", Value::BigInt(1)), ("label", Value::from("north"))]);
            let factory = SessionFactory::builder(barn_model())
                .options(
                    SessionFactoryOptions::default()
                        .batch_size(10)
                        .order_updates(ordered),
                )
                .build();
            let mut session = factory.open_session(db.clone());

            let first = unwrap_outcome(session.find(&cx, "GuineaPig", 1_i64).await).expect("pig");
            let cage = unwrap_outcome(session.find(&cx, "Cage", 1_i64).await).expect("cage");
            let second = unwrap_outcome(session.find(&cx, "GuineaPig", 2_i64).await).expect("pig");
            first.set("name", "Peanut II").expect("name");
            cage.set("label", "south").expect("label");
            second.set("name", "Pip II").expect("name");

            db.clear_log();
            unwrap_outcome(session.commit(&cx).await);
            let expected = if ordered {
                vec![format!("execute {CAGE_UPDATE}"), format!("batch[2] {PIG_UPDATE}")]
            } else {
                vec![
                    format!("execute {PIG_UPDATE}"),
                    format!("execute {CAGE_UPDATE}"),
                    format!("execute {PIG_UPDATE}"),
                ]
            };
            assert_eq!(db.writes(), expected, "order_updates = {ordered}");
        }
    });
}

#[test]
fn identity_insert_runs_at_persist_time() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = SqliteDb::new()
            .schema(r#"CREATE TABLE "ticket" ("id" INTEGER PRIMARY KEY AUTOINCREMENT, "title" TEXT)"#);
        db.raw_execute(
            r#"INSERT INTO "sqlite_sequence" ("name", "seq") VALUES (?1, ?2)"#,
            &[Value::from("ticket"), Value::BigInt(99)],
        );
        let factory = SessionFactory::builder(ticket_model(IdGeneration::Identity)).build();
        let mut session = factory.open_session(db.clone());

        let ticket = new_ticket(&factory, "leaky roof");
        unwrap_outcome(session.persist(&cx, &ticket).await);
        assert!(ticket.id().same_identifier(&Value::BigInt(100)));
        assert!(session.action_queue_description().is_empty());
        assert_eq!(
            db.writes(),
            vec![r#"insert INSERT INTO "ticket" ("title") VALUES (?1)"#]
        );
        let found = unwrap_outcome(session.find(&cx, "Ticket", 100_i64).await).expect("same instance");
        assert!(found.ptr_eq(&ticket));

        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.count("ticket"), 1);
    });
}

#[test]
fn sequences_need_a_dialect_that_has_them() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = SqliteDb::new()
            .schema(r#"CREATE TABLE "ticket" ("id" BIGINT PRIMARY KEY, "title" TEXT)"#);
        let factory = SessionFactory::builder(ticket_model(IdGeneration::Sequence {
            name: "ticket_seq".to_string(),
            allocation_size: 3,
        }))
        .build();
        let mut session = factory.open_session(db.clone());

        let ticket = new_ticket(&factory, "one");
        let err = expect_err(session.persist(&cx, &ticket).await);
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(ticket.id().is_null());
        assert!(!session.contains(&ticket));
        assert!(db.log().is_empty());
    });
}

#[test]
fn database_failures_carry_the_statement_and_poison_the_session() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let impostor = new_pig(&factory, 5, "Impostor");
        unwrap_outcome(session.persist(&cx, &impostor).await);
        let err = expect_err(session.commit(&cx).await);
        let Error::Execution(execution) = &err else {
            panic!("expected an execution error, got {err}");
        };
        assert!(
            matches!(&*execution.source, Error::Query(q) if q.kind == QueryErrorKind::Constraint),
            "{err}"
        );
        assert_eq!(
            err.sql(),
            Some(r#"INSERT INTO "pig" ("id", "name", "version") VALUES (?1, ?2, ?3)"#)
        );

        let err = expect_err(session.find(&cx, "GuineaPig", 5_i64).await);
        assert!(matches!(err, Error::IllegalState(_)), "{err}");
        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::IllegalState(_)), "{err}");

        unwrap_outcome(session.rollback(&cx).await);
        let row = db.row("pig", 5_i64).expect("original row");
        assert_eq!(row.get("name"), Some(&Value::from("McCloud")));
    });
}

#[test]
fn concurrent_version_change_is_stale() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        db.raw_execute(
            r#"UPDATE "pig" SET "version" = ?1 WHERE "id" = ?2"#,
            &[Value::Int(1), Value::BigInt(5)],
        );
        pig.set("name", "Hamtaro").expect("name");
        let err = expect_err(session.commit(&cx).await);
        assert!(err.is_stale_state(), "{err}");

        let err = expect_err(session.persist(&cx, &new_pig(&factory, 6, "Pip")).await);
        assert!(matches!(err, Error::IllegalState(_)), "{err}");
    });
}

#[test]
fn immutable_natural_id_cannot_change() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let model = Metamodel::builder()
            .entity(
                EntityMetadata::new("Account", "account")
                    .property(PropertyMapping::basic("code", "code"))
                    .property(PropertyMapping::basic("owner", "owner"))
                    .natural_id(&["code"], false),
            )
            .build()
            .expect("model");
        let db = SqliteDb::new().schema(
            r#"CREATE TABLE "account" ("id" BIGINT PRIMARY KEY, "code" TEXT UNIQUE, "owner" TEXT)"#,
        );
        db.seed(
            "account",
            &[
                ("id", Value::BigInt(1)),
                ("code", Value::from("ACC-1")),
                ("owner", Value::from("Moe")),
            ],
        );
        let factory = SessionFactory::builder(model).build();
        let mut session = factory.open_session(db.clone());

        let account = unwrap_outcome(session.find(&cx, "Account", 1_i64).await).expect("account");
        account.set("owner", "Larry").expect("owner");
        unwrap_outcome(session.flush(&cx).await);

        account.set("code", "ACC-2").expect("code");
        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::IllegalState(_)), "{err}");
    });
}

#[test]
fn manual_flush_mode_leaves_changes_pending_at_commit() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session =
            factory.open_session_with(db.clone(), SessionConfig::default().flush_mode(FlushMode::Manual));

        let pig = new_pig(&factory, 5, "McCloud");
        unwrap_outcome(session.persist(&cx, &pig).await);
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.count("pig"), 0);
        assert!(session.has_pending_actions());

        unwrap_outcome(session.flush(&cx).await);
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.count("pig"), 1);
    });
}

#[test]
fn session_callbacks_fire_around_flush_and_commit() {
    use std::sync::{Arc, Mutex};

    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        for (name, event) in [("before_flush", 0), ("after_flush", 1), ("before_commit", 2), ("after_commit", 3)] {
            let events = Arc::clone(&events);
            let record = move || {
                events.lock().expect("events").push(name);
                Ok(())
            };
            match event {
                0 => session.on_before_flush(record),
                1 => session.on_after_flush(record),
                2 => session.on_before_commit(record),
                _ => session.on_after_commit(record),
            }
        }

        unwrap_outcome(session.persist(&cx, &new_pig(&factory, 5, "McCloud")).await);
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(
            *events.lock().expect("events"),
            vec!["before_flush", "after_flush", "before_commit", "after_commit"]
        );
    });
}
