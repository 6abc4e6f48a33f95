//! Pessimistic and optimistic locks.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{
    expect_err, family_db, family_model, new_pig, pig_db, pig_model, seed_family, seed_pig,
    unwrap_outcome,
};
use unitflow::prelude::*;

fn lock_mode_of<C: Connection>(session: &Session<C>, entity: &Entity) -> Option<LockMode> {
    session
        .persistence_context()
        .entry(entity)
        .map(|entry| entry.lock_mode)
}

#[test]
fn pessimistic_lock_selects_the_row_once() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        assert_eq!(lock_mode_of(&session, &pig), Some(LockMode::Read));

        db.clear_log();
        unwrap_outcome(session.lock(&cx, &pig, LockMode::PessimisticWrite).await);
        assert!(session.in_transaction());
        assert_eq!(
            db.log(),
            vec![
                "execute BEGIN".to_string(),
                r#"select SELECT "id" FROM "pig" WHERE "id" = ?1 AND "version" = ?2"#.to_string(),
            ]
        );
        assert_eq!(lock_mode_of(&session, &pig), Some(LockMode::PessimisticWrite));

        // A weaker mode is already covered.
        unwrap_outcome(session.lock(&cx, &pig, LockMode::PessimisticRead).await);
        assert_eq!(db.selects(), 1);

        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(lock_mode_of(&session, &pig), Some(LockMode::None));
    });
}

#[test]
fn find_with_lock_reads_under_the_requested_mode() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(
            session
                .find_with_lock(&cx, "GuineaPig", Value::BigInt(5), LockMode::PessimisticRead)
                .await,
        )
        .expect("pig");
        assert!(db.log().contains(
            &r#"select SELECT "id", "name", "version" FROM "pig" WHERE "id" = ?1"#.to_string()
        ));
        assert_eq!(lock_mode_of(&session, &pig), Some(LockMode::PessimisticRead));
    });
}

#[test]
fn pessimistic_force_increment_bumps_the_version_now() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        unwrap_outcome(session.lock(&cx, &pig, LockMode::PessimisticForceIncrement).await);
        assert_eq!(pig.version(), Some(Value::Int(1)));
        assert_eq!(
            db.writes(),
            vec![r#"execute UPDATE "pig" SET "version" = ?1 WHERE "id" = ?2 AND "version" = ?3"#]
        );
        let row = db.row("pig", 5_i64).expect("row");
        assert_eq!(row.get("version"), Some(&Value::Int(1)));

        // The increment is part of the loaded state: nothing else to write.
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.writes().len(), 1);
    });
}

#[test]
fn pessimistic_lock_on_a_vanished_row() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        db.raw_execute(r#"DELETE FROM "pig" WHERE "id" = ?1"#, &[Value::BigInt(5)]);
        let err = expect_err(session.lock(&cx, &pig, LockMode::PessimisticWrite).await);
        assert!(err.is_stale_state(), "{err}");
    });
}

#[test]
fn optimistic_lock_verifies_the_version_at_commit() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let factory = SessionFactory::builder(pig_model()).build();

        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let mut session = factory.open_session(db.clone());
        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        unwrap_outcome(session.lock(&cx, &pig, LockMode::Optimistic).await);
        db.clear_log();
        unwrap_outcome(session.commit(&cx).await);
        assert!(db.log().contains(
            &r#"select SELECT "version" FROM "pig" WHERE "id" = ?1"#.to_string()
        ));

        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let mut session = factory.open_session(db.clone());
        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        unwrap_outcome(session.lock(&cx, &pig, LockMode::Optimistic).await);
        db.raw_execute(
            r#"UPDATE "pig" SET "version" = ?1 WHERE "id" = ?2"#,
            &[Value::Int(3), Value::BigInt(5)],
        );
        let err = expect_err(session.commit(&cx).await);
        assert!(err.is_stale_state(), "{err}");
        assert_eq!(db.log().last().map(String::as_str), Some("execute ROLLBACK"));
        assert!(!session.in_transaction());
    });
}

#[test]
fn optimistic_force_increment_bumps_the_version_at_commit() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        seed_pig(&db, 5, "McCloud");
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(db.clone());

        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("pig");
        unwrap_outcome(session.lock(&cx, &pig, LockMode::OptimisticForceIncrement).await);
        assert!(db.writes().is_empty());
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(pig.version(), Some(Value::Int(1)));
        let row = db.row("pig", 5_i64).expect("row");
        assert_eq!(row.get("version"), Some(&Value::Int(1)));
    });
}

#[test]
fn lock_rejections() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = family_db();
        seed_family(&db);
        let factory = SessionFactory::builder(family_model(CascadeStyle::NONE, CascadeStyle::NONE)).build();
        let mut session = factory.open_session(db.clone());

        let parent = unwrap_outcome(session.find(&cx, "Parent", 1_i64).await).expect("parent");
        let err = expect_err(session.lock(&cx, &parent, LockMode::Optimistic).await);
        assert!(matches!(err, Error::IllegalArgument(_)), "{err}");

        let pigs = SessionFactory::builder(pig_model()).build();
        let stranger = new_pig(&pigs, 6, "Stranger");
        let mut session = pigs.open_session(pig_db());
        let err = expect_err(session.lock(&cx, &stranger, LockMode::PessimisticWrite).await);
        assert!(matches!(err, Error::IllegalArgument(_)), "{err}");
    });
}

#[test]
fn lock_cascades_to_the_referenced_parent() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = family_db();
        seed_family(&db);
        let factory = SessionFactory::builder(family_model(CascadeStyle::LOCK, CascadeStyle::NONE)).build();
        let mut session = factory.open_session(db.clone());

        let larry = unwrap_outcome(session.find(&cx, "Child", 10_i64).await).expect("child");
        let parent = larry.get_ref("parent").expect("parent").expect("set");
        assert!(!parent.is_initialized());

        unwrap_outcome(session.lock(&cx, &larry, LockMode::PessimisticWrite).await);
        assert!(parent.is_initialized());
        assert_eq!(lock_mode_of(&session, &parent), Some(LockMode::PessimisticWrite));
        assert!(db.log().contains(
            &r#"select SELECT "id" FROM "parent" WHERE "id" = ?1"#.to_string()
        ));
    });
}
