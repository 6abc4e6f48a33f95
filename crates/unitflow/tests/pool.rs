//! Sessions over pooled connections, and configuration parsing.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{SqliteDb, expect_err, new_pig, pig_db, pig_model, unwrap_outcome};
use unitflow::prelude::*;
use unitflow::{ConnectionFactory, PoolStats};

/// Every connection talks to the same in-memory database.
struct SharedDb(SqliteDb);

impl ConnectionFactory for SharedDb {
    type Connection = SqliteDb;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<SqliteDb, Error>> + Send {
        let db = self.0.clone();
        async move { Outcome::Ok(db) }
    }
}

#[test]
fn sessions_lease_and_return_connections() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        let pool = Pool::new(SharedDb(db.clone()), PoolConfig::new(1).test_on_checkout(false))
            .expect("valid pool");
        let factory = SessionFactory::builder(pig_model()).build();

        {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            let mut session = factory.open_session(conn);
            unwrap_outcome(session.persist(&cx, &new_pig(&factory, 5, "McCloud")).await);

            // The only connection is leased.
            let err = expect_err(pool.acquire(&cx).await);
            assert!(matches!(err, Error::Pool(_)), "{err}");
            assert!(err.is_retryable());

            unwrap_outcome(session.commit(&cx).await);
            unwrap_outcome(session.close(&cx).await);
        }

        let stats: PoolStats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);

        let conn = unwrap_outcome(pool.acquire(&cx).await);
        let mut session = factory.open_session(conn);
        let pig = unwrap_outcome(session.find(&cx, "GuineaPig", 5_i64).await).expect("committed");
        assert_eq!(pig.get("name").expect("name"), Value::from("McCloud"));
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().acquired, 2);
    });
}

#[test]
fn closed_sessions_refuse_work() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let factory = SessionFactory::builder(pig_model()).build();
        let mut session = factory.open_session(pig_db());

        unwrap_outcome(session.close(&cx).await);
        assert!(session.is_closed());
        let err = expect_err(session.find(&cx, "GuineaPig", 5_i64).await);
        assert!(matches!(err, Error::IllegalState(_)), "{err}");
        let err = session.get_reference("GuineaPig", 5_i64).expect_err("closed");
        assert!(matches!(err, Error::IllegalState(_)), "{err}");
    });
}

#[test]
fn options_parse_from_json() {
    let options = SessionFactoryOptions::from_json(
        r#"{"jdbc_batch_size": 25, "query_cache_enabled": true, "default_flush_mode": "commit"}"#,
    )
    .expect("valid options");
    assert_eq!(options.jdbc_batch_size, 25);
    assert!(options.query_cache_enabled);
    assert_eq!(options.default_flush_mode, FlushMode::Commit);
    assert_eq!(options.default_batch_fetch_size, 1);

    let err = SessionFactoryOptions::from_json(r#"{"jdbc_batch_size": "many"}"#).expect_err("bad type");
    assert!(matches!(err, Error::Config(_)), "{err}");

    let pool = PoolConfig::from_json(r#"{"max_connections": 4}"#).expect("valid pool config");
    assert_eq!(pool.max_connections, 4);
    assert!(pool.test_on_checkout);
}

#[test]
fn factory_flush_mode_is_the_session_default() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    rt.block_on(async {
        let cx = Cx::for_testing();
        let db = pig_db();
        let factory = SessionFactory::builder(pig_model())
            .options(SessionFactoryOptions::default().flush_mode(FlushMode::Manual))
            .build();
        let mut session = factory.open_session(db.clone());
        assert_eq!(session.config().flush_mode, FlushMode::Manual);

        unwrap_outcome(session.persist(&cx, &new_pig(&factory, 5, "McCloud")).await);
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(db.count("pig"), 0);
    });
}
