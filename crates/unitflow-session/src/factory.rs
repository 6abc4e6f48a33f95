//! The session factory: metamodel, options, listeners and the caches shared by its sessions.

use crate::Session;
use crate::config::{SessionConfig, SessionFactoryOptions};
use crate::listener::{Interceptor, ListenerRegistry};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use unitflow_core::{Connection, EntityPersister, Metamodel, Result, Value};
use unitflow_query::{
    CacheStats, CachedResult, LoadPlan, PlanCache, PlanKey, QueryKey, QueryResultsCache,
};

/// Identifiers reserved from a sequence but not handed out yet.
#[derive(Debug, Clone, Copy)]
struct SequenceBlock {
    next: i64,
    remaining: u32,
}

struct FactoryInner {
    metamodel: Metamodel,
    options: SessionFactoryOptions,
    listeners: ListenerRegistry,
    interceptor: Option<Arc<dyn Interceptor>>,
    plan_cache: Mutex<PlanCache>,
    query_cache: Mutex<QueryResultsCache>,
    sequences: Mutex<HashMap<String, SequenceBlock>>,
}

/// Shared, thread-safe source of sessions.
///
/// Cloning is cheap; every clone shares the caches. Cache locks are never held across an await.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.inner.metamodel.entity_names().count())
            .field("options", &self.inner.options)
            .field("listeners", &self.inner.listeners)
            .field("interceptor", &self.inner.interceptor.is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionFactory {
    pub fn builder(metamodel: Metamodel) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metamodel,
            options: SessionFactoryOptions::default(),
            listeners: ListenerRegistry::default(),
            interceptor: None,
        }
    }

    /// Open a session over `connection` with the factory's default configuration.
    pub fn open_session<C: Connection>(&self, connection: C) -> Session<C> {
        let config = SessionConfig {
            flush_mode: self.inner.options.default_flush_mode,
            ..SessionConfig::default()
        };
        Session::new(self.clone(), connection, config)
    }

    pub fn open_session_with<C: Connection>(&self, connection: C, config: SessionConfig) -> Session<C> {
        Session::new(self.clone(), connection, config)
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.inner.metamodel
    }

    pub fn options(&self) -> &SessionFactoryOptions {
        &self.inner.options
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn interceptor(&self) -> Option<&Arc<dyn Interceptor>> {
        self.inner.interceptor.as_ref()
    }

    pub fn persister(&self, name: &str) -> Result<Arc<EntityPersister>> {
        self.inner.metamodel.persister(name)
    }

    /// Batch-fetch size for `declared`, falling back to the factory default.
    pub fn batch_fetch_size(&self, declared: Option<usize>) -> usize {
        declared
            .unwrap_or(self.inner.options.default_batch_fetch_size)
            .max(1)
    }

    /// Cached load plan for `key`, built on first use.
    pub fn plan(&self, key: &PlanKey, build: impl FnOnce() -> Result<LoadPlan>) -> Result<Arc<LoadPlan>> {
        lock(&self.inner.plan_cache).get_or_try_insert(key, build)
    }

    pub fn plan_cache_size(&self) -> usize {
        lock(&self.inner.plan_cache).len()
    }

    // ========================================================================
    // Query results cache
    // ========================================================================

    pub fn query_cache_enabled(&self) -> bool {
        self.inner.options.query_cache_enabled
    }

    pub fn pre_query_timestamp(&self) -> u64 {
        lock(&self.inner.query_cache).pre_query_timestamp()
    }

    pub fn cached_result(&self, key: &QueryKey) -> Option<CachedResult> {
        lock(&self.inner.query_cache).get(key)
    }

    pub fn cache_result(&self, key: QueryKey, spaces: &[String], result: CachedResult, timestamp: u64) {
        lock(&self.inner.query_cache).put(key, spaces, result, timestamp);
    }

    pub fn evict_cached_result(&self, key: &QueryKey) {
        lock(&self.inner.query_cache).remove(key);
    }

    /// Record writes to `spaces`, invalidating cached results read from them.
    pub fn invalidate_spaces<S: AsRef<str>>(&self, spaces: &[S]) {
        lock(&self.inner.query_cache).invalidate(spaces);
    }

    /// Every table of every mapped entity.
    pub(crate) fn all_spaces(&self) -> Vec<String> {
        let mut spaces: Vec<String> = Vec::new();
        for name in self.inner.metamodel.entity_names() {
            if let Ok(persister) = self.inner.metamodel.persister(name) {
                spaces.extend(persister.tables().into_iter().map(str::to_string));
            }
        }
        spaces.sort();
        spaces.dedup();
        spaces
    }

    /// Invalidate every table of every mapped entity.
    pub fn invalidate_all(&self) {
        self.invalidate_spaces(&self.all_spaces());
    }

    pub fn query_cache_stats(&self) -> CacheStats {
        lock(&self.inner.query_cache).stats()
    }

    // ========================================================================
    // Sequence blocks
    // ========================================================================

    /// Next identifier from an already reserved block of `sequence`.
    pub(crate) fn next_pooled_id(&self, sequence: &str) -> Option<Value> {
        let mut sequences = lock(&self.inner.sequences);
        let block = sequences.get_mut(sequence).filter(|b| b.remaining > 0)?;
        let id = block.next;
        block.next += 1;
        block.remaining -= 1;
        Some(Value::BigInt(id))
    }

    /// Install a block of `size` identifiers starting at `first` and hand out the first one.
    pub(crate) fn install_block(&self, sequence: &str, first: i64, size: u32) -> Value {
        let mut sequences = lock(&self.inner.sequences);
        sequences.insert(
            sequence.to_string(),
            SequenceBlock {
                next: first + 1,
                remaining: size.saturating_sub(1),
            },
        );
        Value::BigInt(first)
    }
}

/// Builds a [`SessionFactory`].
pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    options: SessionFactoryOptions,
    listeners: ListenerRegistry,
    interceptor: Option<Arc<dyn Interceptor>>,
}

impl SessionFactoryBuilder {
    pub fn options(mut self, options: SessionFactoryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> SessionFactory {
        let plan_cache = PlanCache::new(self.options.plan_cache_size);
        let query_cache = QueryResultsCache::new(self.options.query_cache_max_entries);
        tracing::debug!(
            entities = self.metamodel.entity_names().count(),
            batch_size = self.options.jdbc_batch_size,
            query_cache = self.options.query_cache_enabled,
            "Session factory built"
        );
        SessionFactory {
            inner: Arc::new(FactoryInner {
                metamodel: self.metamodel,
                options: self.options,
                listeners: self.listeners,
                interceptor: self.interceptor,
                plan_cache: Mutex::new(plan_cache),
                query_cache: Mutex::new(query_cache),
                sequences: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitflow_core::{EntityMetadata, PropertyMapping};

    fn factory() -> SessionFactory {
        let model = Metamodel::builder()
            .entity(
                EntityMetadata::new("GuineaPig", "pig")
                    .secondary_table("pig_details", "pig_id")
                    .property(PropertyMapping::basic("name", "name"))
                    .property(PropertyMapping::basic("diet", "diet").in_table("pig_details")),
            )
            .build()
            .unwrap();
        SessionFactory::builder(model).build()
    }

    #[test]
    fn sequence_blocks_hand_out_consecutive_ids() {
        let factory = factory();
        assert!(factory.next_pooled_id("pig_seq").is_none());
        assert_eq!(factory.install_block("pig_seq", 51, 3), Value::BigInt(51));
        assert_eq!(factory.next_pooled_id("pig_seq"), Some(Value::BigInt(52)));
        assert_eq!(factory.next_pooled_id("pig_seq"), Some(Value::BigInt(53)));
        assert!(factory.next_pooled_id("pig_seq").is_none());
    }

    #[test]
    fn batch_fetch_size_falls_back_to_default() {
        let factory = factory();
        assert_eq!(factory.batch_fetch_size(None), 1);
        assert_eq!(factory.batch_fetch_size(Some(16)), 16);
    }

    #[test]
    fn invalidate_all_covers_secondary_tables() {
        let factory = SessionFactory::builder(factory().metamodel().clone())
            .options(SessionFactoryOptions::default().query_cache(true))
            .build();
        let key = QueryKey::new("SELECT 1", Vec::new(), unitflow_query::ResultShape::Tuples(1));
        let ts = factory.pre_query_timestamp();
        factory.cache_result(
            key.clone(),
            &["pig_details".to_string()],
            CachedResult::Tuples(vec![vec![Value::Int(1)]]),
            ts,
        );
        assert!(factory.cached_result(&key).is_some());
        factory.invalidate_all();
        assert!(factory.cached_result(&key).is_none());
    }
}
