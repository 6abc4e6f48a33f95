//! Load-plan caching.
//!
//! Building a plan walks the persister, its subclass closure and its secondary tables, so plans
//! are cached per session factory keyed by what they load.

use crate::plan::{LoadPlan, PlanKind};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use unitflow_core::{Dialect, LockMode, Result};

/// What a cached plan was built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Entity name or collection role.
    pub name: String,
    pub kind: PlanKind,
    pub lock: LockMode,
    pub dialect: Dialect,
}

impl PlanKey {
    pub fn new(name: impl Into<String>, kind: PlanKind, lock: LockMode, dialect: Dialect) -> Self {
        Self {
            name: name.into(),
            kind,
            lock,
            dialect,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedPlan {
    plan: Arc<LoadPlan>,
    last_used: u64,
    hit_count: u64,
}

/// LRU cache of load plans.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
#[derive(Debug)]
pub struct PlanCache {
    cache: HashMap<u64, CachedPlan>,
    max_size: usize,
    tick: u64,
}

impl PlanCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
            tick: 0,
        }
    }

    /// Get a cached plan or build and insert it.
    ///
    /// The `builder` closure is only called on a miss; a failed build caches nothing.
    pub fn get_or_try_insert(
        &mut self,
        key: &PlanKey,
        builder: impl FnOnce() -> Result<LoadPlan>,
    ) -> Result<Arc<LoadPlan>> {
        let hash = cache_key(key);
        self.tick += 1;
        if let Some(entry) = self.cache.get_mut(&hash) {
            entry.last_used = self.tick;
            entry.hit_count += 1;
            return Ok(Arc::clone(&entry.plan));
        }

        let plan = Arc::new(builder()?);
        if self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            hash,
            CachedPlan {
                plan: Arc::clone(&plan),
                last_used: self.tick,
                hit_count: 0,
            },
        );
        Ok(plan)
    }

    pub fn contains(&self, key: &PlanKey) -> bool {
        self.cache.contains_key(&cache_key(key))
    }

    /// Number of times the plan for `key` was served from the cache.
    pub fn hits(&self, key: &PlanKey) -> u64 {
        self.cache
            .get(&cache_key(key))
            .map_or(0, |entry| entry.hit_count)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitflow_core::Error;

    fn plan(sql: &str) -> LoadPlan {
        LoadPlan {
            kind: PlanKind::Existence,
            lock: LockMode::None,
            branches: vec![crate::plan::PlanBranch {
                entity: "Pig".to_string(),
                sql: sql.to_string(),
            }],
            secondary: Vec::new(),
            key_column: "id".to_string(),
        }
    }

    fn key(name: &str) -> PlanKey {
        PlanKey::new(name, PlanKind::Existence, LockMode::None, Dialect::Postgres)
    }

    #[test]
    fn test_cache_hit() {
        let mut cache = PlanCache::new(10);
        let first = cache.get_or_try_insert(&key("Pig"), || Ok(plan("SELECT 1"))).unwrap();

        let called = std::cell::Cell::new(false);
        let second = cache
            .get_or_try_insert(&key("Pig"), || {
                called.set(true);
                Ok(plan("SELECT 2"))
            })
            .unwrap();
        assert!(!called.get());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.hits(&key("Pig")), 1);
    }

    #[test]
    fn test_lock_mode_is_part_of_the_key() {
        let mut cache = PlanCache::new(10);
        cache.get_or_try_insert(&key("Pig"), || Ok(plan("SELECT 1"))).unwrap();
        let locked = PlanKey::new(
            "Pig",
            PlanKind::Existence,
            LockMode::PessimisticWrite,
            Dialect::Postgres,
        );
        assert!(!cache.contains(&locked));
        cache.get_or_try_insert(&locked, || Ok(plan("SELECT 1 FOR UPDATE"))).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let mut cache = PlanCache::new(10);
        let result = cache.get_or_try_insert(&key("Pig"), || {
            Err(Error::IllegalArgument("no natural id".to_string()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_ordering() {
        let mut cache = PlanCache::new(2);
        cache.get_or_try_insert(&key("A"), || Ok(plan("A"))).unwrap();
        cache.get_or_try_insert(&key("B"), || Ok(plan("B"))).unwrap();
        cache.get_or_try_insert(&key("A"), || Ok(plan("A"))).unwrap();
        cache.get_or_try_insert(&key("C"), || Ok(plan("C"))).unwrap();

        assert!(cache.contains(&key("A")));
        assert!(!cache.contains(&key("B")));
        assert!(cache.contains(&key("C")));

        cache.clear();
        assert!(cache.is_empty());
    }
}
