//! Query-results cache validated against per-table modification watermarks.
//!
//! Every cached result records the logical timestamp taken just before its query ran. Writing to
//! a table (flush or bulk statement) stamps that table with a newer timestamp, which makes every
//! result read from it before the write invalid.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use unitflow_core::Value;

/// What kind of rows a cached query produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultShape {
    /// Scalar tuples of the given width; 0 when undeclared.
    Tuples(usize),
    /// Entities of the named type.
    Entity(String),
}

/// Everything that determines the result of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub sql: String,
    pub params: Vec<Value>,
    /// Enabled filter names, sorted.
    pub filters: Vec<String>,
    pub first: usize,
    pub max: Option<usize>,
    /// Repeated entities were dropped from the result.
    pub distinct: bool,
    /// Entities were loaded read-only.
    pub read_only: bool,
    pub shape: ResultShape,
}

impl QueryKey {
    pub fn new(sql: impl Into<String>, params: Vec<Value>, shape: ResultShape) -> Self {
        Self {
            sql: sql.into(),
            params,
            filters: Vec::new(),
            first: 0,
            max: None,
            distinct: false,
            read_only: false,
            shape,
        }
    }

    pub fn with_filters(mut self, mut filters: Vec<String>) -> Self {
        filters.sort();
        self.filters = filters;
        self
    }

    pub fn with_paging(mut self, first: usize, max: Option<usize>) -> Self {
        self.first = first;
        self.max = max;
        self
    }

    pub fn with_result_options(mut self, distinct: bool, read_only: bool) -> Self {
        self.distinct = distinct;
        self.read_only = read_only;
        self
    }
}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sql.hash(state);
        self.params.len().hash(state);
        for param in &self.params {
            param.hash_into(state);
        }
        self.filters.hash(state);
        self.first.hash(state);
        self.max.hash(state);
        self.distinct.hash(state);
        self.read_only.hash(state);
        self.shape.hash(state);
    }
}

/// A cached query result.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResult {
    Tuples(Vec<Vec<Value>>),
    /// Identifiers of the entities returned, in result order.
    EntityKeys { entity: String, ids: Vec<Value> },
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub stale: u64,
}

#[derive(Debug)]
struct Entry {
    key: QueryKey,
    spaces: Vec<String>,
    result: CachedResult,
    timestamp: u64,
    last_used: u64,
}

/// Bounded cache of query results.
#[derive(Debug)]
pub struct QueryResultsCache {
    entries: HashMap<u64, Entry>,
    watermarks: HashMap<String, u64>,
    clock: u64,
    max_entries: usize,
    stats: CacheStats,
}

impl QueryResultsCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            watermarks: HashMap::new(),
            clock: 0,
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Timestamp to record with a result whose query is about to run.
    pub fn pre_query_timestamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a result still valid for every table it was read from.
    pub fn get(&mut self, key: &QueryKey) -> Option<CachedResult> {
        let hash = crate::cache_key(key);
        let valid = self
            .entries
            .get(&hash)
            .filter(|entry| entry.key == *key)
            .map(|entry| self.is_up_to_date(&entry.spaces, entry.timestamp));
        let Some(valid) = valid else {
            self.stats.misses += 1;
            return None;
        };
        if !valid {
            tracing::trace!(sql = %key.sql, "Cached result is stale");
            self.entries.remove(&hash);
            self.stats.stale += 1;
            self.stats.misses += 1;
            return None;
        }
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(&hash)?;
        entry.last_used = clock;
        self.stats.hits += 1;
        Some(entry.result.clone())
    }

    /// Store a result read from `spaces` by a query started at `timestamp`.
    ///
    /// A result is not stored when one of its tables was written after the query started.
    pub fn put(&mut self, key: QueryKey, spaces: &[String], result: CachedResult, timestamp: u64) {
        if !self.is_up_to_date(spaces, timestamp) {
            tracing::trace!(sql = %key.sql, "Result not cached, tables changed while querying");
            return;
        }
        let hash = crate::cache_key(&key);
        if !self.entries.contains_key(&hash) && self.entries.len() >= self.max_entries {
            self.evict_lru();
        }
        self.clock += 1;
        self.entries.insert(
            hash,
            Entry {
                key,
                spaces: spaces.to_vec(),
                result,
                timestamp,
                last_used: self.clock,
            },
        );
        self.stats.puts += 1;
    }

    /// Drop one cached result.
    pub fn remove(&mut self, key: &QueryKey) {
        let hash = crate::cache_key(key);
        if self.entries.get(&hash).is_some_and(|e| e.key == *key) {
            self.entries.remove(&hash);
        }
    }

    /// Record a write to `spaces`, invalidating every result read from them.
    pub fn invalidate<S: AsRef<str>>(&mut self, spaces: &[S]) {
        if spaces.is_empty() {
            return;
        }
        self.clock += 1;
        for space in spaces {
            self.watermarks.insert(space.as_ref().to_string(), self.clock);
        }
        tracing::trace!(spaces = spaces.len(), stamp = self.clock, "Query spaces invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn is_up_to_date(&self, spaces: &[String], timestamp: u64) -> bool {
        spaces
            .iter()
            .filter_map(|space| self.watermarks.get(space))
            .all(|&stamp| stamp < timestamp)
    }

    fn evict_lru(&mut self) {
        if let Some((&lru, _)) = self.entries.iter().min_by_key(|(_, e)| e.last_used) {
            self.entries.remove(&lru);
        }
    }
}

impl Default for QueryResultsCache {
    fn default() -> Self {
        Self::new(1000)
    }
}
