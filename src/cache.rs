//! Time-bounded memoization of query results.
//!
//! Entries are immutable and replaced whole under a short write lock, so a
//! reader sees either the previous entry or the new one. No lock is held while
//! a result is being computed; two callers missing on the same key at the same
//! time will both compute, and the later insert wins.

use crate::db::{Query, ResultSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cache key: the query text plus its bound parameters.
///
/// Built from a bare `&str` the key is the text alone, and every parameter
/// set for that text shares one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    text: String,
    params: String,
}

impl CacheKey {
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl From<&str> for CacheKey {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            params: String::new(),
        }
    }
}

impl From<&Query> for CacheKey {
    fn from(query: &Query) -> Self {
        let params = if query.params().is_empty() {
            String::new()
        } else {
            // Debug keeps the variant, so Integer(1) and Text("1") differ.
            format!("{:?}", query.params())
        };
        Self {
            text: query.text().to_string(),
            params,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    rows: ResultSet,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

/// Result of a lookup. A miss is a signal to recompute, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(ResultSet),
    Miss,
    Expired,
}

#[derive(Debug)]
pub struct QueryCache {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let entry = self.entries.read().get(key).cloned();
        match entry {
            Some(entry) if entry.is_valid(self.clock.now()) => Lookup::Hit(entry.rows.clone()),
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        }
    }

    /// Valid entry for `key`, if any. Expired entries read as absent.
    pub fn get(&self, key: impl Into<CacheKey>) -> Option<ResultSet> {
        match self.lookup(&key.into()) {
            Lookup::Hit(rows) => Some(rows),
            Lookup::Miss | Lookup::Expired => None,
        }
    }

    /// Store `rows` under `key` with a fresh timestamp, replacing any entry.
    pub fn insert(&self, key: impl Into<CacheKey>, rows: ResultSet) {
        let entry = Arc::new(CacheEntry {
            rows,
            created_at: self.clock.now(),
            ttl: self.ttl,
        });
        self.entries.write().insert(key.into(), entry);
    }

    /// Return the cached result for `key`, or run `compute` and cache its
    /// result. Errors are returned as-is and nothing is cached.
    pub fn get_or_compute<E, F>(&self, key: impl Into<CacheKey>, compute: F) -> Result<ResultSet, E>
    where
        F: FnOnce() -> Result<ResultSet, E>,
    {
        let key = key.into();
        if let Some(rows) = self.check(&key) {
            return Ok(rows);
        }
        let rows = compute()?;
        self.insert(key, rows.clone());
        Ok(rows)
    }

    /// Async counterpart of [`QueryCache::get_or_compute`]. `compute` is only
    /// polled on a miss.
    pub async fn get_or_compute_async<E, Fut>(
        &self,
        key: impl Into<CacheKey>,
        compute: Fut,
    ) -> Result<ResultSet, E>
    where
        Fut: Future<Output = Result<ResultSet, E>>,
    {
        let key = key.into();
        if let Some(rows) = self.check(&key) {
            return Ok(rows);
        }
        let rows = compute.await?;
        self.insert(key, rows.clone());
        Ok(rows)
    }

    fn check(&self, key: &CacheKey) -> Option<ResultSet> {
        match self.lookup(key) {
            Lookup::Hit(rows) => {
                debug!(query = %key.text, "Cache hit");
                Some(rows)
            }
            Lookup::Expired => {
                debug!(query = %key.text, "Cache expired, refreshing");
                None
            }
            Lookup::Miss => {
                debug!(query = %key.text, "Cache miss, fetching from database");
                None
            }
        }
    }

    /// Drop the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: impl Into<CacheKey>) -> bool {
        self.entries.write().remove(&key.into()).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Remove expired entries now instead of waiting for them to be read.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid(now));
        before - entries.len()
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_valid(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
