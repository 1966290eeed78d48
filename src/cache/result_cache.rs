use lru::LruCache;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::query_fingerprint::QueryFingerprint;
use crate::driver::{QueryResult, Value};
use crate::error::{Error, Result};

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    /// Results larger than this are never stored
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(300),
            max_entry_bytes: 1024 * 1024,
        }
    }
}

/// Key for the result cache - fingerprint plus the normalized text it was
/// derived from, which pattern invalidation matches against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultCacheKey {
    pub fingerprint: String,
    pub normalized_query: String,
}

impl ResultCacheKey {
    pub fn new<O: Serialize + ?Sized>(query: &str, params: &[Value], options: &O) -> Self {
        let normalized_query = QueryFingerprint::normalize(query);
        let fingerprint = QueryFingerprint::generate_normalized(&normalized_query, params, options);
        Self {
            fingerprint,
            normalized_query,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: QueryResult,
    normalized_query: String,
    created_at: Instant,
    hit_count: u64,
    size_bytes: usize,
}

/// Cache counters. Maintained under the cache lock, so they are exact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub capacity: usize,
    pub bytes: usize,
    pub ttl_ms: u64,
}

impl CacheStats {
    /// Hit rate as a percentage of lookups
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            (self.hits as f64 / lookups as f64) * 100.0
        }
    }
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    stats: CacheStats,
}

impl CacheInner {
    fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(fingerprint)?;
        self.stats.bytes -= entry.size_bytes;
        Some(entry)
    }
}

/// Bounded result cache with LRU eviction and a fixed TTL
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entry_bytes: usize,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                stats: CacheStats {
                    capacity: capacity.get(),
                    ttl_ms: config.ttl.as_millis() as u64,
                    ..CacheStats::default()
                },
            }),
            ttl: config.ttl,
            max_entry_bytes: config.max_entry_bytes,
        }
    }

    /// Look up a result. Expired entries count as misses and are removed.
    pub fn get(&self, key: &ResultCacheKey) -> Option<QueryResult> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.peek(&key.fingerprint) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.created_at.elapsed() >= self.ttl,
        };

        if expired {
            inner.remove(&key.fingerprint);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            inner.stats.entries = inner.entries.len();
            return None;
        }

        let entry = inner.entries.get_mut(&key.fingerprint)?;
        entry.hit_count += 1;
        let data = entry.data.clone();
        inner.stats.hits += 1;
        Some(data)
    }

    /// Store a result, replacing any entry under the same key. Returns false
    /// when the result is too large to cache.
    pub fn set(&self, key: &ResultCacheKey, data: QueryResult) -> bool {
        let size_bytes = data.approximate_size();
        if size_bytes > self.max_entry_bytes {
            debug!(
                "Not caching result of {} bytes (limit {})",
                size_bytes, self.max_entry_bytes
            );
            return false;
        }

        let entry = CacheEntry {
            data,
            normalized_query: key.normalized_query.clone(),
            created_at: Instant::now(),
            hit_count: 0,
            size_bytes,
        };

        let mut inner = self.inner.lock();
        inner.remove(&key.fingerprint);
        if let Some((_, evicted)) = inner.entries.push(key.fingerprint.clone(), entry) {
            inner.stats.bytes -= evicted.size_bytes;
            inner.stats.evictions += 1;
        }
        inner.stats.bytes += size_bytes;
        inner.stats.sets += 1;
        inner.stats.entries = inner.entries.len();
        true
    }

    /// Remove every entry whose fingerprint or normalized query matches
    /// `pattern`, or everything when no pattern is given. Returns the number
    /// of entries removed.
    pub fn invalidate(&self, pattern: Option<&Regex>) -> usize {
        let mut inner = self.inner.lock();

        let removed = match pattern {
            None => {
                let count = inner.entries.len();
                inner.entries.clear();
                inner.stats.bytes = 0;
                count
            }
            Some(re) => {
                let matching: Vec<String> = inner
                    .entries
                    .iter()
                    .filter(|(fingerprint, entry)| {
                        re.is_match(fingerprint) || re.is_match(&entry.normalized_query)
                    })
                    .map(|(fingerprint, _)| fingerprint.clone())
                    .collect();
                for fingerprint in &matching {
                    inner.remove(fingerprint);
                }
                matching.len()
            }
        };

        inner.stats.invalidations += removed as u64;
        inner.stats.entries = inner.entries.len();
        if removed > 0 {
            debug!("Invalidated {} cached results", removed);
        }
        removed
    }

    /// [`ResultCache::invalidate`] with a pattern given as text. Matching
    /// ignores case, since cached queries are kept in normalized upper case.
    pub fn invalidate_pattern(&self, pattern: Option<&str>) -> Result<usize> {
        match pattern {
            None => Ok(self.invalidate(None)),
            Some(text) => {
                let re = RegexBuilder::new(text)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::InvalidStatement {
                        message: format!("invalid invalidation pattern: {e}"),
                        sqlstate: None,
                    })?;
                Ok(self.invalidate(Some(&re)))
            }
        }
    }

    /// Drop cached results that read from `table`.
    ///
    /// Matches the table after FROM, JOIN, INTO or UPDATE, optionally schema
    /// qualified, and the qualified name anywhere when one is given. Views,
    /// aliases and comma joins are missed.
    pub fn invalidate_table(&self, table: &str) -> Result<usize> {
        let re = table_pattern(table)?;
        Ok(self.invalidate(Some(&re)))
    }

    /// Remove every entry past its TTL
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= self.ttl)
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in &expired {
            inner.remove(fingerprint);
        }
        inner.stats.expirations += expired.len() as u64;
        inner.stats.entries = inner.entries.len();
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Most frequently served entries, as (normalized query, hits)
    pub fn top_queries(&self, limit: usize) -> Vec<(String, u64)> {
        let inner = self.inner.lock();
        let mut top: Vec<(String, u64)> = inner
            .entries
            .iter()
            .map(|(_, entry)| (entry.normalized_query.clone(), entry.hit_count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(limit);
        top
    }
}

fn table_pattern(table: &str) -> Result<Regex> {
    let unquoted = table.replace('"', "");
    let bare = unquoted.rsplit('.').next().unwrap_or(&unquoted);

    let mut pattern = format!(
        r#"\b(?:FROM|JOIN|INTO|UPDATE)\s+(?:"?[\w$]+"?\.)?"?{}"?(?:[^\w$]|$)"#,
        regex::escape(bare)
    );
    if unquoted.contains('.') {
        pattern.push('|');
        pattern.push_str(&regex::escape(&unquoted));
    }

    Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| Error::internal(format!("table pattern for {table}: {e}")))
}
