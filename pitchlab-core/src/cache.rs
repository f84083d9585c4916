//! Caching layers.
//!
//! Two caches live here:
//! - the cross-session **phrase cache** that bounds LLM spend on repeated
//!   stock lines (indefinite lifetime, explicit clear only), and
//! - the bounded **attempt-context cache** used by the persona-chat surface
//!   (fixed capacity, oldest-first eviction).

use crate::db::Database;
use crate::error::Result;
use crate::types::LineRating;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Normalize an utterance into a cache key: trim, lowercase, collapse
/// internal whitespace. Idempotent by construction.
pub fn normalize_phrase(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key-value store mapping a normalized utterance to a previously computed
/// line rating. Implementations must be safe under concurrent get/put;
/// last-write-wins per key is acceptable.
pub trait PhraseCache: Send + Sync {
    fn get(&self, normalized: &str) -> Result<Option<LineRating>>;
    fn put(&self, normalized: &str, rating: &LineRating) -> Result<()>;
}

/// SQLite-backed phrase cache.
pub struct SqlitePhraseCache {
    db: Arc<Database>,
}

impl SqlitePhraseCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl PhraseCache for SqlitePhraseCache {
    fn get(&self, normalized: &str) -> Result<Option<LineRating>> {
        self.db.phrase_cache_get(normalized)
    }

    fn put(&self, normalized: &str, rating: &LineRating) -> Result<()> {
        self.db.phrase_cache_put(normalized, rating)
    }
}

/// Wrapper that degrades backing-store failures to cache misses so a cache
/// outage never aborts a batch.
pub struct DegradingPhraseCache<C> {
    inner: C,
}

impl<C> DegradingPhraseCache<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: PhraseCache> PhraseCache for DegradingPhraseCache<C> {
    fn get(&self, normalized: &str) -> Result<Option<LineRating>> {
        match self.inner.get(normalized) {
            Ok(hit) => Ok(hit),
            Err(e) => {
                tracing::warn!(error = %e, "Phrase cache read failed; treating as miss");
                Ok(None)
            }
        }
    }

    fn put(&self, normalized: &str, rating: &LineRating) -> Result<()> {
        if let Err(e) = self.inner.put(normalized, rating) {
            tracing::warn!(error = %e, "Phrase cache write failed; continuing uncached");
        }
        Ok(())
    }
}

/// In-memory phrase cache for tests and single-process use.
#[derive(Default)]
pub struct MemoryPhraseCache {
    entries: Mutex<HashMap<String, LineRating>>,
}

impl MemoryPhraseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PhraseCache for MemoryPhraseCache {
    fn get(&self, normalized: &str) -> Result<Option<LineRating>> {
        Ok(self.entries.lock().unwrap().get(normalized).cloned())
    }

    fn put(&self, normalized: &str, rating: &LineRating) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(normalized.to_string(), rating.clone());
        Ok(())
    }
}

/// Bounded conversation-context cache keyed by attempt id.
///
/// Fixed capacity with oldest-first eviction; a re-inserted key refreshes its
/// slot. Safe for concurrent use.
pub struct AttemptContextCache {
    capacity: usize,
    inner: Mutex<AttemptContextInner>,
}

struct AttemptContextInner {
    entries: HashMap<String, serde_json::Value>,
    order: VecDeque<String>,
}

impl AttemptContextCache {
    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        Self::new(config.history_capacity)
    }

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(AttemptContextInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, attempt_id: &str) -> Option<serde_json::Value> {
        self.inner.lock().unwrap().entries.get(attempt_id).cloned()
    }

    pub fn put(&self, attempt_id: &str, context: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.insert(attempt_id.to_string(), context).is_some() {
            inner.order.retain(|k| k != attempt_id);
        }
        inner.order.push_back(attempt_id.to_string());

        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn remove(&self, attempt_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(attempt_id);
        inner.order.retain(|k| k != attempt_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
