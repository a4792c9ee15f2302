//! Backing key-value store contract and the in-process implementation.
//!
//! The registry and policy only talk to `dyn CacheBackend`, so any shared store
//! (memcached, redis, ...) can be plugged in by the host. Batched operations are
//! optional: a backend that lacks them returns [`StoreError::Unsupported`] and callers
//! fall back to per-key calls.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;

use super::config::CacheConfig;
use super::error::StoreError;
use super::lock::lock_recovering;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Fetch several keys at once. Absent keys are left out of the result.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, StoreError> {
        let _ = keys;
        Err(StoreError::unsupported("get_many"))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    async fn set_many(&self, values: &[(String, Bytes)], ttl: Duration) -> Result<(), StoreError> {
        let _ = (values, ttl);
        Err(StoreError::unsupported("set_many"))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let _ = keys;
        Err(StoreError::unsupported("delete_many"))
    }
}

/// Per-operation call counters of a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: u64,
    pub get_many: u64,
    pub set: u64,
    pub set_many: u64,
    pub delete: u64,
    pub delete_many: u64,
}

impl CallCounts {
    /// Calls that modify the store, batched or not.
    pub fn writes(&self) -> u64 {
        self.set + self.set_many + self.delete + self.delete_many
    }
}

#[derive(Default)]
struct Counters {
    get: AtomicU64,
    get_many: AtomicU64,
    set: AtomicU64,
    set_many: AtomicU64,
    delete: AtomicU64,
    delete_many: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CallCounts {
        CallCounts {
            get: self.get.load(Ordering::Relaxed),
            get_many: self.get_many.load(Ordering::Relaxed),
            set: self.set.load(Ordering::Relaxed),
            set_many: self.set_many.load(Ordering::Relaxed),
            delete: self.delete.load(Ordering::Relaxed),
            delete_many: self.delete_many.load(Ordering::Relaxed),
        }
    }
}

struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-process LRU store with per-key expiry.
///
/// Each operation takes the lock once, so a single call is atomic; batched calls are
/// atomic as a whole as well, which is stronger than the protocol requires.
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, StoredValue>>,
    batching: bool,
    counters: Counters,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            batching: true,
            counters: Counters::default(),
        }
    }

    /// A store sized by `memory_capacity`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.memory_capacity_non_zero())
    }

    /// A store that rejects batched operations, like backends without multi-key support.
    pub fn without_batching(capacity: NonZeroUsize) -> Self {
        Self {
            batching: false,
            ..Self::new(capacity)
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.counters.snapshot()
    }

    /// Number of stored values, including ones that expired but were not yet touched.
    pub fn len(&self) -> usize {
        lock_recovering(&self.entries, "memory.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        lock_recovering(&self.entries, "memory.contains")
            .peek(key)
            .is_some_and(|stored| stored.is_live(now))
    }

    fn read(entries: &mut LruCache<String, StoredValue>, key: &str, now: Instant) -> Option<Bytes> {
        let live = entries.get(key).map(|stored| stored.is_live(now))?;
        if live {
            entries.peek(key).map(|stored| stored.value.clone())
        } else {
            entries.pop(key);
            None
        }
    }

    fn write(entries: &mut LruCache<String, StoredValue>, key: &str, value: Bytes, ttl: Duration) {
        let expires_at = Instant::now().checked_add(ttl);
        entries.put(key.to_string(), StoredValue { value, expires_at });
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Counters::bump(&self.counters.get);
        let mut entries = lock_recovering(&self.entries, "memory.get");
        Ok(Self::read(&mut entries, key, Instant::now()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, StoreError> {
        if !self.batching {
            return Err(StoreError::unsupported("get_many"));
        }
        Counters::bump(&self.counters.get_many);
        let now = Instant::now();
        let mut entries = lock_recovering(&self.entries, "memory.get_many");
        Ok(keys
            .iter()
            .filter_map(|key| Self::read(&mut entries, key, now).map(|value| (key.clone(), value)))
            .collect())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        Counters::bump(&self.counters.set);
        Self::write(
            &mut lock_recovering(&self.entries, "memory.set"),
            key,
            value,
            ttl,
        );
        Ok(())
    }

    async fn set_many(&self, values: &[(String, Bytes)], ttl: Duration) -> Result<(), StoreError> {
        if !self.batching {
            return Err(StoreError::unsupported("set_many"));
        }
        Counters::bump(&self.counters.set_many);
        let mut entries = lock_recovering(&self.entries, "memory.set_many");
        for (key, value) in values {
            Self::write(&mut entries, key, value.clone(), ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Counters::bump(&self.counters.delete);
        lock_recovering(&self.entries, "memory.delete").pop(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        if !self.batching {
            return Err(StoreError::unsupported("delete_many"));
        }
        Counters::bump(&self.counters.delete_many);
        let mut entries = lock_recovering(&self.entries, "memory.delete_many");
        for key in keys {
            entries.pop(key);
        }
        Ok(())
    }
}

/// Named store handles; configuration picks one by name.
#[derive(Clone)]
pub struct Backends {
    default: Arc<dyn CacheBackend>,
    named: HashMap<String, Arc<dyn CacheBackend>>,
}

impl Backends {
    pub fn new(default: Arc<dyn CacheBackend>) -> Self {
        Self {
            default,
            named: HashMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        self.named.insert(name.into(), backend);
        self
    }

    /// Resolve a backend name; `None` selects the default handle.
    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn CacheBackend>, StoreError> {
        match name {
            None => Ok(self.default.clone()),
            Some(name) => self
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::unavailable(format!("no cache backend named `{name}`"))),
        }
    }
}
