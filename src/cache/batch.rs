//! Batched store traffic for one registry commit.
//!
//! A commit issues at most one multi-get, one multi-delete and one multi-set, in that
//! order. Deletes always run before sets so a stale delete cannot remove a value written
//! by the same commit. Backends without batched primitives get the same calls one key
//! at a time, in the same order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::error::StoreError;
use super::store::CacheBackend;

/// Read `keys` with one multi-get, or key by key when the backend cannot batch.
pub async fn read_many(
    backend: &dyn CacheBackend,
    keys: &[String],
) -> Result<HashMap<String, Bytes>, StoreError> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }

    match backend.get_many(keys).await {
        Err(StoreError::Unsupported { operation }) => {
            debug!(operation, count = keys.len(), "falling back to serial reads");
            let mut found = HashMap::with_capacity(keys.len());
            for key in keys {
                if let Some(value) = backend.get(key).await? {
                    found.insert(key.clone(), value);
                }
            }
            Ok(found)
        }
        other => other,
    }
}

/// Pending deletes and writes, applied by [`WriteBatch::commit`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    deletes: Vec<String>,
    scheduled: HashSet<String>,
    sets: Vec<(String, Bytes)>,
}

/// What a [`WriteBatch`] sent to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub deleted: usize,
    pub written: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` for deletion. Scheduling the same key twice is a no-op.
    pub fn delete(&mut self, key: impl Into<String>) {
        let key = key.into();
        if self.scheduled.insert(key.clone()) {
            self.deletes.push(key);
        }
    }

    /// Stage a write. A later write to the same key replaces the earlier one.
    pub fn set(&mut self, key: impl Into<String>, value: Bytes) {
        let key = key.into();
        match self.sets.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.sets.push((key, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.sets.is_empty()
    }

    pub fn pending_deletes(&self) -> &[String] {
        &self.deletes
    }

    pub fn pending_sets(&self) -> &[(String, Bytes)] {
        &self.sets
    }

    /// Apply all deletes, then all writes, with `ttl` on every write.
    pub async fn commit(
        self,
        backend: &dyn CacheBackend,
        ttl: Duration,
    ) -> Result<BatchReport, StoreError> {
        let report = BatchReport {
            deleted: self.deletes.len(),
            written: self.sets.len(),
        };

        if !self.deletes.is_empty() {
            match backend.delete_many(&self.deletes).await {
                Err(StoreError::Unsupported { operation }) => {
                    debug!(operation, count = self.deletes.len(), "falling back to serial deletes");
                    for key in &self.deletes {
                        backend.delete(key).await?;
                    }
                }
                other => other?,
            }
        }

        if !self.sets.is_empty() {
            match backend.set_many(&self.sets, ttl).await {
                Err(StoreError::Unsupported { operation }) => {
                    debug!(operation, count = self.sets.len(), "falling back to serial writes");
                    for (key, value) in &self.sets {
                        backend.set(key, value.clone(), ttl).await?;
                    }
                }
                other => other?,
            }
        }

        Ok(report)
    }
}
