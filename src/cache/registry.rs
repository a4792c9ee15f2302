//! Dependency registry.
//!
//! Maintains four index families in the shared store so that a change to an entity or
//! a type can find every cache entry and path built from it:
//!
//! | family          | key                           | value               |
//! |-----------------|-------------------------------|---------------------|
//! | entry by entity | `depcache-<type>-<object>`    | cache entry keys    |
//! | path by entity  | `depcache-pth-<type>-<object>`| request paths       |
//! | entry by type   | `depcache-ct-<type>`          | cache entry keys    |
//! | path by type    | `depcache-ct-pth-<type>`      | request paths       |
//!
//! Lists are read-modify-written without locks. Two commits racing on one list may lose
//! one contribution; the affected entry then just lives until its own timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, instrument, warn};

use super::batch::{WriteBatch, read_many};
use super::bounded::trim_to_budget;
use super::config::CacheConfig;
use super::deps::distinct;
use super::error::CacheError;
use super::keys::{self, EntityRef, TypeId};
use super::store::CacheBackend;

const METRIC_COMMIT_MS: &str = "depcache_commit_ms";
const METRIC_INDEX_EVICTED: &str = "depcache_index_evicted_total";
const METRIC_INVALIDATED: &str = "depcache_invalidated_total";

/// What one [`Registry::commit`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Keys fetched by the multi-get.
    pub read: usize,
    /// Values dropped from the front of oversized lists.
    pub evicted: usize,
    /// Keys sent to the multi-delete.
    pub deleted: usize,
    /// Keys sent to the multi-set.
    pub written: usize,
}

/// Entries removed and paths released by an invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    pub entries: Vec<String>,
    pub paths: Vec<String>,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.paths.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    /// Values are cache entry keys; evicted values are deleted from the store.
    Entries,
    /// Values are paths; evicted values are dropped.
    Paths,
}

struct ListUpdate<'a> {
    key: String,
    value: &'a str,
    kind: ListKind,
}

/// Store-backed index of which entries and paths depend on which entities.
pub struct Registry {
    backend: Arc<dyn CacheBackend>,
    max_list_bytes: usize,
    metadata_ttl: Duration,
}

impl Registry {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            max_list_bytes: config.max_registry_value_size,
            metadata_ttl: config.metadata_ttl(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Record that `entry_key`, served at `path`, was built from `entities`.
    ///
    /// Issues one multi-get, one multi-delete and one multi-set. Lists and the
    /// contribution set are only written when their value changes.
    #[instrument(skip_all, fields(entry = %entry_key, path = %path, entities = entities.len()))]
    pub async fn commit(
        &self,
        entry_key: &str,
        path: &str,
        entities: &[EntityRef],
    ) -> Result<CommitReport, CacheError> {
        let started_at = Instant::now();
        let entities = distinct(entities);
        if entities.is_empty() {
            debug!("no dependencies recorded; nothing to index");
            return Ok(CommitReport::default());
        }

        let updates = plan_updates(&entities, entry_key, path);
        let contributions_key = keys::contributions(entry_key);
        let mut read_keys: Vec<String> = updates.iter().map(|update| update.key.clone()).collect();
        read_keys.push(contributions_key.clone());

        let stored = read_many(self.backend.as_ref(), &read_keys).await?;

        let mut batch = WriteBatch::new();
        let mut evicted = 0;
        for update in updates {
            let raw = stored.get(&update.key);
            let current: Vec<String> = decode_or_empty(&update.key, raw);
            let trimmed = trim_to_budget(current.clone(), self.max_list_bytes)?;
            evicted += trimmed.discarded.len();

            if update.kind == ListKind::Entries {
                for dropped in trimmed.discarded {
                    if dropped != entry_key {
                        batch.delete(keys::contributions(&dropped));
                        batch.delete(dropped);
                    }
                }
            }

            let mut next = trimmed.kept;
            if !next.iter().any(|value| value == update.value) {
                next.push(update.value.to_string());
            }
            if raw.is_some() && next == current {
                continue;
            }
            batch.set(update.key, encode(&next)?);
        }

        let recorded: Option<Vec<EntityRef>> = stored
            .get(&contributions_key)
            .and_then(|raw| serde_json::from_slice(raw).ok());
        if recorded.as_ref() != Some(&entities) {
            batch.set(contributions_key, encode(&entities)?);
        }

        let batch_report = batch.commit(self.backend.as_ref(), self.metadata_ttl).await?;
        let report = CommitReport {
            read: read_keys.len(),
            evicted,
            deleted: batch_report.deleted,
            written: batch_report.written,
        };

        if evicted > 0 {
            counter!(METRIC_INDEX_EVICTED).increment(evicted as u64);
        }
        histogram!(METRIC_COMMIT_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            read = report.read,
            evicted = report.evicted,
            deleted = report.deleted,
            written = report.written,
            "registry commit complete"
        );
        Ok(report)
    }

    /// Entities recorded for a cache entry by its last commit.
    pub async fn contributions(&self, entry_key: &str) -> Result<Vec<EntityRef>, CacheError> {
        self.read_list(&keys::contributions(entry_key)).await
    }

    pub async fn entries_for_entity(&self, entity: &EntityRef) -> Result<Vec<String>, CacheError> {
        self.read_list(&keys::entries_by_entity(entity)).await
    }

    pub async fn paths_for_entity(&self, entity: &EntityRef) -> Result<Vec<String>, CacheError> {
        self.read_list(&keys::paths_by_entity(entity)).await
    }

    pub async fn entries_for_type(&self, type_id: TypeId) -> Result<Vec<String>, CacheError> {
        self.read_list(&keys::entries_by_type(type_id)).await
    }

    pub async fn paths_for_type(&self, type_id: TypeId) -> Result<Vec<String>, CacheError> {
        self.read_list(&keys::paths_by_type(type_id)).await
    }

    /// Delete every entry built from `entity` and release its paths.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn invalidate_entity(&self, entity: &EntityRef) -> Result<Invalidation, CacheError> {
        self.invalidate(keys::entries_by_entity(entity), keys::paths_by_entity(entity))
            .await
    }

    /// Delete every entry built from any object of `type_id` and release its paths.
    #[instrument(skip(self))]
    pub async fn invalidate_type(&self, type_id: TypeId) -> Result<Invalidation, CacheError> {
        self.invalidate(keys::entries_by_type(type_id), keys::paths_by_type(type_id))
            .await
    }

    async fn invalidate(
        &self,
        entries_key: String,
        paths_key: String,
    ) -> Result<Invalidation, CacheError> {
        let index_keys = [entries_key, paths_key];
        let stored = read_many(self.backend.as_ref(), &index_keys).await?;
        let [entries_key, paths_key] = index_keys;

        let entries: Vec<String> = decode_or_empty(&entries_key, stored.get(&entries_key));
        let paths: Vec<String> = decode_or_empty(&paths_key, stored.get(&paths_key));

        let mut batch = WriteBatch::new();
        for entry in &entries {
            batch.delete(entry.clone());
            batch.delete(keys::contributions(entry));
        }
        if stored.contains_key(&entries_key) {
            batch.delete(entries_key);
        }
        if stored.contains_key(&paths_key) {
            batch.delete(paths_key);
        }
        batch.commit(self.backend.as_ref(), self.metadata_ttl).await?;

        if !entries.is_empty() {
            counter!(METRIC_INVALIDATED).increment(entries.len() as u64);
        }
        debug!(
            entries = entries.len(),
            paths = paths.len(),
            "index lists consumed"
        );
        Ok(Invalidation { entries, paths })
    }

    async fn read_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, CacheError> {
        let raw = self.backend.get(key).await?;
        Ok(decode_or_empty(key, raw.as_ref()))
    }
}

/// List updates for a commit: per entity, then per type, each entries before paths.
fn plan_updates<'a>(entities: &[EntityRef], entry_key: &'a str, path: &'a str) -> Vec<ListUpdate<'a>> {
    let mut updates = Vec::with_capacity(entities.len() * 4);
    for entity in entities {
        updates.push(ListUpdate {
            key: keys::entries_by_entity(entity),
            value: entry_key,
            kind: ListKind::Entries,
        });
        updates.push(ListUpdate {
            key: keys::paths_by_entity(entity),
            value: path,
            kind: ListKind::Paths,
        });
    }

    let mut seen_types = HashSet::new();
    for type_id in entities.iter().map(EntityRef::type_id) {
        if !seen_types.insert(type_id) {
            continue;
        }
        updates.push(ListUpdate {
            key: keys::entries_by_type(type_id),
            value: entry_key,
            kind: ListKind::Entries,
        });
        updates.push(ListUpdate {
            key: keys::paths_by_type(type_id),
            value: path,
            kind: ListKind::Paths,
        });
    }
    updates
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(Bytes::from)
}

/// Decode a stored list, treating absent or unreadable values as empty.
fn decode_or_empty<T: DeserializeOwned>(key: &str, raw: Option<&Bytes>) -> Vec<T> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    serde_json::from_slice(raw).unwrap_or_else(|err| {
        warn!(key, error = %err, "discarding unreadable index value");
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::cache::bounded::encoded_len;
    use crate::cache::store::{CallCounts, MemoryBackend};

    const POST: TypeId = 7;
    const TAG: TypeId = 9;

    fn setup(config: CacheConfig) -> (Arc<MemoryBackend>, Registry) {
        let backend = Arc::new(MemoryBackend::new(NonZeroUsize::new(1024).expect("non-zero")));
        let registry = Registry::new(backend.clone(), &config);
        (backend, registry)
    }

    #[tokio::test]
    async fn commit_populates_all_four_families() {
        let (_, registry) = setup(CacheConfig::default());
        let post = EntityRef::new(POST, 42);

        registry
            .commit("E1", "/page/1", &[post.clone(), EntityRef::new(TAG, 1)])
            .await
            .expect("commit");

        assert_eq!(registry.entries_for_entity(&post).await.expect("read"), ["E1"]);
        assert_eq!(registry.paths_for_entity(&post).await.expect("read"), ["/page/1"]);
        assert_eq!(registry.entries_for_type(POST).await.expect("read"), ["E1"]);
        assert_eq!(registry.paths_for_type(TAG).await.expect("read"), ["/page/1"]);
        assert_eq!(
            registry.contributions("E1").await.expect("read"),
            vec![post, EntityRef::new(TAG, 1)]
        );
    }

    #[tokio::test]
    async fn commit_appends_without_duplicates() {
        let (_, registry) = setup(CacheConfig::default());
        let post = EntityRef::new(POST, 1);

        registry.commit("E1", "/a", &[post.clone()]).await.expect("commit");
        registry.commit("E2", "/a", &[post.clone()]).await.expect("commit");
        registry.commit("E1", "/b", &[post.clone()]).await.expect("commit");

        assert_eq!(
            registry.entries_for_entity(&post).await.expect("read"),
            ["E1", "E2"]
        );
        assert_eq!(registry.paths_for_entity(&post).await.expect("read"), ["/a", "/b"]);
    }

    #[tokio::test]
    async fn duplicate_entities_match_deduplicated_commit() {
        let post = EntityRef::new(POST, 1);
        let tag = EntityRef::new(TAG, 2);

        let (dup_backend, dup) = setup(CacheConfig::default());
        let dup_report = dup
            .commit("E1", "/", &[post.clone(), tag.clone(), post.clone(), tag.clone()])
            .await
            .expect("commit");
        let (plain_backend, plain) = setup(CacheConfig::default());
        let plain_report = plain
            .commit("E1", "/", &[post.clone(), tag.clone()])
            .await
            .expect("commit");

        assert_eq!(dup_report, plain_report);
        assert_eq!(dup_backend.len(), plain_backend.len());
        for entity in [&post, &tag] {
            assert_eq!(
                dup.entries_for_entity(entity).await.expect("read"),
                plain.entries_for_entity(entity).await.expect("read")
            );
        }
        assert_eq!(
            dup.contributions("E1").await.expect("read"),
            plain.contributions("E1").await.expect("read")
        );
    }

    #[tokio::test]
    async fn repeated_commit_writes_nothing() {
        let (backend, registry) = setup(CacheConfig::default());
        let entities = [EntityRef::new(POST, 1), EntityRef::new(TAG, 1)];
        registry.commit("E1", "/", &entities).await.expect("commit");

        let before = backend.calls();
        let report = registry.commit("E1", "/", &entities).await.expect("commit");
        let after = backend.calls();

        assert_eq!(report.written, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(after.writes(), before.writes());
        assert_eq!(after.get_many, before.get_many + 1);
    }

    #[tokio::test]
    async fn commit_uses_one_call_per_phase() {
        let (backend, registry) = setup(CacheConfig::default());
        let report = registry
            .commit("E1", "/", &[EntityRef::new(POST, 1), EntityRef::new(POST, 2)])
            .await
            .expect("commit");

        // 2 entities x 2 families + 1 type x 2 families + contributions
        assert_eq!(report.read, 7);
        assert_eq!(report.written, 7);
        let calls = backend.calls();
        assert_eq!(calls.get_many, 1);
        assert_eq!(calls.set_many, 1);
        assert_eq!(calls.get + calls.set, 0);
    }

    #[tokio::test]
    async fn oversized_list_evicts_and_deletes_old_entries() {
        let old_entries: Vec<String> = (0..30).map(|i| format!("depcache-get-{i:02}")).collect();
        let budget = encoded_len(&old_entries).expect("encode");
        let (backend, registry) = setup(CacheConfig {
            max_registry_value_size: budget,
            ..Default::default()
        });
        let post = EntityRef::new(POST, 1);

        backend
            .set(
                &keys::entries_by_entity(&post),
                encode(&old_entries).expect("encode"),
                Duration::from_secs(60),
            )
            .await
            .expect("seed list");
        for entry in &old_entries[..10] {
            backend
                .set(entry, Bytes::from_static(b"payload"), Duration::from_secs(60))
                .await
                .expect("seed entry");
        }

        let report = registry
            .commit("depcache-get-new", "/", &[post.clone()])
            .await
            .expect("commit");

        assert_eq!(report.evicted, 10);
        let entries = registry.entries_for_entity(&post).await.expect("read");
        assert_eq!(entries.len(), 21);
        assert_eq!(entries.first().map(String::as_str), Some("depcache-get-10"));
        assert_eq!(entries.last().map(String::as_str), Some("depcache-get-new"));
        for entry in &old_entries[..10] {
            assert!(!backend.contains(entry), "{entry} should be deleted");
        }
    }

    #[tokio::test]
    async fn evicting_the_registered_key_keeps_its_entry() {
        let mut old_entries: Vec<String> = (0..19).map(|i| format!("depcache-get-{i:02}")).collect();
        old_entries.insert(0, "depcache-get-self".to_string());
        let budget = encoded_len(&old_entries).expect("encode");
        let (backend, registry) = setup(CacheConfig {
            max_registry_value_size: budget,
            ..Default::default()
        });
        let post = EntityRef::new(POST, 1);

        backend
            .set(
                &keys::entries_by_entity(&post),
                encode(&old_entries).expect("encode"),
                Duration::from_secs(60),
            )
            .await
            .expect("seed list");
        backend
            .set("depcache-get-self", Bytes::from_static(b"fresh"), Duration::from_secs(60))
            .await
            .expect("seed entry");

        registry
            .commit("depcache-get-self", "/", &[post.clone()])
            .await
            .expect("commit");

        assert!(backend.contains("depcache-get-self"));
        let entries = registry.entries_for_entity(&post).await.expect("read");
        assert_eq!(entries.last().map(String::as_str), Some("depcache-get-self"));
    }

    #[tokio::test]
    async fn serial_backend_produces_same_state() {
        let backend = Arc::new(MemoryBackend::without_batching(
            NonZeroUsize::new(64).expect("non-zero"),
        ));
        let registry = Registry::new(backend.clone(), &CacheConfig::default());
        let post = EntityRef::new(POST, 3);

        registry.commit("E1", "/x", &[post.clone()]).await.expect("commit");

        assert_eq!(registry.entries_for_entity(&post).await.expect("read"), ["E1"]);
        let calls = backend.calls();
        assert_eq!(calls.get_many + calls.set_many + calls.delete_many, 0);
        assert_eq!(calls.set, 5);
    }

    #[tokio::test]
    async fn unreadable_list_is_replaced() {
        let (backend, registry) = setup(CacheConfig::default());
        let post = EntityRef::new(POST, 1);
        backend
            .set(
                &keys::entries_by_entity(&post),
                Bytes::from_static(b"not json"),
                Duration::from_secs(60),
            )
            .await
            .expect("seed");

        registry.commit("E1", "/", &[post.clone()]).await.expect("commit");
        assert_eq!(registry.entries_for_entity(&post).await.expect("read"), ["E1"]);
    }

    #[tokio::test]
    async fn empty_dependencies_touch_nothing() {
        let (backend, registry) = setup(CacheConfig::default());
        let report = registry.commit("E1", "/", &[]).await.expect("commit");
        assert_eq!(report, CommitReport::default());
        assert_eq!(backend.calls(), CallCounts::default());
    }

    #[tokio::test]
    async fn invalidate_entity_deletes_entries_and_returns_paths() {
        let (backend, registry) = setup(CacheConfig::default());
        let post = EntityRef::new(POST, 42);
        for (entry, path) in [("E1", "/a"), ("E2", "/b")] {
            backend
                .set(entry, Bytes::from_static(b"payload"), Duration::from_secs(60))
                .await
                .expect("seed entry");
            registry.commit(entry, path, &[post.clone()]).await.expect("commit");
        }

        let invalidation = registry.invalidate_entity(&post).await.expect("invalidate");

        assert_eq!(invalidation.entries, ["E1", "E2"]);
        assert_eq!(invalidation.paths, ["/a", "/b"]);
        assert!(!backend.contains("E1"));
        assert!(!backend.contains("E2"));
        assert!(!backend.contains(&keys::contributions("E1")));
        assert!(registry.entries_for_entity(&post).await.expect("read").is_empty());
        assert!(registry.paths_for_entity(&post).await.expect("read").is_empty());
        // The type index is untouched by an entity change.
        assert_eq!(registry.entries_for_type(POST).await.expect("read"), ["E1", "E2"]);
    }

    #[tokio::test]
    async fn invalidate_type_covers_every_object() {
        let (backend, registry) = setup(CacheConfig::default());
        registry
            .commit("E1", "/list", &[EntityRef::new(POST, 1)])
            .await
            .expect("commit");
        registry
            .commit("E2", "/other", &[EntityRef::new(POST, 2)])
            .await
            .expect("commit");
        backend
            .set("E1", Bytes::from_static(b"payload"), Duration::from_secs(60))
            .await
            .expect("seed entry");

        let invalidation = registry.invalidate_type(POST).await.expect("invalidate");

        assert_eq!(invalidation.entries, ["E1", "E2"]);
        assert_eq!(invalidation.paths, ["/list", "/other"]);
        assert!(!backend.contains("E1"));
    }

    #[tokio::test]
    async fn invalidating_unknown_entity_is_empty() {
        let (_, registry) = setup(CacheConfig::default());
        let invalidation = registry
            .invalidate_entity(&EntityRef::new(POST, 404))
            .await
            .expect("invalidate");
        assert!(invalidation.is_empty());
    }
}
