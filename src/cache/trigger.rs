//! Invalidation entry points for domain writes.
//!
//! The host calls these after a successful mutation; the cache finds every entry built
//! from the changed object (or type), deletes it, and hands the affected paths to an
//! optional [`Purger`] for downstream caches.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::error::{CacheError, PurgeError};
use super::keys::{EntityRef, ObjectId, TypeId};
use super::policy::CachePolicy;
use super::registry::{Invalidation, Registry};
use super::store::CacheBackend;

/// Receives paths whose cached output was invalidated (e.g. to purge a CDN).
#[async_trait]
pub trait Purger: Send + Sync {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError>;
}

/// Publishes entity and type changes to the dependency registry.
///
/// # Usage
///
/// ```ignore
/// // After a post was saved:
/// invalidator.notify_entity_changed(POST_TYPE, post.id).await?;
/// // After a post was created, so listings pick it up:
/// invalidator.notify_type_created(POST_TYPE).await?;
/// ```
pub struct Invalidator {
    registry: Registry,
    enabled: bool,
    purger: Option<Arc<dyn Purger>>,
}

impl Invalidator {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            registry: Registry::new(backend, config),
            enabled: config.invalidate,
            purger: None,
        }
    }

    /// An invalidator over the same store and settings as `policy`.
    pub fn for_policy(policy: &CachePolicy) -> Self {
        Self::new(policy.backend().clone(), policy.config())
    }

    pub fn with_purger(mut self, purger: Arc<dyn Purger>) -> Self {
        self.purger = Some(purger);
        self
    }

    /// Drop every entry built from one object.
    pub async fn notify_entity_changed(
        &self,
        type_id: TypeId,
        object_id: impl Into<ObjectId>,
    ) -> Result<Invalidation, CacheError> {
        let entity = EntityRef::new(type_id, object_id);
        if !self.enabled {
            debug!(entity = %entity, "Invalidation skipped: disabled");
            return Ok(Invalidation::default());
        }

        let invalidation = self.registry.invalidate_entity(&entity).await?;
        info!(
            entity = %entity,
            entries = invalidation.entries.len(),
            "Entity change invalidated cache"
        );
        self.purge(&invalidation).await;
        Ok(invalidation)
    }

    /// Drop every entry built from any object of a type, including listings.
    pub async fn notify_type_created(&self, type_id: TypeId) -> Result<Invalidation, CacheError> {
        if !self.enabled {
            debug!(type_id, "Invalidation skipped: disabled");
            return Ok(Invalidation::default());
        }

        let invalidation = self.registry.invalidate_type(type_id).await?;
        info!(
            type_id,
            entries = invalidation.entries.len(),
            "Type change invalidated cache"
        );
        self.purge(&invalidation).await;
        Ok(invalidation)
    }

    async fn purge(&self, invalidation: &Invalidation) {
        let Some(purger) = &self.purger else {
            return;
        };
        if invalidation.paths.is_empty() {
            return;
        }
        if let Err(err) = purger.purge(&invalidation.paths).await {
            warn!(
                paths = invalidation.paths.len(),
                error = %err,
                "Purging invalidated paths failed"
            );
        }
    }
}
