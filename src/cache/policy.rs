//! Per-request cache decisions.
//!
//! [`CachePolicy::compute`] walks one computation through
//! `received -> bypass | hit-serving | miss-computing -> store-committing -> done`
//! and reports which path it took as an [`Outcome`]. The computation's result is
//! returned on every path; only a context that cannot be fingerprinted fails the call.

use std::future::Future;
use std::sync::Arc;

use axum::http::Method;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::batch::read_many;
use super::config::CacheConfig;
use super::deps::{Dependencies, RequestScope};
use super::error::{CacheError, SnapshotError, StoreError};
use super::fingerprint::Invocation;
use super::keys::{self, EntityRef};
use super::registry::Registry;
use super::snapshot::{Artifact, CachedArtifact};
use super::store::{Backends, CacheBackend};

/// What the policy needs to know about the inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFacts {
    pub method: Method,
    /// Path including the query string.
    pub full_path: String,
    pub tenant: Option<String>,
    /// The response would include one-off, per-user notifications.
    pub has_transient_messages: bool,
    /// Recompute and overwrite even when an entry exists.
    pub force_refresh: bool,
}

impl RequestFacts {
    pub fn new(method: Method, full_path: impl Into<String>) -> Self {
        Self {
            method,
            full_path: full_path.into(),
            tenant: None,
            has_transient_messages: false,
            force_refresh: false,
        }
    }

    pub fn get(full_path: impl Into<String>) -> Self {
        Self::new(Method::GET, full_path)
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_transient_messages(mut self, present: bool) -> Self {
        self.has_transient_messages = present;
        self
    }

    pub fn with_force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn bypass_reason(&self) -> Option<BypassReason> {
        if self.method != Method::GET && self.method != Method::HEAD {
            return Some(BypassReason::UnsafeMethod);
        }
        if self.has_transient_messages {
            return Some(BypassReason::TransientMessages);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    UnsafeMethod,
    TransientMessages,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsafeMethod => "unsafe_method",
            Self::TransientMessages => "transient_messages",
        }
    }
}

/// How a computation's result was produced.
#[derive(Debug)]
pub enum Outcome {
    /// Computed without touching the cache.
    Bypass(BypassReason),
    /// Restored from the store; the computation did not run.
    Hit,
    /// Computed, stored and registered.
    Stored,
    /// Computed; the result could not be captured, so nothing was stored.
    NotStored(SnapshotError),
    /// Computed; the store failed and caching was skipped or left incomplete.
    Degraded(CacheError),
}

impl Outcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Bypass(_) => "bypass",
            Self::Hit => "hit",
            Self::Stored => "stored",
            Self::NotStored(_) => "not_stored",
            Self::Degraded(_) => "degraded",
        }
    }
}

/// A computation's result and how it was obtained.
#[derive(Debug)]
pub struct Computed<A> {
    pub artifact: A,
    pub outcome: Outcome,
}

impl<A> Computed<A> {
    pub fn into_artifact(self) -> A {
        self.artifact
    }
}

struct Lookup<A> {
    artifact: Option<A>,
    contributions: Vec<EntityRef>,
}

/// Orchestrates fingerprinting, lookup, computation, storage and registration.
pub struct CachePolicy {
    backend: Arc<dyn CacheBackend>,
    registry: Registry,
    config: CacheConfig,
}

impl CachePolicy {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let registry = Registry::new(backend.clone(), &config);
        Self {
            backend,
            registry,
            config,
        }
    }

    /// Build a policy on the backend named by `config.backend`.
    pub fn from_backends(backends: &Backends, config: CacheConfig) -> Result<Self, StoreError> {
        let backend = backends.select(config.backend.as_deref())?;
        Ok(Self::new(backend, config))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Produce the artifact for `invocation`, from the store when possible.
    ///
    /// `compute` receives the request's dependency accumulator and records every entity
    /// it reads into it. Nested calls made with the same `scope` share that accumulator,
    /// so the enclosing entry is registered against their entities too.
    #[instrument(
        skip_all,
        fields(
            owner = %invocation.owner(),
            function = %invocation.function(),
            path = %request.full_path,
            outcome = tracing::field::Empty
        )
    )]
    pub async fn compute<A, F, Fut>(
        &self,
        request: &RequestFacts,
        scope: &RequestScope,
        invocation: &Invocation,
        compute: F,
    ) -> Result<Computed<A>, CacheError>
    where
        A: Artifact,
        F: FnOnce(Dependencies) -> Fut,
        Fut: Future<Output = A>,
    {
        let deps = scope.dependencies().clone();

        if let Some(reason) = request.bypass_reason() {
            counter!("depcache_bypass_total", "reason" => reason.as_str()).increment(1);
            debug!(reason = reason.as_str(), "bypassing cache");
            let artifact = compute(deps).await;
            return Ok(finish(artifact, Outcome::Bypass(reason)));
        }

        let key = invocation.fingerprint(&request.full_path, request.tenant.as_deref())?;

        let mut lookup_error = None;
        if request.force_refresh {
            debug!(key = %key, "forced refresh; recomputing entry");
        } else {
            match self.lookup::<A>(&key).await {
                Ok(Lookup {
                    artifact: Some(artifact),
                    contributions,
                }) => {
                    deps.record_all(contributions);
                    counter!("depcache_hit_total").increment(1);
                    debug!(key = %key, "cache hit");
                    return Ok(finish(artifact, Outcome::Hit));
                }
                Ok(Lookup { artifact: None, .. }) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "cache lookup failed; computing uncached");
                    lookup_error = Some(err);
                }
            }
        }

        counter!("depcache_miss_total").increment(1);
        debug!(key = %key, "cache miss");

        let start = deps.len();
        let artifact = compute(deps.clone()).await;

        if let Some(err) = lookup_error {
            return Ok(finish(artifact, Outcome::Degraded(err.into())));
        }

        let snapshot = artifact.snapshot();
        let outcome = self
            .store(&key, &request.full_path, snapshot, &deps.since(start))
            .await;
        Ok(finish(artifact, outcome))
    }

    /// Read an entry and, when invalidation is on, its contribution set in one round trip.
    async fn lookup<A: Artifact>(&self, key: &str) -> Result<Lookup<A>, StoreError> {
        let mut read_keys = vec![key.to_string()];
        if self.config.invalidate {
            read_keys.push(keys::contributions(key));
        }
        let mut found = read_many(self.backend.as_ref(), &read_keys).await?;

        let Some(raw) = found.remove(key) else {
            return Ok(Lookup {
                artifact: None,
                contributions: Vec::new(),
            });
        };

        let restored = CachedArtifact::decode(&raw)
            .map_err(CacheError::from)
            .and_then(|cached| A::restore(cached).map_err(CacheError::from));
        let artifact = match restored {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(key, error = %err, "discarding unreadable cache entry");
                return Ok(Lookup {
                    artifact: None,
                    contributions: Vec::new(),
                });
            }
        };

        let contributions = found
            .remove(&keys::contributions(key))
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        Ok(Lookup {
            artifact: Some(artifact),
            contributions,
        })
    }

    async fn store(
        &self,
        key: &str,
        path: &str,
        snapshot: Result<CachedArtifact, SnapshotError>,
        entities: &[EntityRef],
    ) -> Outcome {
        let cached = match snapshot {
            Ok(cached) => cached,
            Err(err) => {
                debug!(key, reason = %err, "result not cacheable");
                return Outcome::NotStored(err);
            }
        };

        match self.persist(key, path, &cached, entities).await {
            Ok(()) => Outcome::Stored,
            Err(err) => {
                warn!(key, error = %err, "caching degraded; result delivered uncached");
                Outcome::Degraded(err)
            }
        }
    }

    async fn persist(
        &self,
        key: &str,
        path: &str,
        cached: &CachedArtifact,
        entities: &[EntityRef],
    ) -> Result<(), CacheError> {
        self.backend
            .set(key, cached.encode()?, self.config.timeout())
            .await?;
        if self.config.invalidate {
            self.registry.commit(key, path, entities).await?;
        }
        Ok(())
    }
}

fn finish<A>(artifact: A, outcome: Outcome) -> Computed<A> {
    tracing::Span::current().record("outcome", outcome.label());
    Computed { artifact, outcome }
}
