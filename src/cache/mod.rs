//! Dependency-tracking cache for computed output.
//!
//! A cacheable computation is described by an [`Invocation`] and run through
//! [`CachePolicy::compute`]. While it runs it records the domain objects it reads into
//! the request's [`Dependencies`]; on a miss the result is stored under its fingerprint
//! and the [`Registry`] indexes the entry against those objects and their types. When the
//! host later reports a change through the [`Invalidator`], every affected entry is
//! deleted and its paths are handed to an optional [`Purger`].
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `depcache.toml`:
//!
//! ```toml
//! [cache]
//! max_registry_value_size = 25000
//! invalidate = true
//! timeout_seconds = 300
//! metadata_ttl_seconds = 86400
//! # ... see config.rs for all options
//! ```

mod batch;
mod bounded;
mod config;
pub mod deps;
mod error;
mod fingerprint;
pub mod keys;
mod lock;
mod middleware;
mod policy;
mod registry;
mod snapshot;
mod store;
mod trigger;

pub use batch::{BatchReport, WriteBatch, read_many};
pub use bounded::{Trimmed, encoded_len, trim_to_budget};
pub use config::{
    CacheConfig, DEFAULT_MAX_REGISTRY_VALUE_SIZE, DEFAULT_MEMORY_CAPACITY,
    DEFAULT_METADATA_TTL_SECS, DEFAULT_TIMEOUT_SECS,
};
pub use deps::{Dependencies, RequestScope};
pub use error::{CacheError, FingerprintError, PurgeError, SnapshotError, StoreError};
pub use fingerprint::{Invocation, KeyComponent, PathSentinel, fingerprint};
pub use keys::{ENTRY_PREFIX, EntityRef, ObjectId, TypeId};
pub use middleware::{
    CacheLayerState, OUTCOME_HEADER, PURGE_HEADER, TransientMessages, request_facts,
    response_cache_layer,
};
pub use policy::{BypassReason, CachePolicy, Computed, Outcome, RequestFacts};
pub use registry::{CommitReport, Invalidation, Registry};
pub use snapshot::{Artifact, CachedArtifact};
pub use store::{Backends, CacheBackend, CallCounts, MemoryBackend};
pub use trigger::{Invalidator, Purger};
