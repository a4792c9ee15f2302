//! Per-request dependency collection.
//!
//! A [`RequestScope`] is created by the host for each inbound request and passed to
//! every cacheable computation that request runs. Computations record the entities they
//! read into the scope's [`Dependencies`]; nested computations share the same
//! accumulator, so an outer cache entry also depends on everything its fragments read.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use super::keys::EntityRef;
use super::lock::lock_recovering;

/// Ordered, append-only log of entities read while producing output.
///
/// Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    refs: Arc<Mutex<Vec<EntityRef>>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entity read (called from the computation).
    ///
    /// # Example
    ///
    /// ```ignore
    /// deps.record(EntityRef::new(POST_TYPE, post.id));
    /// ```
    pub fn record(&self, entity: EntityRef) {
        lock_recovering(&self.refs, "deps.record").push(entity);
    }

    pub fn record_all(&self, entities: impl IntoIterator<Item = EntityRef>) {
        lock_recovering(&self.refs, "deps.record_all").extend(entities);
    }

    /// Number of recorded reads, duplicates included.
    pub fn len(&self) -> usize {
        lock_recovering(&self.refs, "deps.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct entities recorded at or after position `start`, in first-seen order.
    pub fn since(&self, start: usize) -> Vec<EntityRef> {
        let refs = lock_recovering(&self.refs, "deps.since");
        distinct(refs.get(start..).unwrap_or_default())
    }

    /// Distinct entities recorded so far.
    pub fn collect(&self) -> Vec<EntityRef> {
        self.since(0)
    }
}

/// Drop repeated entities, keeping the first occurrence of each.
pub fn distinct<'a>(entities: impl IntoIterator<Item = &'a EntityRef>) -> Vec<EntityRef> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|entity| seen.insert(*entity))
        .cloned()
        .collect()
}

/// Holder of one request's dependency accumulator.
///
/// The accumulator is created on first use and never replaced, no matter how many
/// computations ask for it. Clones refer to the same request.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    deps: Arc<OnceCell<Dependencies>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// The request's accumulator, initialising it on first call.
    pub fn dependencies(&self) -> &Dependencies {
        self.deps.get_or_init(Dependencies::new)
    }

    pub fn is_initialized(&self) -> bool {
        self.deps.get().is_some()
    }
}
