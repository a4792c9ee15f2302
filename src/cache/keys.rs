//! Entity references and the store key scheme.
//!
//! Every key the cache writes is derived here so the layout of the shared store is
//! visible in one place.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every cache entry key.
pub const ENTRY_PREFIX: &str = "depcache-get-";

const INDEX_PREFIX: &str = "depcache";
const CONTRIBUTIONS_SUFFIX: &str = "-objs";

/// Numeric identifier of a domain type (e.g. a table or content type).
pub type TypeId = u32;

/// Identifier of a single domain object within its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for ObjectId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<i32> for ObjectId {
    fn from(value: i32) -> Self {
        Self(value.to_string())
    }
}

impl From<Uuid> for ObjectId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// A domain object that contributed to a cached artifact.
///
/// Serialized as a `[type, "object"]` pair inside contribution sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef(pub TypeId, pub ObjectId);

impl EntityRef {
    pub fn new(type_id: TypeId, object_id: impl Into<ObjectId>) -> Self {
        Self(type_id, object_id.into())
    }

    pub fn type_id(&self) -> TypeId {
        self.0
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.1
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// Key of the list of cache entries built from `entity`.
pub fn entries_by_entity(entity: &EntityRef) -> String {
    format!("{INDEX_PREFIX}-{}-{}", entity.0, entity.1)
}

/// Key of the list of paths whose output used `entity`.
pub fn paths_by_entity(entity: &EntityRef) -> String {
    format!("{INDEX_PREFIX}-pth-{}-{}", entity.0, entity.1)
}

/// Key of the list of cache entries built from any object of `type_id`.
pub fn entries_by_type(type_id: TypeId) -> String {
    format!("{INDEX_PREFIX}-ct-{type_id}")
}

/// Key of the list of paths whose output used any object of `type_id`.
pub fn paths_by_type(type_id: TypeId) -> String {
    format!("{INDEX_PREFIX}-ct-pth-{type_id}")
}

/// Key of the contribution set recorded for a cache entry.
pub fn contributions(entry_key: &str) -> String {
    format!("{entry_key}{CONTRIBUTIONS_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_keys_follow_scheme() {
        let entity = EntityRef::new(7, 42u64);
        assert_eq!(entries_by_entity(&entity), "depcache-7-42");
        assert_eq!(paths_by_entity(&entity), "depcache-pth-7-42");
        assert_eq!(entries_by_type(7), "depcache-ct-7");
        assert_eq!(paths_by_type(7), "depcache-ct-pth-7");
        assert_eq!(contributions("depcache-get-ab"), "depcache-get-ab-objs");
    }

    #[test]
    fn entity_ref_serializes_as_pair() {
        let entity = EntityRef::new(7, Uuid::nil());
        let json = serde_json::to_string(&entity).expect("serialize");
        assert_eq!(json, format!("[7,\"{}\"]", Uuid::nil()));

        let back: EntityRef = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, entity);
    }

    #[test]
    fn object_ids_from_numbers_and_strings_agree() {
        assert_eq!(ObjectId::from(42u64), ObjectId::from("42"));
        assert_eq!(EntityRef::new(1, 5i64).to_string(), "1:5");
    }
}
