//! Record types - the abstract record model
//!
//! A record is an identity plus three maps:
//! - `attributes`: opaque scalar values, stored as one encoded blob
//! - `keys`: external key strings, stored as a second blob
//! - `relationships`: typed references to other records, stored as edges
//!
//! Attributes and keys are never individually typed at the physical layer;
//! relationships are reshaped according to their declared cardinality.

use crate::identity::RecordIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The value of one named relationship on a record.
///
/// Cardinality-one relationships hold a single optional target: `One(None)`
/// means "explicitly empty", which is distinct from the relationship being
/// absent from the record entirely. Cardinality-many relationships hold an
/// unordered set of targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipValue {
    /// Set of related identities (cardinality many)
    Many(BTreeSet<RecordIdentity>),
    /// Single optional related identity (cardinality one)
    One(Option<RecordIdentity>),
}

impl RelationshipValue {
    /// Build a cardinality-one value pointing at a target
    pub fn one(target: RecordIdentity) -> Self {
        RelationshipValue::One(Some(target))
    }

    /// Build an explicitly empty cardinality-one value
    pub fn none() -> Self {
        RelationshipValue::One(None)
    }

    /// Build a cardinality-many value from any identity iterator
    pub fn many(targets: impl IntoIterator<Item = RecordIdentity>) -> Self {
        RelationshipValue::Many(targets.into_iter().collect())
    }
}

/// A record in the cache.
///
/// Records are created by `set_record`/`add_record`, patched in place by the
/// fine-grained verbs, and destroyed by `remove_record`. The `id` inside the
/// identity is the table primary key and is immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identity (model + id) of this record
    #[serde(flatten)]
    pub identity: RecordIdentity,
    /// Opaque scalar attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    /// External keys
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, String>,
    /// Relationships by declared name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipValue>,
}

impl Record {
    /// Create a new record with no attributes, keys, or relationships
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            identity: RecordIdentity::new(model, id),
            attributes: BTreeMap::new(),
            keys: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    /// Set one attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set one external key
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }

    /// Set one relationship
    pub fn with_relationship(mut self, name: impl Into<String>, value: RelationshipValue) -> Self {
        self.relationships.insert(name.into(), value);
        self
    }

    /// Model name of this record
    pub fn model(&self) -> &str {
        &self.identity.model
    }

    /// Id of this record
    pub fn id(&self) -> &str {
        &self.identity.id
    }
}
