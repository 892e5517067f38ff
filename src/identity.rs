//! Record identity - a reference to a record by value
//!
//! An identity names a record by `(model, id)` without carrying any of its
//! data. Identities are what relationship edges point at.

use serde::{Deserialize, Serialize};

/// A value-type reference to a record: its model name plus its caller-assigned id.
///
/// Identities have no ownership semantics - holding one does not imply the
/// referenced record exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    /// Model (record type) name - maps 1:1 to a physical table
    pub model: String,
    /// Caller-assigned id, immutable once the record is created
    pub id: String,
}

impl RecordIdentity {
    /// Create a new identity
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.model, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let identity = RecordIdentity::new("planet", "jupiter");
        assert_eq!(identity.to_string(), "planet/jupiter");
    }

    #[test]
    fn test_identity_equality() {
        let a = RecordIdentity::new("planet", "jupiter");
        let b = RecordIdentity::new("planet", "jupiter");
        let c = RecordIdentity::new("moon", "jupiter");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
