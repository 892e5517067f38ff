//! Operation vocabulary - the patch and query verbs consumed from the
//! request layer
//!
//! Operations arrive serde-tagged with their wire names (`addRecord`,
//! `replaceRelatedRecords`, ...) and dispatch onto the cache facade. Every
//! relationship verb reduces to the same edge primitives at the physical
//! layer; the vocabulary exists for callers, not for storage.

use crate::identity::RecordIdentity;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single mutation against the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecordOperation {
    AddRecord {
        record: Record,
    },
    UpdateRecord {
        record: Record,
    },
    RemoveRecord {
        record: RecordIdentity,
    },
    ReplaceKey {
        record: RecordIdentity,
        key: String,
        value: String,
    },
    ReplaceAttribute {
        record: RecordIdentity,
        attribute: String,
        value: Value,
    },
    AddToRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        related_record: RecordIdentity,
    },
    RemoveFromRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        related_record: RecordIdentity,
    },
    ReplaceRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        related_records: Vec<RecordIdentity>,
    },
    ReplaceRelatedRecord {
        record: RecordIdentity,
        relationship: String,
        related_record: Option<RecordIdentity>,
    },
}

/// A read against the cache.
///
/// `findRecords` comes in three shapes: by explicit identities, by model,
/// or unfiltered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecordQuery {
    FindRecord {
        record: RecordIdentity,
    },
    FindRecords {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        records: Option<Vec<RecordIdentity>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

/// Result of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Record(Option<Record>),
    Records(Vec<Record>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_names() {
        let op = RecordOperation::ReplaceRelatedRecord {
            record: RecordIdentity::new("planet", "pluto"),
            relationship: "star".to_string(),
            related_record: None,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "replaceRelatedRecord");
        assert_eq!(json["relatedRecord"], Value::Null);

        let back: RecordOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_find_records_shapes() {
        let all: RecordQuery = serde_json::from_str(r#"{"op":"findRecords"}"#).unwrap();
        assert_eq!(
            all,
            RecordQuery::FindRecords {
                records: None,
                model: None
            }
        );

        let by_model: RecordQuery =
            serde_json::from_str(r#"{"op":"findRecords","model":"planet"}"#).unwrap();
        assert_eq!(
            by_model,
            RecordQuery::FindRecords {
                records: None,
                model: Some("planet".to_string())
            }
        );
    }
}
