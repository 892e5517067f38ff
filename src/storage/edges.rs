//! Relationship store - edge reads, writes, and diffs
//!
//! Every relationship between records is one row in the shared
//! `__RELATIONSHIPS__` table, keyed by all five columns. Replacement is
//! delete-then-reinsert inside the caller's write transaction, so no diffing
//! against prior state is needed and partial application is never observable.

use crate::identity::RecordIdentity;
use crate::record::{Record, RelationshipValue};
use crate::schema::{Cardinality, Schema};
use crate::{Error, Result};
use rusqlite::{Connection, params};
use std::collections::{BTreeMap, BTreeSet};

const INSERT_EDGE: &str = r#"
INSERT OR IGNORE INTO "__RELATIONSHIPS__"
    (source_id, source_table, relation_name, target_id, target_table)
VALUES (?1, ?2, ?3, ?4, ?5)
"#;

/// A physical relationship row. Not exposed through the cache facade.
///
/// `target` is `None` for the explicit "no relation" row of a cardinality-one
/// relationship; cardinality-many relationships never store a `None` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipEdge {
    pub source: RecordIdentity,
    pub relation: String,
    pub target: Option<RecordIdentity>,
}

impl RelationshipEdge {
    /// Create a new edge
    pub fn new(
        source: RecordIdentity,
        relation: impl Into<String>,
        target: Option<RecordIdentity>,
    ) -> Self {
        Self {
            source,
            relation: relation.into(),
            target,
        }
    }
}

/// One inverse-side hit: the relationship name and the record holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InverseRelationship {
    pub relation: String,
    pub source: RecordIdentity,
}

/// Read all edges where the record is source, grouped by relation name and
/// reshaped according to each relationship's declared cardinality.
///
/// Rows for relation names the schema no longer declares are skipped.
pub fn relationships_for(
    conn: &Connection,
    schema: &Schema,
    identity: &RecordIdentity,
) -> Result<BTreeMap<String, RelationshipValue>> {
    let mut stmt = conn.prepare(
        r#"SELECT relation_name, target_id, target_table FROM "__RELATIONSHIPS__"
           WHERE source_id = ?1 AND source_table = ?2"#,
    )?;
    let rows = stmt.query_map(params![identity.id, identity.model], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut relationships: BTreeMap<String, RelationshipValue> = BTreeMap::new();
    for row in rows {
        let (relation, target_id, target_table) = row?;
        let target = match (target_id, target_table) {
            (Some(id), Some(model)) => Some(RecordIdentity::new(model, id)),
            _ => None,
        };
        match schema.cardinality(&identity.model, &relation) {
            Some(Cardinality::One) => {
                relationships.insert(relation, RelationshipValue::One(target));
            }
            Some(Cardinality::Many) => {
                let Some(target) = target else { continue };
                let entry = relationships
                    .entry(relation)
                    .or_insert_with(|| RelationshipValue::Many(BTreeSet::new()));
                if let RelationshipValue::Many(targets) = entry {
                    targets.insert(target);
                }
            }
            None => {
                tracing::warn!(
                    "Skipping undeclared relationship '{}' on {}",
                    relation,
                    identity
                );
            }
        }
    }
    Ok(relationships)
}

/// Read all edges where the record is *target*: the inverse side of each
/// relationship that points at it.
pub fn inverses_for(conn: &Connection, identity: &RecordIdentity) -> Result<Vec<InverseRelationship>> {
    let mut stmt = conn.prepare(
        r#"SELECT source_id, source_table, relation_name FROM "__RELATIONSHIPS__"
           WHERE target_id = ?1 AND target_table = ?2"#,
    )?;
    let rows = stmt.query_map(params![identity.id, identity.model], |row| {
        Ok(InverseRelationship {
            source: RecordIdentity::new(row.get::<_, String>(1)?, row.get::<_, String>(0)?),
            relation: row.get(2)?,
        })
    })?;
    let mut inverses = Vec::new();
    for row in rows {
        inverses.push(row?);
    }
    Ok(inverses)
}

/// Delete every edge where the record is source, then insert one edge per
/// entry in the record's relationship map. Validates each entry against the
/// schema (declared name, matching cardinality) before touching any row.
pub fn replace_all(conn: &Connection, schema: &Schema, record: &Record) -> Result<()> {
    for (name, value) in &record.relationships {
        let def = schema.relationship(record.model(), name)?;
        let matches = matches!(
            (def.cardinality, value),
            (Cardinality::One, RelationshipValue::One(_))
                | (Cardinality::Many, RelationshipValue::Many(_))
        );
        if !matches {
            return Err(Error::CardinalityMismatch {
                model: record.model().to_string(),
                relationship: name.clone(),
                declared: def.cardinality,
            });
        }
    }

    remove_source(conn, &record.identity)?;
    for (name, value) in &record.relationships {
        insert_value(conn, &record.identity, name, value)?;
    }
    Ok(())
}

/// Replace the edges of a single `(source, relation)` pair.
///
/// The primitive behind every fine-grained relationship patch verb.
pub fn replace_one(
    conn: &Connection,
    source: &RecordIdentity,
    relation: &str,
    value: &RelationshipValue,
) -> Result<()> {
    conn.execute(
        r#"DELETE FROM "__RELATIONSHIPS__"
           WHERE source_id = ?1 AND source_table = ?2 AND relation_name = ?3"#,
        params![source.id, source.model, relation],
    )?;
    insert_value(conn, source, relation, value)
}

/// Bulk edge insertion. Adding an edge that already exists is a no-op.
pub fn add(conn: &Connection, edges: &[RelationshipEdge]) -> Result<()> {
    let mut stmt = conn.prepare(INSERT_EDGE)?;
    for edge in edges {
        stmt.execute(params![
            edge.source.id,
            edge.source.model,
            edge.relation,
            edge.target.as_ref().map(|t| t.id.as_str()),
            edge.target.as_ref().map(|t| t.model.as_str()),
        ])?;
    }
    Ok(())
}

/// Bulk edge removal. Removing a non-existent edge is a no-op.
pub fn remove(conn: &Connection, edges: &[RelationshipEdge]) -> Result<()> {
    let mut stmt = conn.prepare(
        r#"DELETE FROM "__RELATIONSHIPS__"
           WHERE source_id = ?1 AND source_table = ?2 AND relation_name = ?3
             AND target_id IS ?4 AND target_table IS ?5"#,
    )?;
    for edge in edges {
        stmt.execute(params![
            edge.source.id,
            edge.source.model,
            edge.relation,
            edge.target.as_ref().map(|t| t.id.as_str()),
            edge.target.as_ref().map(|t| t.model.as_str()),
        ])?;
    }
    Ok(())
}

/// Delete every edge where the record is source.
///
/// Edges referencing the record as target are intentionally left in place.
pub fn remove_source(conn: &Connection, identity: &RecordIdentity) -> Result<()> {
    conn.execute(
        r#"DELETE FROM "__RELATIONSHIPS__" WHERE source_id = ?1 AND source_table = ?2"#,
        params![identity.id, identity.model],
    )?;
    Ok(())
}

fn insert_value(
    conn: &Connection,
    source: &RecordIdentity,
    relation: &str,
    value: &RelationshipValue,
) -> Result<()> {
    let mut stmt = conn.prepare(INSERT_EDGE)?;
    match value {
        RelationshipValue::One(target) => {
            stmt.execute(params![
                source.id,
                source.model,
                relation,
                target.as_ref().map(|t| t.id.as_str()),
                target.as_ref().map(|t| t.model.as_str()),
            ])?;
        }
        RelationshipValue::Many(targets) => {
            for target in targets {
                stmt.execute(params![source.id, source.model, relation, target.id, target.model])?;
            }
        }
    }
    Ok(())
}
