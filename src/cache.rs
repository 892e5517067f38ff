//! Cache facade - the public CRUD and patch surface
//!
//! Every verb first ensures the database is open, then runs inside a single
//! write transaction spanning the record table and the edge table. The
//! fine-grained patch verbs all reduce to the relationship-store primitives
//! plus a targeted attribute update; there is no per-verb physical code path.

use crate::db::{Database, SharedConnection};
use crate::identity::RecordIdentity;
use crate::operation::{QueryResult, RecordOperation, RecordQuery};
use crate::record::{Record, RelationshipValue};
use crate::schema::{Cardinality, Schema};
use crate::storage::migrate::SchemaVersionHook;
use crate::storage::{InverseRelationship, RelationshipEdge, codec, edges};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Schema-driven record cache persisted to embedded SQLite
pub struct RecordCache {
    schema: Arc<Schema>,
    db: Database,
}

impl RecordCache {
    /// Cache backed by a database file (created on first open)
    pub fn on_disk(schema: Schema, path: impl Into<PathBuf>) -> Self {
        let schema = Arc::new(schema);
        Self {
            db: Database::at_path(schema.clone(), path),
            schema,
        }
    }

    /// In-memory cache (for testing)
    pub fn in_memory(schema: Schema) -> Self {
        let schema = Arc::new(schema);
        Self {
            db: Database::in_memory(schema.clone()),
            schema,
        }
    }

    /// Install the user-schema-version migration hook
    pub fn with_version_hook(mut self, hook: SchemaVersionHook) -> Self {
        self.db = self.db.with_version_hook(hook);
        self
    }

    /// The schema registry this cache serves
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Ensure the database is open (creation or migration runs as needed)
    pub async fn open(&self) -> Result<()> {
        self.db.open().await.map(|_| ())
    }

    /// Close the database
    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Close and reopen the database
    pub async fn reopen(&self) -> Result<()> {
        self.db.reopen().await.map(|_| ())
    }

    /// Close the database and destroy its physical storage
    pub async fn delete(&self) -> Result<()> {
        self.db.delete().await
    }

    // ========== Queries ==========

    /// Get one record by identity (`None` when absent, never an error)
    pub async fn get_record(&self, identity: &RecordIdentity) -> Result<Option<Record>> {
        let conn = self.db.open().await?;
        let guard = conn.lock().await;
        read_record(&guard, &self.schema, identity)
    }

    /// Get every record of one model
    pub async fn get_records(&self, model: &str) -> Result<Vec<Record>> {
        let conn = self.db.open().await?;
        let guard = conn.lock().await;
        read_model(&guard, &self.schema, model)
    }

    /// Get the records for a list of identities, skipping absent ones
    pub async fn get_records_by_identity(
        &self,
        identities: &[RecordIdentity],
    ) -> Result<Vec<Record>> {
        let conn = self.db.open().await?;
        let guard = conn.lock().await;
        let mut records = Vec::new();
        for identity in identities {
            if let Some(record) = read_record(&guard, &self.schema, identity)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Get every record of every model
    pub async fn all_records(&self) -> Result<Vec<Record>> {
        let conn = self.db.open().await?;
        let guard = conn.lock().await;
        let mut records = Vec::new();
        for model in self.schema.models() {
            records.extend(read_model(&guard, &self.schema, model)?);
        }
        Ok(records)
    }

    /// Every `(relationship, source)` pair pointing at the given record
    pub async fn inverse_relationships(
        &self,
        identity: &RecordIdentity,
    ) -> Result<Vec<InverseRelationship>> {
        let conn = self.db.open().await?;
        let guard = conn.lock().await;
        edges::inverses_for(&guard, identity)
    }

    // ========== Record mutation ==========

    /// Insert or update a record.
    ///
    /// An existence probe on `id` decides insert vs update; updates rewrite
    /// only the columns present in the patch, so a record with empty
    /// attributes never clobbers stored attributes. Relationships are
    /// replaced wholesale when the patch carries any.
    pub async fn set_record(&self, record: &Record) -> Result<()> {
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        upsert_record(&tx, &self.schema, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Update an existing record (same upsert semantics as `set_record`:
    /// a missing record is created rather than rejected)
    pub async fn update_record(&self, record: &Record) -> Result<()> {
        self.set_record(record).await
    }

    /// Insert or update several records in one transaction
    pub async fn set_records(&self, records: &[Record]) -> Result<()> {
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        for record in records {
            upsert_record(&tx, &self.schema, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a record, returning its prior state (`None` if it was absent).
    ///
    /// Deletes every edge where the record is source. Edges referencing it as
    /// target are left in place for the inverse side to clean up.
    pub async fn remove_record(&self, identity: &RecordIdentity) -> Result<Option<Record>> {
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        let prior = delete_record(&tx, &self.schema, identity)?;
        tx.commit()?;
        Ok(prior)
    }

    /// Remove several records in one transaction, returning the prior state
    /// of those that existed
    pub async fn remove_records(&self, identities: &[RecordIdentity]) -> Result<Vec<Record>> {
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        let mut priors = Vec::new();
        for identity in identities {
            if let Some(prior) = delete_record(&tx, &self.schema, identity)? {
                priors.push(prior);
            }
        }
        tx.commit()?;
        Ok(priors)
    }

    // ========== Fine-grained patches ==========

    /// Replace one external key
    pub async fn replace_key(
        &self,
        identity: &RecordIdentity,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        ensure_row(&tx, &self.schema, identity)?;
        let table = self.schema.table(&identity.model)?;
        let blob: Option<String> = tx.query_row(
            &format!(r#"SELECT "keys" FROM {} WHERE id = ?1"#, table.sql()),
            params![identity.id],
            |row| row.get(0),
        )?;
        let mut keys = codec::decode_keys(blob.as_deref(), identity);
        keys.insert(key.to_string(), value.to_string());
        tx.execute(
            &format!(r#"UPDATE {} SET "keys" = ?1 WHERE id = ?2"#, table.sql()),
            params![codec::encode_keys(&keys), identity.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replace one attribute. A `null` value removes the attribute.
    pub async fn replace_attribute(
        &self,
        identity: &RecordIdentity,
        attribute: &str,
        value: Value,
    ) -> Result<()> {
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        ensure_row(&tx, &self.schema, identity)?;
        let table = self.schema.table(&identity.model)?;
        let blob: Option<String> = tx.query_row(
            &format!("SELECT attributes FROM {} WHERE id = ?1", table.sql()),
            params![identity.id],
            |row| row.get(0),
        )?;
        let mut attributes = codec::decode_attributes(blob.as_deref(), identity);
        if value.is_null() {
            attributes.remove(attribute);
        } else {
            attributes.insert(attribute.to_string(), value);
        }
        tx.execute(
            &format!("UPDATE {} SET attributes = ?1 WHERE id = ?2", table.sql()),
            params![codec::encode_attributes(&attributes), identity.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Add one target to a cardinality-many relationship (no-op if present)
    pub async fn add_to_related_records(
        &self,
        identity: &RecordIdentity,
        relationship: &str,
        related: &RecordIdentity,
    ) -> Result<()> {
        self.require_cardinality(identity, relationship, Cardinality::Many)?;
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        ensure_row(&tx, &self.schema, identity)?;
        edges::add(
            &tx,
            &[RelationshipEdge::new(
                identity.clone(),
                relationship,
                Some(related.clone()),
            )],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove one target from a cardinality-many relationship (no-op if absent)
    pub async fn remove_from_related_records(
        &self,
        identity: &RecordIdentity,
        relationship: &str,
        related: &RecordIdentity,
    ) -> Result<()> {
        self.require_cardinality(identity, relationship, Cardinality::Many)?;
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        edges::remove(
            &tx,
            &[RelationshipEdge::new(
                identity.clone(),
                relationship,
                Some(related.clone()),
            )],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the full target set of a cardinality-many relationship
    pub async fn replace_related_records(
        &self,
        identity: &RecordIdentity,
        relationship: &str,
        related: Vec<RecordIdentity>,
    ) -> Result<()> {
        self.require_cardinality(identity, relationship, Cardinality::Many)?;
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        ensure_row(&tx, &self.schema, identity)?;
        edges::replace_one(&tx, identity, relationship, &RelationshipValue::many(related))?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the target of a cardinality-one relationship.
    ///
    /// `None` stores an explicit empty value, distinct from the relationship
    /// never having been set.
    pub async fn replace_related_record(
        &self,
        identity: &RecordIdentity,
        relationship: &str,
        related: Option<RecordIdentity>,
    ) -> Result<()> {
        self.require_cardinality(identity, relationship, Cardinality::One)?;
        let conn = self.db.open().await?;
        let mut guard = conn.lock().await;
        let tx = guard.transaction()?;
        ensure_row(&tx, &self.schema, identity)?;
        edges::replace_one(&tx, identity, relationship, &RelationshipValue::One(related))?;
        tx.commit()?;
        Ok(())
    }

    // ========== Vocabulary dispatch ==========

    /// Apply one operation from the request layer
    pub async fn apply(&self, operation: &RecordOperation) -> Result<()> {
        match operation {
            RecordOperation::AddRecord { record } => self.set_record(record).await,
            RecordOperation::UpdateRecord { record } => self.update_record(record).await,
            RecordOperation::RemoveRecord { record } => {
                self.remove_record(record).await.map(|_| ())
            }
            RecordOperation::ReplaceKey { record, key, value } => {
                self.replace_key(record, key, value).await
            }
            RecordOperation::ReplaceAttribute {
                record,
                attribute,
                value,
            } => self.replace_attribute(record, attribute, value.clone()).await,
            RecordOperation::AddToRelatedRecords {
                record,
                relationship,
                related_record,
            } => {
                self.add_to_related_records(record, relationship, related_record)
                    .await
            }
            RecordOperation::RemoveFromRelatedRecords {
                record,
                relationship,
                related_record,
            } => {
                self.remove_from_related_records(record, relationship, related_record)
                    .await
            }
            RecordOperation::ReplaceRelatedRecords {
                record,
                relationship,
                related_records,
            } => {
                self.replace_related_records(record, relationship, related_records.clone())
                    .await
            }
            RecordOperation::ReplaceRelatedRecord {
                record,
                relationship,
                related_record,
            } => {
                self.replace_related_record(record, relationship, related_record.clone())
                    .await
            }
        }
    }

    /// Execute one query from the request layer
    pub async fn query(&self, query: &RecordQuery) -> Result<QueryResult> {
        match query {
            RecordQuery::FindRecord { record } => {
                Ok(QueryResult::Record(self.get_record(record).await?))
            }
            RecordQuery::FindRecords {
                records: Some(identities),
                ..
            } => Ok(QueryResult::Records(
                self.get_records_by_identity(identities).await?,
            )),
            RecordQuery::FindRecords {
                model: Some(model), ..
            } => Ok(QueryResult::Records(self.get_records(model).await?)),
            RecordQuery::FindRecords { .. } => Ok(QueryResult::Records(self.all_records().await?)),
        }
    }

    /// The shared connection, opening the database if necessary
    pub async fn connection(&self) -> Result<SharedConnection> {
        self.db.open().await
    }

    fn require_cardinality(
        &self,
        identity: &RecordIdentity,
        relationship: &str,
        expected: Cardinality,
    ) -> Result<()> {
        let def = self.schema.relationship(&identity.model, relationship)?;
        if def.cardinality == expected {
            Ok(())
        } else {
            Err(Error::CardinalityMismatch {
                model: identity.model.clone(),
                relationship: relationship.to_string(),
                declared: def.cardinality,
            })
        }
    }
}

/// Decode one record: blob columns plus its relationship edges, presented as
/// one logical entity.
fn read_record(
    conn: &Connection,
    schema: &Schema,
    identity: &RecordIdentity,
) -> Result<Option<Record>> {
    let table = schema.table(&identity.model)?;
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            &format!(r#"SELECT attributes, "keys" FROM {} WHERE id = ?1"#, table.sql()),
            params![identity.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((attributes, keys)) = row else {
        return Ok(None);
    };

    let mut record = Record::new(identity.model.clone(), identity.id.clone());
    record.attributes = codec::decode_attributes(attributes.as_deref(), identity);
    record.keys = codec::decode_keys(keys.as_deref(), identity);
    record.relationships = edges::relationships_for(conn, schema, identity)?;
    Ok(Some(record))
}

fn read_model(conn: &Connection, schema: &Schema, model: &str) -> Result<Vec<Record>> {
    let table = schema.table(model)?;
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(&format!("SELECT id FROM {} ORDER BY id", table.sql()))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let identity = RecordIdentity::new(model, id);
        if let Some(record) = read_record(conn, schema, &identity)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn upsert_record(conn: &Connection, schema: &Schema, record: &Record) -> Result<()> {
    let table = schema.table(record.model())?;
    let exists: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", table.sql()),
            params![record.id()],
            |row| row.get(0),
        )
        .optional()?;

    let attributes = codec::encode_attributes(&record.attributes);
    let keys = codec::encode_keys(&record.keys);
    if exists.is_some() {
        if attributes.is_some() {
            conn.execute(
                &format!("UPDATE {} SET attributes = ?1 WHERE id = ?2", table.sql()),
                params![attributes, record.id()],
            )?;
        }
        if keys.is_some() {
            conn.execute(
                &format!(r#"UPDATE {} SET "keys" = ?1 WHERE id = ?2"#, table.sql()),
                params![keys, record.id()],
            )?;
        }
    } else {
        conn.execute(
            &format!(
                r#"INSERT INTO {} (id, attributes, "keys") VALUES (?1, ?2, ?3)"#,
                table.sql()
            ),
            params![record.id(), attributes, keys],
        )?;
    }

    if !record.relationships.is_empty() {
        edges::replace_all(conn, schema, record)?;
    }
    Ok(())
}

fn delete_record(
    conn: &Connection,
    schema: &Schema,
    identity: &RecordIdentity,
) -> Result<Option<Record>> {
    let prior = read_record(conn, schema, identity)?;
    if prior.is_some() {
        let table = schema.table(&identity.model)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", table.sql()),
            params![identity.id],
        )?;
        edges::remove_source(conn, identity)?;
    }
    Ok(prior)
}

/// Materialize a bare row so a patch against a record with no prior state
/// still becomes visible to later reads
fn ensure_row(conn: &Connection, schema: &Schema, identity: &RecordIdentity) -> Result<()> {
    let table = schema.table(&identity.model)?;
    conn.execute(
        &format!("INSERT OR IGNORE INTO {} (id) VALUES (?1)", table.sql()),
        params![identity.id],
    )?;
    Ok(())
}
