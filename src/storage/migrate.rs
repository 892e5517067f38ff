//! Migration engine - two independent version axes reconciled on every open
//!
//! **Internal format version**: this library's own physical layout. Upgrades
//! are an ordered list of composable steps, each one transaction that rewrites
//! data under the new layout and bumps `__INTERNAL_VERSION__`. Format history:
//!
//! - 0: one TEXT column per attribute on each record table, cardinality-one
//!   relationships inlined as a column holding the target id, cardinality-many
//!   in per-type-pair tables, no `__INTERNAL_VERSION__` table
//! - 1: typed per-attribute columns, all relationships in per-type-pair tables
//!   `relationships_{source}_{target}(source_id, relation_name, target_id)`
//! - 2 (current): opaque attribute/key blobs plus the shared `__RELATIONSHIPS__`
//!   edge table
//!
//! **User schema version**: owned by the collaborator that understands schema
//! semantics. On mismatch an injected hook runs inside the transaction that
//! bumps `__VERSION__`; the default hook only reports the mismatch.

use crate::schema::{AttributeKind, Cardinality, Schema};
use crate::storage::{codec, ddl};
use crate::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Internal physical-format version written by this build of the library
pub const CURRENT_INTERNAL_VERSION: i64 = 2;

/// A user schema version mismatch observed on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    pub old: i64,
    pub new: i64,
}

/// Hook invoked when the stored user schema version differs from the
/// requested one. Runs inside the transaction that bumps `__VERSION__`;
/// returning an error rolls both back and fails the open.
pub type SchemaVersionHook = Arc<dyn Fn(&Connection, VersionChange) -> Result<()> + Send + Sync>;

/// Default hook: report the mismatch, change nothing.
///
/// Open proceeds and the version row is still bumped, knowingly leaving the
/// stored records unchanged under the new schema version.
pub fn default_version_hook() -> SchemaVersionHook {
    Arc::new(|_conn, change| {
        tracing::error!(
            "Schema version changed from {} to {} with no migration hook installed; \
             stored records were not rewritten",
            change.old,
            change.new
        );
        Ok(())
    })
}

struct FormatStep {
    from: i64,
    apply: fn(&Transaction<'_>, &Schema) -> Result<()>,
}

/// Ordered upgrade steps. Upgrading across several formats applies each step
/// in sequence; there are no shortcut paths.
const FORMAT_STEPS: &[FormatStep] = &[
    FormatStep {
        from: 0,
        apply: upgrade_v0_to_v1,
    },
    FormatStep {
        from: 1,
        apply: upgrade_v1_to_v2,
    },
];

/// Reconcile both version axes against an existing database
pub fn run(conn: &mut Connection, schema: &Schema, hook: &SchemaVersionHook) -> Result<()> {
    upgrade_internal_format(conn, schema)?;
    reconcile_schema_version(conn, schema, hook)
}

fn upgrade_internal_format(conn: &mut Connection, schema: &Schema) -> Result<()> {
    let mut version = stored_internal_version(conn)?;
    if version > CURRENT_INTERNAL_VERSION {
        return Err(Error::Migration(format!(
            "stored format version {} is newer than supported version {}",
            version, CURRENT_INTERNAL_VERSION
        )));
    }

    for step in FORMAT_STEPS {
        if version != step.from {
            continue;
        }
        let tx = conn.transaction()?;
        (step.apply)(&tx, schema)?;
        write_internal_version(&tx, step.from + 1)?;
        tx.commit()?;
        version = step.from + 1;
        tracing::info!("Upgraded internal storage format to version {}", version);
    }
    Ok(())
}

fn reconcile_schema_version(
    conn: &mut Connection,
    schema: &Schema,
    hook: &SchemaVersionHook,
) -> Result<()> {
    let stored = stored_schema_version(conn)?;
    if stored == schema.version() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    let change = VersionChange {
        old: stored,
        new: schema.version(),
    };
    {
        let conn_ref: &Connection = &tx;
        hook(conn_ref, change)?;
    }
    tx.execute(ddl::CREATE_VERSION_TABLE, [])?;
    tx.execute(r#"DELETE FROM "__VERSION__""#, [])?;
    tx.execute(
        r#"INSERT INTO "__VERSION__" (version) VALUES (?1)"#,
        params![schema.version()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Stored internal format version; a database that predates the
/// `__INTERNAL_VERSION__` table is format 0.
pub fn stored_internal_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, ddl::INTERNAL_VERSION_TABLE)? {
        return Ok(0);
    }
    let version: Option<i64> = conn
        .query_row(r#"SELECT version FROM "__INTERNAL_VERSION__""#, [], |row| row.get(0))
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Stored user schema version (0 when the table or row is missing)
pub fn stored_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, ddl::VERSION_TABLE)? {
        return Ok(0);
    }
    let version: Option<i64> = conn
        .query_row(r#"SELECT version FROM "__VERSION__""#, [], |row| row.get(0))
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn write_internal_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(ddl::CREATE_INTERNAL_VERSION_TABLE, [])?;
    conn.execute(r#"DELETE FROM "__INTERNAL_VERSION__""#, [])?;
    conn.execute(
        r#"INSERT INTO "__INTERNAL_VERSION__" (version) VALUES (?1)"#,
        params![version],
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_columns(conn: &Connection, name: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(name)))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = BTreeSet::new();
    for row in rows {
        columns.insert(row?);
    }
    Ok(columns)
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

fn pair_table_name(source: &str, target: &str) -> String {
    format!("relationships_{}_{}", source, target)
}

fn create_pair_table(conn: &Connection, source: &str, target: &str) -> Result<()> {
    conn.execute(
        &format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                source_id TEXT,
                relation_name TEXT,
                target_id TEXT,
                PRIMARY KEY(source_id, relation_name, target_id)
            )"#,
            quote(&pair_table_name(source, target))
        ),
        [],
    )?;
    Ok(())
}

/// Format 0 -> 1: retype the all-TEXT attribute columns and move inlined
/// cardinality-one relationship columns into the per-pair tables.
fn upgrade_v0_to_v1(tx: &Transaction<'_>, schema: &Schema) -> Result<()> {
    for model_name in schema.models() {
        let model = schema.model(model_name)?;
        let table = schema.table(model_name)?;
        if !table_exists(tx, table.name())? {
            continue;
        }
        let existing = table_columns(tx, table.name())?;

        let attributes: Vec<(&String, AttributeKind)> = model
            .attributes
            .iter()
            .filter(|(name, _)| existing.contains(*name))
            .map(|(name, kind)| (name, *kind))
            .collect();
        let one_relationships: Vec<(&String, &str)> = model
            .relationships
            .iter()
            .filter(|(name, def)| {
                def.cardinality == Cardinality::One && existing.contains(*name)
            })
            .map(|(name, def)| (name, def.model.as_str()))
            .collect();

        // read everything under the old layout before dropping it
        let mut columns = vec!["id".to_string()];
        columns.extend(attributes.iter().map(|(name, _)| (*name).clone()));
        columns.extend(one_relationships.iter().map(|(name, _)| (*name).clone()));
        let select = format!(
            "SELECT {} FROM {}",
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            table.sql()
        );
        let mut rows: Vec<Vec<SqlValue>> = Vec::new();
        {
            let mut stmt = tx.prepare(&select)?;
            let mapped = stmt.query_map([], |row| {
                (0..columns.len())
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?;
            for row in mapped {
                rows.push(row?);
            }
        }

        tx.execute(&format!("DROP TABLE {}", table.sql()), [])?;
        let typed_columns: Vec<String> = std::iter::once("id TEXT PRIMARY KEY".to_string())
            .chain(
                attributes
                    .iter()
                    .map(|(name, kind)| format!("{} {}", quote(name), kind.column_type())),
            )
            .collect();
        tx.execute(
            &format!("CREATE TABLE {} ({})", table.sql(), typed_columns.join(", ")),
            [],
        )?;

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.sql(),
            columns[..attributes.len() + 1]
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=attributes.len() + 1)
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut insert_stmt = tx.prepare(&insert)?;
        for row in &rows {
            let mut values: Vec<SqlValue> = vec![row[0].clone()];
            for (index, (_, kind)) in attributes.iter().enumerate() {
                values.push(retype_legacy_value(row[index + 1].clone(), *kind));
            }
            insert_stmt.execute(rusqlite::params_from_iter(values))?;
        }

        // inlined one-relationship columns become pair-table rows
        for (index, (rel_name, target_model)) in one_relationships.iter().enumerate() {
            create_pair_table(tx, model_name, target_model)?;
            let pair_insert = format!(
                "INSERT OR IGNORE INTO {} (source_id, relation_name, target_id) VALUES (?1, ?2, ?3)",
                quote(&pair_table_name(model_name, target_model))
            );
            let mut pair_stmt = tx.prepare(&pair_insert)?;
            for row in &rows {
                let target = &row[attributes.len() + 1 + index];
                if let SqlValue::Text(target_id) = target {
                    let SqlValue::Text(source_id) = &row[0] else { continue };
                    pair_stmt.execute(params![source_id, rel_name, target_id])?;
                }
            }
        }
    }
    Ok(())
}

/// Format 1 -> 2: collapse typed attribute columns into one opaque blob per
/// record and consolidate the per-pair relationship tables into the shared
/// edge table.
fn upgrade_v1_to_v2(tx: &Transaction<'_>, schema: &Schema) -> Result<()> {
    for model_name in schema.models() {
        let model = schema.model(model_name)?;
        let table = schema.table(model_name)?;
        if !table_exists(tx, table.name())? {
            // models declared after the database was created
            tx.execute(&ddl::create_record_table(table), [])?;
            continue;
        }
        let existing = table_columns(tx, table.name())?;
        if existing.contains("attributes") {
            continue;
        }

        let attributes: Vec<(&String, AttributeKind)> = model
            .attributes
            .iter()
            .filter(|(name, _)| existing.contains(*name))
            .map(|(name, kind)| (name, *kind))
            .collect();
        let mut columns = vec!["id".to_string()];
        columns.extend(attributes.iter().map(|(name, _)| (*name).clone()));
        let select = format!(
            "SELECT {} FROM {}",
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            table.sql()
        );

        let mut records: Vec<(String, BTreeMap<String, Value>)> = Vec::new();
        {
            let mut stmt = tx.prepare(&select)?;
            let mapped = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let mut values = Vec::with_capacity(attributes.len());
                for i in 0..attributes.len() {
                    values.push(row.get::<_, SqlValue>(i + 1)?);
                }
                Ok((id, values))
            })?;
            for row in mapped {
                let (id, values) = row?;
                let mut map = BTreeMap::new();
                for ((name, kind), value) in attributes.iter().zip(values) {
                    if let Some(json) = sql_value_to_json(value, *kind) {
                        map.insert((*name).clone(), json);
                    }
                }
                records.push((id, map));
            }
        }

        tx.execute(&format!("DROP TABLE {}", table.sql()), [])?;
        tx.execute(&ddl::create_record_table(table), [])?;
        let insert = format!(
            r#"INSERT INTO {} (id, attributes, "keys") VALUES (?1, ?2, NULL)"#,
            table.sql()
        );
        let mut insert_stmt = tx.prepare(&insert)?;
        for (id, map) in &records {
            insert_stmt.execute(params![id, codec::encode_attributes(map)])?;
        }
    }

    // consolidate per-pair relationship tables into the shared edge table
    tx.execute(ddl::CREATE_EDGE_TABLE, [])?;
    let mut pairs: BTreeSet<(String, String)> = BTreeSet::new();
    for model_name in schema.models() {
        for def in schema.model(model_name)?.relationships.values() {
            pairs.insert((model_name.to_string(), def.model.clone()));
        }
    }
    for (source, target) in pairs {
        let pair_table = pair_table_name(&source, &target);
        if !table_exists(tx, &pair_table)? {
            continue;
        }
        let mut edges: Vec<(String, String, Option<String>)> = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT source_id, relation_name, target_id FROM {}",
                quote(&pair_table)
            ))?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get::<_, Option<String>>(2)?))
            })?;
            for row in mapped {
                edges.push(row?);
            }
        }
        let mut insert_stmt = tx.prepare(
            r#"INSERT OR IGNORE INTO "__RELATIONSHIPS__"
               (source_id, source_table, relation_name, target_id, target_table)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )?;
        for (source_id, relation, target_id) in edges {
            let target_table = target_id.as_ref().map(|_| target.as_str());
            insert_stmt.execute(params![source_id, source, relation, target_id, target_table])?;
        }
        tx.execute(&format!("DROP TABLE {}", quote(&pair_table)), [])?;
    }
    Ok(())
}

/// Format 0 stored every attribute as TEXT; coerce toward the declared kind
fn retype_legacy_value(value: SqlValue, kind: AttributeKind) -> SqlValue {
    let SqlValue::Text(text) = value else {
        return value;
    };
    match kind {
        AttributeKind::String => SqlValue::Text(text),
        AttributeKind::Number => {
            if let Ok(int) = text.parse::<i64>() {
                SqlValue::Integer(int)
            } else if let Ok(real) = text.parse::<f64>() {
                SqlValue::Real(real)
            } else {
                SqlValue::Text(text)
            }
        }
        AttributeKind::Boolean => {
            let truthy = matches!(text.as_str(), "true" | "1");
            SqlValue::Integer(i64::from(truthy))
        }
    }
}

/// Convert a typed legacy column value into its blob representation
fn sql_value_to_json(value: SqlValue, kind: AttributeKind) -> Option<Value> {
    match value {
        SqlValue::Null | SqlValue::Blob(_) => None,
        SqlValue::Integer(int) => Some(match kind {
            AttributeKind::Boolean => Value::from(int != 0),
            _ => Value::from(int),
        }),
        SqlValue::Real(real) => Some(Value::from(real)),
        SqlValue::Text(text) => Some(match kind {
            AttributeKind::Number => text
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(text)),
            AttributeKind::Boolean => Value::from(text == "true" || text == "1"),
            AttributeKind::String => Value::from(text),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecordIdentity;
    use crate::schema::tests::solar_system;
    use crate::storage::edges;

    /// Hand-build a format-1 database: typed attribute columns, pair tables,
    /// both version rows present.
    fn format_1_database() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE "__VERSION__" (version NUMERIC);
            INSERT INTO "__VERSION__" (version) VALUES (1);
            CREATE TABLE "__INTERNAL_VERSION__" (version NUMERIC);
            INSERT INTO "__INTERNAL_VERSION__" (version) VALUES (1);
            CREATE TABLE "planet" (
                id TEXT PRIMARY KEY,
                "name" TEXT,
                "order" NUMERIC,
                "inhabited" INTEGER
            );
            INSERT INTO "planet" VALUES ('jupiter', 'Jupiter', 5, 0);
            CREATE TABLE "moon" (id TEXT PRIMARY KEY, "name" TEXT);
            INSERT INTO "moon" VALUES ('europa', 'Europa');
            CREATE TABLE "star" (id TEXT PRIMARY KEY, "name" TEXT);
            CREATE TABLE "relationships_planet_moon" (
                source_id TEXT, relation_name TEXT, target_id TEXT,
                PRIMARY KEY(source_id, relation_name, target_id)
            );
            INSERT INTO "relationships_planet_moon" VALUES ('jupiter', 'moons', 'europa');
            "#,
        )
        .unwrap();
        conn
    }

    /// Hand-build a format-0 database: all-TEXT columns, cardinality-one
    /// relationships inlined, no internal version table.
    fn format_0_database() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE "__VERSION__" (version NUMERIC);
            INSERT INTO "__VERSION__" (version) VALUES (1);
            CREATE TABLE "planet" (
                id TEXT PRIMARY KEY,
                "name" TEXT,
                "order" TEXT,
                "inhabited" TEXT,
                "star" TEXT,
                "previous" TEXT,
                "next" TEXT
            );
            INSERT INTO "planet" VALUES ('jupiter', 'Jupiter', '5', 'false', 'sun', NULL, NULL);
            CREATE TABLE "moon" (id TEXT PRIMARY KEY, "name" TEXT, "planet" TEXT);
            INSERT INTO "moon" VALUES ('europa', 'Europa', 'jupiter');
            CREATE TABLE "star" (id TEXT PRIMARY KEY, "name" TEXT);
            INSERT INTO "star" VALUES ('sun', 'Sun');
            CREATE TABLE "relationships_planet_moon" (
                source_id TEXT, relation_name TEXT, target_id TEXT,
                PRIMARY KEY(source_id, relation_name, target_id)
            );
            INSERT INTO "relationships_planet_moon" VALUES ('jupiter', 'moons', 'europa');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_v1_upgrades_to_v2_without_data_loss() {
        let mut conn = format_1_database();
        let schema = solar_system();
        run(&mut conn, &schema, &default_version_hook()).unwrap();

        assert_eq!(stored_internal_version(&conn).unwrap(), 2);

        let blob: Option<String> = conn
            .query_row(r#"SELECT attributes FROM "planet" WHERE id = 'jupiter'"#, [], |row| {
                row.get(0)
            })
            .unwrap();
        let jupiter = RecordIdentity::new("planet", "jupiter");
        let attributes = codec::decode_attributes(blob.as_deref(), &jupiter);
        assert_eq!(attributes["name"], "Jupiter");
        assert_eq!(attributes["order"], 5);
        assert_eq!(attributes["inhabited"], false);

        // the moons edge survived into the shared edge table
        let europa = RecordIdentity::new("moon", "europa");
        let inverses = edges::inverses_for(&conn, &europa).unwrap();
        assert_eq!(inverses.len(), 1);
        assert_eq!(inverses[0].relation, "moons");
        assert_eq!(inverses[0].source, jupiter);

        // pair table is gone
        assert!(!table_exists(&conn, "relationships_planet_moon").unwrap());
    }

    #[test]
    fn test_v0_composes_through_both_steps() {
        let mut conn = format_0_database();
        let schema = solar_system();
        run(&mut conn, &schema, &default_version_hook()).unwrap();

        assert_eq!(stored_internal_version(&conn).unwrap(), 2);

        let jupiter = RecordIdentity::new("planet", "jupiter");
        let blob: Option<String> = conn
            .query_row(r#"SELECT attributes FROM "planet" WHERE id = 'jupiter'"#, [], |row| {
                row.get(0)
            })
            .unwrap();
        let attributes = codec::decode_attributes(blob.as_deref(), &jupiter);
        // text '5' and 'false' were retyped on the way through format 1
        assert_eq!(attributes["order"], 5);
        assert_eq!(attributes["inhabited"], false);

        // inlined one-relationship columns became edges
        let relationships = edges::relationships_for(&conn, &schema, &jupiter).unwrap();
        assert_eq!(
            relationships["star"],
            crate::record::RelationshipValue::one(RecordIdentity::new("star", "sun"))
        );
        let moon_rels =
            edges::relationships_for(&conn, &schema, &RecordIdentity::new("moon", "europa"))
                .unwrap();
        assert_eq!(
            moon_rels["planet"],
            crate::record::RelationshipValue::one(jupiter)
        );
    }

    #[test]
    fn test_current_format_is_a_noop() {
        let mut conn = format_1_database();
        let schema = solar_system();
        run(&mut conn, &schema, &default_version_hook()).unwrap();
        // second run finds format 2 and changes nothing
        run(&mut conn, &schema, &default_version_hook()).unwrap();
        assert_eq!(stored_internal_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_newer_stored_format_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE "__INTERNAL_VERSION__" (version NUMERIC);
            INSERT INTO "__INTERNAL_VERSION__" (version) VALUES (99);
            "#,
        )
        .unwrap();
        let mut conn = conn;
        let result = run(&mut conn, &solar_system(), &default_version_hook());
        assert!(matches!(result, Err(Error::Migration(_))));
    }

    #[test]
    fn test_schema_version_mismatch_soft_fails_and_bumps() {
        let mut conn = format_1_database();
        let schema = crate::schema::Schema::builder(7)
            .model(
                "planet",
                crate::schema::Model::new()
                    .with_attribute("name", AttributeKind::String)
                    .with_attribute("order", AttributeKind::Number)
                    .with_attribute("inhabited", AttributeKind::Boolean),
            )
            .model("moon", crate::schema::Model::new())
            .model("star", crate::schema::Model::new())
            .build()
            .unwrap();

        // default hook logs and returns Ok, so open proceeds and the row bumps
        run(&mut conn, &schema, &default_version_hook()).unwrap();
        assert_eq!(stored_schema_version(&conn).unwrap(), 7);
    }

    #[test]
    fn test_failing_hook_rolls_back_version_bump() {
        let mut conn = format_1_database();
        let schema = solar_system();
        run(&mut conn, &schema, &default_version_hook()).unwrap();

        let newer = {
            let def: crate::schema::Schema = toml::from_str("version = 2").unwrap();
            def
        };
        let failing: SchemaVersionHook =
            Arc::new(|_, _| Err(Error::Migration("user data rewrite failed".into())));
        let result = run(&mut conn, &newer, &failing);
        assert!(result.is_err());
        assert_eq!(stored_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_hook_receives_old_and_new_versions() {
        let mut conn = format_1_database();
        let schema = solar_system();
        run(&mut conn, &schema, &default_version_hook()).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in_hook = seen.clone();
        let hook: SchemaVersionHook = Arc::new(move |_, change| {
            *seen_in_hook.lock().unwrap() = Some(change);
            Ok(())
        });
        let newer: crate::schema::Schema = toml::from_str("version = 4").unwrap();
        run(&mut conn, &newer, &hook).unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(VersionChange { old: 1, new: 4 }));
        assert_eq!(stored_schema_version(&conn).unwrap(), 4);
    }
}
