//! DDL compiler - physical table definitions
//!
//! The physical layout is bit-exact and stable across library versions:
//! two single-row version tables, one shared relationship-edge table, and one
//! table per declared model with `id` plus two opaque blob columns. No
//! per-attribute columns exist, so adding an attribute to the schema never
//! requires a DDL change.

use crate::schema::{Schema, TableHandle};

/// Name of the user schema version table
pub const VERSION_TABLE: &str = "__VERSION__";

/// Name of the internal physical-format version table
pub const INTERNAL_VERSION_TABLE: &str = "__INTERNAL_VERSION__";

/// Name of the shared relationship-edge table
pub const EDGE_TABLE: &str = "__RELATIONSHIPS__";

/// SQL to create the user schema version table
pub const CREATE_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "__VERSION__" (
    version NUMERIC
)
"#;

/// SQL to create the internal format version table
pub const CREATE_INTERNAL_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "__INTERNAL_VERSION__" (
    version NUMERIC
)
"#;

/// SQL to create the shared relationship-edge table.
///
/// `target_id`/`target_table` are both NULL for an explicitly empty
/// cardinality-one relationship. The composite key spans all five columns.
pub const CREATE_EDGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "__RELATIONSHIPS__" (
    source_id TEXT,
    source_table TEXT,
    relation_name TEXT,
    target_id TEXT,
    target_table TEXT,
    PRIMARY KEY(source_id, source_table, relation_name, target_id, target_table)
)
"#;

/// SQL to create the record table backing one model
pub fn create_record_table(table: &TableHandle) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
    id TEXT PRIMARY KEY,
    attributes TEXT,
    "keys" TEXT
)"#,
        table.sql()
    )
}

/// All creation statements for a fresh database, version tables first.
///
/// Runs inside the same transaction that writes the initial version rows.
pub fn creation_statements(schema: &Schema) -> Vec<String> {
    let mut stmts = vec![
        CREATE_VERSION_TABLE.to_string(),
        CREATE_INTERNAL_VERSION_TABLE.to_string(),
        CREATE_EDGE_TABLE.to_string(),
    ];
    for model in schema.models() {
        if let Ok(table) = schema.table(model) {
            stmts.push(create_record_table(table));
        }
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::solar_system;

    #[test]
    fn test_creation_statements_cover_all_tables() {
        let schema = solar_system();
        let stmts = creation_statements(&schema);

        // 3 fixed tables + one per model
        assert_eq!(stmts.len(), 3 + schema.models().count());
        assert!(stmts[0].contains(VERSION_TABLE));
        assert!(stmts[1].contains(INTERNAL_VERSION_TABLE));
        assert!(stmts[2].contains(EDGE_TABLE));
        assert!(stmts.iter().any(|s| s.contains("\"planet\"")));
    }

    #[test]
    fn test_statements_execute_on_fresh_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        for stmt in creation_statements(&solar_system()) {
            conn.execute(&stmt, []).unwrap();
        }
        // idempotent: IF NOT EXISTS makes a second pass a no-op
        for stmt in creation_statements(&solar_system()) {
            conn.execute(&stmt, []).unwrap();
        }
    }
}
