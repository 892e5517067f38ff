//! Storage layer - physical mapping of records and edges to SQLite
//!
//! - `ddl`: compiles the schema registry into table creation statements
//! - `codec`: attribute/key blob encoding
//! - `edges`: relationship-edge reads, writes, and diffs
//! - `migrate`: internal-format and user-schema-version migrations

pub mod codec;
pub mod ddl;
pub mod edges;
pub mod migrate;

pub use edges::{InverseRelationship, RelationshipEdge};
pub use migrate::{SchemaVersionHook, VersionChange, CURRENT_INTERNAL_VERSION};
