//! # Recordcache - Schema-Driven Record Graph Cache
//!
//! Persists a graph of typed, schema-described records into embedded SQLite
//! and keeps that representation synchronized with patch and query operations
//! issued against an abstract record model.
//!
//! Recordcache provides:
//! - A declarative schema registry (models, attributes, typed relationships)
//! - A DDL compiler: one table per model plus a shared relationship-edge table
//! - Opaque attribute/key blob encoding (no per-attribute columns)
//! - A relationship-edge store with forward and inverse lookups
//! - Single-flight async database initialization under concurrent callers
//! - A two-axis migration engine: user schema version and internal format

pub mod identity;
pub mod record;
pub mod schema;
pub mod operation;
pub mod storage;
pub mod db;
pub mod cache;
pub mod config;

// Re-exports for convenient access
pub use identity::RecordIdentity;
pub use record::{Record, RelationshipValue};
pub use schema::{AttributeKind, Cardinality, Model, RelationshipDef, Schema};
pub use operation::{QueryResult, RecordOperation, RecordQuery};
pub use db::Database;
pub use cache::RecordCache;

/// Result type alias for recordcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for recordcache operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model name: {0}")]
    InvalidModelName(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown relationship: {model}.{relationship}")]
    UnknownRelationship { model: String, relationship: String },

    #[error("Cardinality mismatch: {model}.{relationship} is declared '{declared}'")]
    CardinalityMismatch {
        model: String,
        relationship: String,
        declared: crate::schema::Cardinality,
    },

    #[error("Migration error: {0}")]
    Migration(String),
}
