//! Schema registry - declarative description of models and relationships
//!
//! The schema is supplied externally (code or TOML) and is read-only during
//! normal operation. Each model maps 1:1 to a physical table; all table access
//! goes through a `TableHandle` lookup built once at schema load time instead
//! of formatting table names ad hoc at call sites.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Scalar kind of a declared attribute.
///
/// Kinds are schema metadata only - stored attribute blobs are opaque JSON.
/// They matter physically just for the legacy column-per-attribute formats
/// handled by the migration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    String,
    Number,
    Boolean,
}

impl AttributeKind {
    /// Get the string representation of the attribute kind
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::String => "string",
            AttributeKind::Number => "number",
            AttributeKind::Boolean => "boolean",
        }
    }

    /// SQLite column type used by the legacy typed-column format
    pub fn column_type(&self) -> &'static str {
        match self {
            AttributeKind::String => "TEXT",
            AttributeKind::Number => "NUMERIC",
            AttributeKind::Boolean => "INTEGER",
        }
    }
}

impl FromStr for AttributeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(AttributeKind::String),
            "number" | "num" | "float" | "int" => Ok(AttributeKind::Number),
            "boolean" | "bool" => Ok(AttributeKind::Boolean),
            _ => Err(Error::InvalidModelName(format!("Unknown attribute kind: {}", s))),
        }
    }
}

impl std::fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cardinality of a relationship: a single optional target or a set of targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// Single optional target (`None` means explicitly empty)
    One,
    /// Unordered set of targets
    Many,
}

impl Cardinality {
    /// Get the string representation of the cardinality
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::One => "one",
            Cardinality::Many => "many",
        }
    }
}

impl FromStr for Cardinality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "one" | "hasone" => Ok(Cardinality::One),
            "many" | "hasmany" => Ok(Cardinality::Many),
            _ => Err(Error::InvalidModelName(format!("Unknown cardinality: {}", s))),
        }
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared relationship: cardinality, target model, optional inverse name
/// on the target model.
///
/// Relationship identity is `(source model, relationship name)` - several
/// relationships may point at the same target model (self-references,
/// previous/next pointers), which the shared edge table handles natively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub cardinality: Cardinality,
    /// Target model name
    pub model: String,
    /// Name of the inverse relationship on the target model, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
}

/// One declared model: attribute kinds plus relationship definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipDef>,
}

impl Model {
    /// Create a new empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.insert(name.into(), kind);
        self
    }

    /// Declare a cardinality-one relationship
    pub fn with_one(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: Option<&str>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipDef {
                cardinality: Cardinality::One,
                model: target.into(),
                inverse: inverse.map(str::to_string),
            },
        );
        self
    }

    /// Declare a cardinality-many relationship
    pub fn with_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: Option<&str>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipDef {
                cardinality: Cardinality::Many,
                model: target.into(),
                inverse: inverse.map(str::to_string),
            },
        );
        self
    }
}

/// Handle to the physical table backing one model.
///
/// Built once when the schema is loaded; every SQL statement that touches a
/// record table interpolates `handle.sql()` rather than a raw model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    name: String,
    quoted: String,
}

impl TableHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quoted: format!("\"{}\"", name),
        }
    }

    /// Bare table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted form for interpolation into SQL text
    pub fn sql(&self) -> &str {
        &self.quoted
    }
}

/// The schema registry: a user version number plus the set of declared models.
///
/// Loadable from TOML (`serde`); validation runs on construction so invalid
/// names or dangling relationship targets never reach SQL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SchemaDef", into = "SchemaDef")]
pub struct Schema {
    version: i64,
    models: BTreeMap<String, Model>,
    tables: BTreeMap<String, TableHandle>,
}

/// Raw serialized shape of a schema (version + models, no derived state)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaDef {
    version: i64,
    #[serde(default)]
    models: BTreeMap<String, Model>,
}

impl TryFrom<SchemaDef> for Schema {
    type Error = Error;

    fn try_from(def: SchemaDef) -> Result<Self> {
        Schema::new(def.version, def.models)
    }
}

impl From<Schema> for SchemaDef {
    fn from(schema: Schema) -> Self {
        SchemaDef {
            version: schema.version,
            models: schema.models,
        }
    }
}

impl Schema {
    /// Create a schema from declared models, validating names and
    /// relationship targets, and building the model -> table lookup.
    pub fn new(version: i64, models: BTreeMap<String, Model>) -> Result<Self> {
        for (name, model) in &models {
            validate_identifier(name)?;
            for attribute in model.attributes.keys() {
                validate_identifier(attribute)?;
            }
            for (rel_name, def) in &model.relationships {
                validate_identifier(rel_name)?;
                if !models.contains_key(&def.model) {
                    return Err(Error::UnknownModel(format!(
                        "{}.{} targets undeclared model '{}'",
                        name, rel_name, def.model
                    )));
                }
            }
        }

        let tables = models
            .keys()
            .map(|name| (name.clone(), TableHandle::new(name)))
            .collect();

        Ok(Self {
            version,
            models,
            tables,
        })
    }

    /// Start building a schema with the given user version
    pub fn builder(version: i64) -> SchemaBuilder {
        SchemaBuilder {
            version,
            models: BTreeMap::new(),
        }
    }

    /// User schema version
    pub fn version(&self) -> i64 {
        self.version
    }

    /// All declared model names, in deterministic order
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Look up a model definition
    pub fn model(&self, name: &str) -> Result<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| Error::UnknownModel(name.to_string()))
    }

    /// Look up the table handle for a model
    pub fn table(&self, model: &str) -> Result<&TableHandle> {
        self.tables
            .get(model)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))
    }

    /// Look up one relationship definition
    pub fn relationship(&self, model: &str, name: &str) -> Result<&RelationshipDef> {
        self.model(model)?
            .relationships
            .get(name)
            .ok_or_else(|| Error::UnknownRelationship {
                model: model.to_string(),
                relationship: name.to_string(),
            })
    }

    /// Look up a relationship's cardinality, if it is declared
    pub fn cardinality(&self, model: &str, name: &str) -> Option<Cardinality> {
        self.models
            .get(model)
            .and_then(|m| m.relationships.get(name))
            .map(|def| def.cardinality)
    }
}

/// Builder for assembling a schema model by model
pub struct SchemaBuilder {
    version: i64,
    models: BTreeMap<String, Model>,
}

impl SchemaBuilder {
    /// Add a model definition
    pub fn model(mut self, name: impl Into<String>, model: Model) -> Self {
        self.models.insert(name.into(), model);
        self
    }

    /// Validate and build the schema
    pub fn build(self) -> Result<Schema> {
        Schema::new(self.version, self.models)
    }
}

/// Model, attribute, and relationship names become SQL identifiers under one
/// physical format or another, so they are restricted to the identifier charset.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::InvalidModelName(name.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Solar-system schema shared by storage and cache tests
    pub(crate) fn solar_system() -> Schema {
        Schema::builder(1)
            .model(
                "planet",
                Model::new()
                    .with_attribute("name", AttributeKind::String)
                    .with_attribute("order", AttributeKind::Number)
                    .with_attribute("inhabited", AttributeKind::Boolean)
                    .with_many("moons", "moon", Some("planet"))
                    .with_one("star", "star", Some("planets"))
                    .with_one("previous", "planet", Some("next"))
                    .with_one("next", "planet", Some("previous")),
            )
            .model(
                "moon",
                Model::new()
                    .with_attribute("name", AttributeKind::String)
                    .with_one("planet", "planet", Some("moons")),
            )
            .model(
                "star",
                Model::new()
                    .with_attribute("name", AttributeKind::String)
                    .with_many("planets", "planet", Some("star")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_cardinality_roundtrip() {
        for cardinality in [Cardinality::One, Cardinality::Many] {
            let parsed: Cardinality = cardinality.as_str().parse().unwrap();
            assert_eq!(cardinality, parsed);
        }
    }

    #[test]
    fn test_attribute_kind_aliases() {
        assert_eq!(AttributeKind::from_str("text").unwrap(), AttributeKind::String);
        assert_eq!(AttributeKind::from_str("int").unwrap(), AttributeKind::Number);
        assert_eq!(AttributeKind::from_str("bool").unwrap(), AttributeKind::Boolean);
    }

    #[test]
    fn test_schema_lookup() {
        let schema = solar_system();
        assert_eq!(schema.version(), 1);
        assert_eq!(schema.models().count(), 3);
        assert_eq!(schema.table("planet").unwrap().sql(), "\"planet\"");
        assert_eq!(
            schema.relationship("planet", "moons").unwrap().cardinality,
            Cardinality::Many
        );
        assert!(schema.model("asteroid").is_err());
        assert!(schema.relationship("planet", "rings").is_err());
    }

    #[test]
    fn test_self_referencing_relationships() {
        // previous/next both target planet; relationship identity is
        // (model, name), not the type pair
        let schema = solar_system();
        assert_eq!(schema.relationship("planet", "previous").unwrap().model, "planet");
        assert_eq!(schema.relationship("planet", "next").unwrap().model, "planet");
    }

    #[test]
    fn test_invalid_model_name_rejected() {
        let result = Schema::builder(1)
            .model("bad name; drop", Model::new())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_dangling_relationship_target_rejected() {
        let result = Schema::builder(1)
            .model("planet", Model::new().with_many("moons", "moon", None))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_toml_roundtrip() {
        let toml_src = r#"
            version = 3

            [models.planet.attributes]
            name = "string"

            [models.planet.relationships.moons]
            cardinality = "many"
            model = "moon"
            inverse = "planet"

            [models.moon.attributes]
            name = "string"

            [models.moon.relationships.planet]
            cardinality = "one"
            model = "planet"
            inverse = "moons"
        "#;

        let schema: Schema = toml::from_str(toml_src).unwrap();
        assert_eq!(schema.version(), 3);
        assert_eq!(
            schema.relationship("moon", "planet").unwrap().cardinality,
            Cardinality::One
        );
    }
}
