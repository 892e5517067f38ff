use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    pub database: Option<String>,
    pub schema: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("recordcache.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<CacheConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: CacheConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &CacheConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Load a schema registry from its TOML definition file
pub fn load_schema(path: &Path) -> anyhow::Result<Schema> {
    let contents = std::fs::read_to_string(path)?;
    let schema: Schema = toml::from_str(&contents)?;
    Ok(schema)
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_schema_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.toml");
        std::fs::write(
            &path,
            r#"
            version = 2

            [models.planet.attributes]
            name = "string"
            "#,
        )
        .unwrap();

        let schema = load_schema(&path).unwrap();
        assert_eq!(schema.version(), 2);
        assert!(schema.model("planet").is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recordcache.toml");
        let config = CacheConfig {
            database: Some("cache.db".to_string()),
            schema: Some("schema.toml".to_string()),
        };

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.database.as_deref(), Some("cache.db"));
    }
}
