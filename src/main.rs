//! Recordcache CLI - inspect and patch a record cache from the command line

use clap::{Parser, Subcommand};
use recordcache::storage::ddl;
use recordcache::{config, RecordCache, RecordIdentity, RecordOperation};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "recordcache")]
#[command(version = "0.1.0")]
#[command(about = "Schema-driven record graph cache backed by embedded SQLite")]
#[command(long_about = r#"
Recordcache persists a graph of typed, schema-described records:
  • One table per model, attributes and keys stored as opaque blobs
  • Relationships in a shared edge table with inverse lookups
  • Automatic internal format migration on open

Example usage:
  recordcache init --schema schema.toml
  recordcache stats
  recordcache get --model planet --id jupiter
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and write a config file pointing at it
    Init {
        /// Path to the schema definition (TOML)
        #[arg(short, long)]
        schema: PathBuf,

        /// Path to the database file
        #[arg(short, long, default_value = "recordcache.db")]
        database: PathBuf,

        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Show record and relationship counts per model
    Stats {
        /// Path to the schema definition (overrides config)
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Path to the database file (overrides config)
        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Fetch one record as JSON
    Get {
        /// Model name
        #[arg(short, long)]
        model: String,

        /// Record id
        #[arg(short, long)]
        id: String,

        #[arg(short, long)]
        schema: Option<PathBuf>,

        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// List all records of a model as JSON
    List {
        /// Model name
        #[arg(short, long)]
        model: String,

        #[arg(short, long)]
        schema: Option<PathBuf>,

        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Remove one record
    Remove {
        /// Model name
        #[arg(short, long)]
        model: String,

        /// Record id
        #[arg(short, long)]
        id: String,

        #[arg(short, long)]
        schema: Option<PathBuf>,

        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Apply a JSON file of operations (a single operation or an array)
    Apply {
        /// Path to the operations file
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        schema: Option<PathBuf>,

        #[arg(short, long)]
        database: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { schema, database, force } => {
            let parsed = config::load_schema(&schema)?;
            config::ensure_db_dir(&database)?;

            let cache = RecordCache::on_disk(parsed, &database);
            cache.open().await?;
            cache.close().await;

            let cfg = config::CacheConfig {
                database: Some(database.display().to_string()),
                schema: Some(schema.display().to_string()),
            };
            let config_path = cli.config.unwrap_or_else(config::default_config_path);
            config::write_config(&config_path, &cfg, force)?;

            println!("✅ Initialized database at {:?}", database);
            println!("📝 Config written to {:?}", config_path);
        }

        Commands::Stats { schema, database } => {
            let cache = open_cache(cli.config.as_deref(), schema, database).await?;
            let conn = cache.connection().await?;
            let guard = conn.lock().await;

            println!("📊 Recordcache Statistics");
            println!("------------------------------------");
            println!("Schema version: {}", cache.schema().version());
            for model in cache.schema().models() {
                let table = cache.schema().table(model)?;
                let count: i64 = guard.query_row(
                    &format!("SELECT COUNT(*) FROM {}", table.sql()),
                    [],
                    |row| row.get(0),
                )?;
                println!("{:<20} {} records", model, count);
            }
            let edges: i64 = guard.query_row(
                &format!(r#"SELECT COUNT(*) FROM "{}""#, ddl::EDGE_TABLE),
                [],
                |row| row.get(0),
            )?;
            println!("{:<20} {} edges", "relationships", edges);
        }

        Commands::Get { model, id, schema, database } => {
            let cache = open_cache(cli.config.as_deref(), schema, database).await?;
            let identity = RecordIdentity::new(&model, &id);
            match cache.get_record(&identity).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("❌ No record {}", identity),
            }
        }

        Commands::List { model, schema, database } => {
            let cache = open_cache(cli.config.as_deref(), schema, database).await?;
            let records = cache.get_records(&model).await?;
            if records.is_empty() {
                println!("∅ No {} records.", model);
            } else {
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
        }

        Commands::Remove { model, id, schema, database } => {
            let cache = open_cache(cli.config.as_deref(), schema, database).await?;
            let identity = RecordIdentity::new(&model, &id);
            match cache.remove_record(&identity).await? {
                Some(_) => println!("🗑️  Removed {}", identity),
                None => println!("∅ No record {}", identity),
            }
        }

        Commands::Apply { file, schema, database } => {
            let cache = open_cache(cli.config.as_deref(), schema, database).await?;
            let contents = std::fs::read_to_string(&file)?;
            let operations: Vec<RecordOperation> = match serde_json::from_str(&contents) {
                Ok(ops) => ops,
                Err(_) => vec![serde_json::from_str(&contents)?],
            };

            for operation in &operations {
                cache.apply(operation).await?;
            }
            println!("✅ Applied {} operation(s)", operations.len());
        }
    }

    Ok(())
}

/// Resolve schema and database paths (flags win over config) and open the cache
async fn open_cache(
    config_path: Option<&Path>,
    schema: Option<PathBuf>,
    database: Option<PathBuf>,
) -> anyhow::Result<RecordCache> {
    let cfg = config::load_config(config_path)?.unwrap_or_default();

    let schema_path = schema
        .or_else(|| cfg.schema.as_ref().map(PathBuf::from))
        .ok_or_else(|| anyhow::anyhow!("no schema given (pass --schema or run `init` first)"))?;
    let database_path = database
        .or_else(|| cfg.database.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("recordcache.db"));

    let parsed = config::load_schema(&schema_path)?;
    let cache = RecordCache::on_disk(parsed, database_path);
    cache.open().await?;
    Ok(cache)
}
