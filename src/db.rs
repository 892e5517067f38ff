//! Database lifecycle manager - single-flight open, close, reopen, delete
//!
//! One physical connection, no pool. Concurrent `open()` callers never race a
//! second physical open: the first caller becomes the opener, later callers
//! wait on a watch channel and resolve to the same shared connection instance.
//! `open()` runs schema creation (fresh store) or the migration engine
//! (existing store) before publishing the connection.

use crate::schema::Schema;
use crate::storage::migrate::{self, SchemaVersionHook};
use crate::storage::{CURRENT_INTERNAL_VERSION, ddl};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, watch};

/// The single shared connection handle published by a successful open.
///
/// Callers lock it for the duration of one logical operation; everything
/// downstream of `open()` assumes exclusive, sequential access.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Where the database lives
#[derive(Debug, Clone)]
enum Location {
    Memory,
    File(PathBuf),
}

#[derive(Default)]
struct Inner {
    conn: Option<SharedConnection>,
    /// Present while a physical open is in flight; waiters clone this
    /// receiver and re-check after it fires
    pending: Option<watch::Receiver<bool>>,
}

/// Owns the connection lifecycle for one database
pub struct Database {
    schema: Arc<Schema>,
    location: Location,
    hook: SchemaVersionHook,
    inner: Mutex<Inner>,
    physical_opens: AtomicUsize,
}

impl Database {
    /// Database backed by a file on disk (created on first open)
    pub fn at_path(schema: Arc<Schema>, path: impl Into<PathBuf>) -> Self {
        Self::new(schema, Location::File(path.into()))
    }

    /// In-memory database (for testing); `delete()` reduces to `close()`
    pub fn in_memory(schema: Arc<Schema>) -> Self {
        Self::new(schema, Location::Memory)
    }

    fn new(schema: Arc<Schema>, location: Location) -> Self {
        Self {
            schema,
            location,
            hook: migrate::default_version_hook(),
            inner: Mutex::new(Inner::default()),
            physical_opens: AtomicUsize::new(0),
        }
    }

    /// Install the hook invoked on a user schema version mismatch
    pub fn with_version_hook(mut self, hook: SchemaVersionHook) -> Self {
        self.hook = hook;
        self
    }

    /// The schema this database was built against
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Open the database, creating or migrating its physical storage.
    ///
    /// Idempotent and safe under concurrent callers: exactly one physical
    /// open happens per open/close cycle, and every caller resolves to the
    /// same connection instance.
    pub async fn open(&self) -> Result<SharedConnection> {
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(conn) = &inner.conn {
                return Ok(conn.clone());
            }
            if let Some(rx) = &inner.pending {
                let mut rx = rx.clone();
                drop(inner);
                // wait for the in-flight open, then re-check: it may have failed
                let _ = rx.changed().await;
                continue;
            }

            // this caller becomes the opener
            let (tx, rx) = watch::channel(false);
            inner.pending = Some(rx);
            drop(inner);

            let result = self.physical_open();

            let mut inner = self.inner.lock().await;
            inner.pending = None;
            match result {
                Ok(conn) => {
                    let shared: SharedConnection = Arc::new(Mutex::new(conn));
                    inner.conn = Some(shared.clone());
                    drop(inner);
                    let _ = tx.send(true);
                    return Ok(shared);
                }
                Err(e) => {
                    drop(inner);
                    let _ = tx.send(true);
                    return Err(e);
                }
            }
        }
    }

    /// Close the database, dropping the shared connection handle.
    ///
    /// Waits out any in-flight open first so the state machine never skips
    /// from Opening back to Closed underneath the opener.
    pub async fn close(&self) {
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(rx) = &inner.pending {
                let mut rx = rx.clone();
                drop(inner);
                let _ = rx.changed().await;
                continue;
            }
            inner.conn = None;
            return;
        }
    }

    /// Close, then open again
    pub async fn reopen(&self) -> Result<SharedConnection> {
        self.close().await;
        self.open().await
    }

    /// Close, then destroy all physical storage (the database file and its
    /// WAL/SHM siblings). Not transactional with respect to concurrent
    /// callers; callers must ensure no concurrent access.
    pub async fn delete(&self) -> Result<()> {
        self.close().await;
        if let Location::File(path) = &self.location {
            remove_if_present(path)?;
            remove_if_present(&sibling(path, "-wal"))?;
            remove_if_present(&sibling(path, "-shm"))?;
        }
        Ok(())
    }

    /// Whether a connection is currently published
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.conn.is_some()
    }

    fn physical_open(&self) -> Result<Connection> {
        self.physical_opens.fetch_add(1, Ordering::SeqCst);
        let mut conn = match &self.location {
            Location::Memory => Connection::open_in_memory()?,
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Connection::open(path)?
            }
        };
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        if is_initialized(&conn)? {
            migrate::run(&mut conn, &self.schema, &self.hook)?;
        } else {
            self.create_schema(&mut conn)?;
        }
        Ok(conn)
    }

    /// First-run creation path: all DDL plus the initial version rows, one
    /// transaction.
    fn create_schema(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn.transaction()?;
        for stmt in ddl::creation_statements(&self.schema) {
            tx.execute(&stmt, [])?;
        }
        tx.execute(
            r#"INSERT INTO "__VERSION__" (version) VALUES (?1)"#,
            params![self.schema.version()],
        )?;
        tx.execute(
            r#"INSERT INTO "__INTERNAL_VERSION__" (version) VALUES (?1)"#,
            params![CURRENT_INTERNAL_VERSION],
        )?;
        tx.commit()?;
        tracing::info!(
            "Created database schema at user version {} (format {})",
            self.schema.version(),
            CURRENT_INTERNAL_VERSION
        );
        Ok(())
    }

    #[cfg(test)]
    fn times_physically_opened(&self) -> usize {
        self.physical_opens.load(Ordering::SeqCst)
    }
}

/// A database is initialized once a user version row exists; a store with no
/// version row at all takes the creation path instead of migration.
fn is_initialized(conn: &Connection) -> Result<bool> {
    let table: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [ddl::VERSION_TABLE],
            |row| row.get(0),
        )
        .optional()?;
    if table.is_none() {
        return Ok(false);
    }
    let row: Option<i64> = conn
        .query_row(r#"SELECT version FROM "__VERSION__""#, [], |row| row.get(0))
        .optional()?;
    Ok(row.is_some())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> std::result::Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::solar_system;
    use crate::storage::migrate;

    fn database() -> Arc<Database> {
        Arc::new(Database::in_memory(Arc::new(solar_system())))
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let db = database();
        let first = db.open().await.unwrap();
        let second = db.open().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(db.times_physically_opened(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_opens_are_single_flight() {
        let db = database();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move { db.open().await.unwrap() }));
        }
        let mut connections = Vec::new();
        for handle in handles {
            connections.push(handle.await.unwrap());
        }
        for conn in &connections {
            assert!(Arc::ptr_eq(conn, &connections[0]));
        }
        assert_eq!(db.times_physically_opened(), 1);
    }

    #[tokio::test]
    async fn test_close_and_reopen_cycle() {
        let db = database();
        let first = db.open().await.unwrap();
        assert!(db.is_open().await);

        db.close().await;
        assert!(!db.is_open().await);

        let second = db.open().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(db.times_physically_opened(), 2);
    }

    #[tokio::test]
    async fn test_fresh_store_gets_version_rows() {
        let db = database();
        let conn = db.open().await.unwrap();
        let guard = conn.lock().await;
        assert_eq!(migrate::stored_schema_version(&guard).unwrap(), 1);
        assert_eq!(
            migrate::stored_internal_version(&guard).unwrap(),
            CURRENT_INTERNAL_VERSION
        );
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let schema = Arc::new(solar_system());

        let db = Database::at_path(schema.clone(), &path);
        let conn = db.open().await.unwrap();
        {
            let guard = conn.lock().await;
            guard
                .execute(
                    r#"INSERT INTO "planet" (id, attributes) VALUES ('jupiter', NULL)"#,
                    [],
                )
                .unwrap();
        }
        db.close().await;
        assert!(path.exists());

        // reopen sees the same rows
        let conn = db.open().await.unwrap();
        {
            let guard = conn.lock().await;
            let count: i64 = guard
                .query_row(r#"SELECT COUNT(*) FROM "planet""#, [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 1);
        }

        // delete destroys the physical store entirely
        db.delete().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_existing_store_runs_migration_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        // build a format-1 store on disk
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE "__VERSION__" (version NUMERIC);
                INSERT INTO "__VERSION__" (version) VALUES (1);
                CREATE TABLE "__INTERNAL_VERSION__" (version NUMERIC);
                INSERT INTO "__INTERNAL_VERSION__" (version) VALUES (1);
                CREATE TABLE "planet" (id TEXT PRIMARY KEY, "name" TEXT, "order" NUMERIC, "inhabited" INTEGER);
                INSERT INTO "planet" VALUES ('jupiter', 'Jupiter', 5, 0);
                CREATE TABLE "moon" (id TEXT PRIMARY KEY, "name" TEXT);
                CREATE TABLE "star" (id TEXT PRIMARY KEY, "name" TEXT);
                "#,
            )
            .unwrap();
        }

        let db = Database::at_path(Arc::new(solar_system()), &path);
        let conn = db.open().await.unwrap();
        let guard = conn.lock().await;
        assert_eq!(
            migrate::stored_internal_version(&guard).unwrap(),
            CURRENT_INTERNAL_VERSION
        );
        let blob: Option<String> = guard
            .query_row(r#"SELECT attributes FROM "planet" WHERE id = 'jupiter'"#, [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(blob.unwrap().contains("Jupiter"));
    }
}
