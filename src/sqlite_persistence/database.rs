//! The ledger database handle: one write connection, one read-only connection.

use super::{VersionedSchema, BASE_DB_VERSION};
use crate::schema::LEDGER_VERSIONED_SCHEMAS;
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Shared handle to the ledger SQLite file.
///
/// Writes are serialized through a single connection behind a mutex. Reads go
/// through a separate read-only connection so that WAL readers never wait on
/// a long-running chunk transaction. Clones share the same connections.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
    read_conn: SharedConnection,
    write_conn: SharedConnection,
}

fn migrate_if_needed(conn: &mut Connection, schemas: &[VersionedSchema]) -> Result<()> {
    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    let latest_version = schemas.len() - 1;
    let latest_schema = &schemas[latest_version];

    let table_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if table_count == 0 {
        info!("Creating ledger db schema at version {}", latest_version);
        latest_schema.create(conn)?;
        return Ok(());
    }

    if db_version < BASE_DB_VERSION as i64 {
        bail!(
            "Database has user_version {} and was not created by this tool",
            db_version
        );
    }
    let mut current_version = (db_version - BASE_DB_VERSION as i64) as usize;
    if current_version > latest_version {
        bail!(
            "Database schema version {} is newer than the latest known version {}",
            current_version,
            latest_version
        );
    }

    if current_version < latest_version {
        let tx = conn.transaction()?;
        for schema in schemas.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!(
                    "Migrating ledger db from version {} to {}",
                    current_version, schema.version
                );
                migration_fn(&tx)?;
            }
            current_version = schema.version;
        }
        tx.pragma_update(None, "user_version", BASE_DB_VERSION + current_version)?;
        tx.commit()?;
    }

    latest_schema
        .validate(conn)
        .context("Ledger db schema validation failed")?;
    Ok(())
}

impl Database {
    /// Opens (creating if needed) the ledger database at `db_path` and brings
    /// its schema up to the latest version.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::open_with_schemas(db_path, LEDGER_VERSIONED_SCHEMAS)
    }

    fn open_with_schemas<P: AsRef<Path>>(
        db_path: P,
        schemas: &[VersionedSchema],
    ) -> Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut write_conn = Connection::open_with_flags(
            db_path_ref,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open ledger database {:?}", db_path_ref))?;

        write_conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on ledger write connection")?;
        write_conn
            .pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        write_conn.busy_timeout(Duration::from_secs(5))?;

        migrate_if_needed(&mut write_conn, schemas)?;

        let read_conn = Connection::open_with_flags(
            db_path_ref,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open ledger database for reading")?;
        read_conn.busy_timeout(Duration::from_secs(5))?;

        debug!("Opened ledger database {:?}", db_path_ref);
        Ok(Self {
            path: db_path_ref.to_path_buf(),
            read_conn: Arc::new(Mutex::new(Some(read_conn))),
            write_conn: Arc::new(Mutex::new(Some(write_conn))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against the read-only connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .read_conn
            .lock()
            .map_err(|_| anyhow!("Ledger read connection lock poisoned"))?;
        let conn = guard.as_ref().ok_or_else(|| anyhow!("Ledger database is closed"))?;
        f(conn)
    }

    /// Runs `f` against the write connection. Callers hold the write lock for
    /// the whole closure, so a transaction opened inside is never interleaved.
    pub fn write<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .write_conn
            .lock()
            .map_err(|_| anyhow!("Ledger write connection lock poisoned"))?;
        let conn = guard.as_mut().ok_or_else(|| anyhow!("Ledger database is closed"))?;
        f(conn)
    }

    /// Closes both connections. Any later use of this handle, or of a clone of
    /// it, fails with a "closed" error.
    pub fn close(&self) -> Result<()> {
        let write = self
            .write_conn
            .lock()
            .map_err(|_| anyhow!("Ledger write connection lock poisoned"))?
            .take();
        if let Some(conn) = write {
            conn.close()
                .map_err(|(_, e)| e)
                .context("Failed to close ledger write connection")?;
        }
        let read = self
            .read_conn
            .lock()
            .map_err(|_| anyhow!("Ledger read connection lock poisoned"))?
            .take();
        if let Some(conn) = read {
            conn.close()
                .map_err(|(_, e)| e)
                .context("Failed to close ledger read connection")?;
        }
        info!("Closed ledger database {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_column;
    use crate::sqlite_persistence::{Column, SqlType, Table};
    use tempfile::TempDir;

    fn user_version(conn: &Connection) -> i64 {
        conn.query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_open_creates_latest_schema() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("ledger.db")).unwrap();

        let version = db.read(|conn| Ok(user_version(conn))).unwrap();
        assert_eq!(
            version,
            (BASE_DB_VERSION + LEDGER_VERSIONED_SCHEMAS.len() - 1) as i64
        );
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let db = Database::open(&path).unwrap();
            db.write(|conn| {
                conn.execute(
                    "INSERT INTO algorithm_versions (version_id, label, created_at, is_active) VALUES ('v1', 'first', 1, 1)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM algorithm_versions", [], |r| {
                    r.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    const NOTES_V0: Table = Table {
        name: "notes",
        columns: &[sqlite_column!("id", &SqlType::Text, is_primary_key = true)],
        indices: &[],
        unique_constraints: &[],
    };

    const NOTES_V1: Table = Table {
        name: "notes",
        columns: &[
            sqlite_column!("id", &SqlType::Text, is_primary_key = true),
            sqlite_column!("body", &SqlType::Text),
        ],
        indices: &[],
        unique_constraints: &[],
    };

    fn add_body(conn: &Connection) -> Result<()> {
        conn.execute("ALTER TABLE notes ADD COLUMN body TEXT", [])?;
        Ok(())
    }

    const NOTES_SCHEMAS: &[VersionedSchema] = &[
        VersionedSchema {
            version: 0,
            tables: &[NOTES_V0],
            migration: None,
        },
        VersionedSchema {
            version: 1,
            tables: &[NOTES_V1],
            migration: Some(add_body),
        },
    ];

    #[test]
    fn test_migrates_older_schema_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.db");
        {
            let conn = Connection::open(&path).unwrap();
            NOTES_SCHEMAS[0].create(&conn).unwrap();
            conn.execute("INSERT INTO notes (id) VALUES ('a')", []).unwrap();
        }

        let db = Database::open_with_schemas(&path, NOTES_SCHEMAS).unwrap();
        let body: Option<String> = db
            .read(|conn| {
                Ok(conn.query_row("SELECT body FROM notes WHERE id = 'a'", [], |r| r.get(0))?)
            })
            .unwrap();
        assert!(body.is_none());
        let version = db.read(|conn| Ok(user_version(conn))).unwrap();
        assert_eq!(version, (BASE_DB_VERSION + 1) as i64);
    }

    #[test]
    fn test_rejects_foreign_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE something (id INTEGER)", [])
                .unwrap();
        }
        assert!(Database::open(&path).is_err());
    }

    #[test]
    fn test_use_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("ledger.db")).unwrap();
        let clone = db.clone();
        db.close().unwrap();

        let err = clone.read(|_| Ok(())).unwrap_err().to_string();
        assert!(err.contains("closed"));
        assert!(clone.write(|_| Ok(())).is_err());
    }
}
