//! Algorithm version ledger backed by the `algorithm_versions` table.

use super::models::AlgorithmVersion;
use crate::entity_store::{query_records, DerivedRecord, RECORD_COLUMNS};
use crate::error::{LedgerError, Result};
use crate::identity::ItemId;
use crate::sqlite_persistence::Database;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

pub trait VersionRegistry: Send + Sync {
    /// Inserts a version, or updates label and active flag of an existing one.
    /// Registering an active version deactivates every other version.
    fn register(&self, version: &AlgorithmVersion) -> Result<()>;

    /// Registers several versions atomically. At most one may be active.
    fn register_all(&self, versions: &[AlgorithmVersion]) -> Result<()>;

    /// The flagged active version.
    ///
    /// When no version is flagged, falls back to the most recently created one
    /// and returns it with `is_active == false`, so callers can tell the two
    /// cases apart. `None` only when nothing is registered.
    fn current_active(&self) -> Result<Option<AlgorithmVersion>>;

    fn get(&self, version_id: &str) -> Result<Option<AlgorithmVersion>>;

    /// All versions, oldest first.
    fn list(&self) -> Result<Vec<AlgorithmVersion>>;

    /// Up to `limit` records not computed with `target`, in item id order.
    fn find_stale(&self, target: &str, limit: usize) -> Result<Vec<DerivedRecord>> {
        self.find_stale_after(target, None, limit)
    }

    /// Like [`VersionRegistry::find_stale`], starting after the `after` cursor.
    fn find_stale_after(
        &self,
        target: &str,
        after: Option<&ItemId>,
        limit: usize,
    ) -> Result<Vec<DerivedRecord>>;

    fn count_stale(&self, target: &str) -> Result<usize>;
}

fn row_to_version(row: &Row) -> rusqlite::Result<AlgorithmVersion> {
    Ok(AlgorithmVersion {
        version_id: row.get("version_id")?,
        label: row.get("label")?,
        created_at: row.get("created_at")?,
        is_active: row.get::<_, i32>("is_active")? != 0,
    })
}

fn register_in(conn: &Connection, version: &AlgorithmVersion) -> anyhow::Result<()> {
    if version.is_active {
        conn.execute(
            "UPDATE algorithm_versions SET is_active = 0 WHERE is_active = 1 AND version_id != ?1",
            params![version.version_id],
        )?;
    }
    conn.execute(
        "INSERT INTO algorithm_versions (version_id, label, created_at, is_active)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(version_id) DO UPDATE SET
            label = excluded.label,
            is_active = excluded.is_active",
        params![
            version.version_id,
            version.label,
            version.created_at,
            version.is_active as i32
        ],
    )
    .with_context(|| format!("Failed to register algorithm version {}", version.version_id))?;
    Ok(())
}

fn check_version(version: &AlgorithmVersion) -> Result<()> {
    if version.version_id.trim().is_empty() {
        return Err(LedgerError::Validation(
            "algorithm version id is empty".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteVersionRegistry {
    db: Database,
}

impl SqliteVersionRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl VersionRegistry for SqliteVersionRegistry {
    fn register(&self, version: &AlgorithmVersion) -> Result<()> {
        check_version(version)?;
        self.db.write(|conn| {
            let tx = conn.transaction()?;
            register_in(&tx, version)?;
            tx.commit()?;
            Ok(())
        })?;
        info!(
            "Registered algorithm version {} ({}){}",
            version.version_id,
            version.label,
            if version.is_active { ", now active" } else { "" }
        );
        Ok(())
    }

    fn register_all(&self, versions: &[AlgorithmVersion]) -> Result<()> {
        let active: Vec<&str> = versions
            .iter()
            .filter(|v| v.is_active)
            .map(|v| v.version_id.as_str())
            .collect();
        if active.len() > 1 {
            return Err(LedgerError::Consistency(format!(
                "more than one active algorithm version: {}",
                active.join(", ")
            )));
        }
        for version in versions {
            check_version(version)?;
        }

        self.db.write(|conn| {
            let tx = conn.transaction()?;
            for version in versions {
                register_in(&tx, version)?;
            }
            tx.commit()?;
            Ok(())
        })?;
        info!("Registered {} algorithm versions", versions.len());
        Ok(())
    }

    fn current_active(&self) -> Result<Option<AlgorithmVersion>> {
        let (flagged, latest) = self.db.read(|conn| {
            let flagged = conn
                .query_row(
                    "SELECT version_id, label, created_at, is_active FROM algorithm_versions
                     WHERE is_active = 1",
                    [],
                    row_to_version,
                )
                .optional()?;
            if flagged.is_some() {
                return Ok((flagged, None));
            }
            let latest = conn
                .query_row(
                    "SELECT version_id, label, created_at, is_active FROM algorithm_versions
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    [],
                    row_to_version,
                )
                .optional()?;
            Ok((None, latest))
        })?;

        if flagged.is_some() {
            return Ok(flagged);
        }
        if let Some(version) = &latest {
            warn!(
                "No algorithm version is flagged active, falling back to latest created: {}",
                version.version_id
            );
        }
        Ok(latest)
    }

    fn get(&self, version_id: &str) -> Result<Option<AlgorithmVersion>> {
        let version = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT version_id, label, created_at, is_active FROM algorithm_versions
                     WHERE version_id = ?1",
                    params![version_id],
                    row_to_version,
                )
                .optional()?)
        })?;
        Ok(version)
    }

    fn list(&self) -> Result<Vec<AlgorithmVersion>> {
        let versions = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT version_id, label, created_at, is_active FROM algorithm_versions
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let versions = stmt
                .query_map([], row_to_version)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(versions)
        })?;
        Ok(versions)
    }

    fn find_stale_after(
        &self,
        target: &str,
        after: Option<&ItemId>,
        limit: usize,
    ) -> Result<Vec<DerivedRecord>> {
        let cursor = after.map(|id| id.as_str()).unwrap_or("");
        let sql = format!(
            "SELECT {} FROM items WHERE algorithm_version != ?1 AND item_id > ?2
             ORDER BY item_id ASC LIMIT ?3",
            RECORD_COLUMNS
        );
        let records = self
            .db
            .read(|conn| query_records(conn, &sql, params![target, cursor, limit as i64]))?;
        Ok(records)
    }

    fn count_stale(&self, target: &str) -> Result<usize> {
        let count: i64 = self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM items WHERE algorithm_version != ?1",
                params![target],
                |r| r.get(0),
            )?)
        })?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_registry() -> (SqliteVersionRegistry, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("ledger.db")).unwrap();
        (SqliteVersionRegistry::new(db), temp_dir)
    }

    #[test]
    fn test_empty_registry_has_no_active() {
        let (registry, _tmp) = create_test_registry();
        assert!(registry.current_active().unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_registering_active_deactivates_previous() {
        let (registry, _tmp) = create_test_registry();
        registry
            .register(&AlgorithmVersion::new("v1", "first", 100, true))
            .unwrap();
        registry
            .register(&AlgorithmVersion::new("v2", "second", 200, true))
            .unwrap();

        let active = registry.current_active().unwrap().unwrap();
        assert_eq!(active.version_id, "v2");
        assert!(active.is_active);
        assert!(!registry.get("v1").unwrap().unwrap().is_active);
    }

    #[test]
    fn test_register_updates_existing_keeps_created_at() {
        let (registry, _tmp) = create_test_registry();
        registry
            .register(&AlgorithmVersion::new("v1", "first", 100, false))
            .unwrap();
        registry
            .register(&AlgorithmVersion::new("v1", "renamed", 999, true))
            .unwrap();

        let versions = registry.list().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].label, "renamed");
        assert_eq!(versions[0].created_at, 100);
        assert!(versions[0].is_active);
    }

    #[test]
    fn test_fallback_to_latest_created_when_none_flagged() {
        let (registry, _tmp) = create_test_registry();
        registry
            .register(&AlgorithmVersion::new("old", "old", 100, false))
            .unwrap();
        registry
            .register(&AlgorithmVersion::new("new", "new", 200, false))
            .unwrap();
        registry
            .register(&AlgorithmVersion::new("tie", "tie", 200, false))
            .unwrap();

        let fallback = registry.current_active().unwrap().unwrap();
        assert_eq!(fallback.version_id, "tie");
        assert!(!fallback.is_active);
    }

    #[test]
    fn test_register_all_rejects_two_active() {
        let (registry, _tmp) = create_test_registry();
        registry
            .register(&AlgorithmVersion::new("v1", "first", 100, true))
            .unwrap();

        let err = registry
            .register_all(&[
                AlgorithmVersion::new("v2", "second", 200, true),
                AlgorithmVersion::new("v3", "third", 300, true),
            ])
            .unwrap_err();
        assert!(matches!(err, LedgerError::Consistency(_)));

        let active = registry.current_active().unwrap().unwrap();
        assert_eq!(active.version_id, "v1");
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_register_all_is_atomic() {
        let (registry, _tmp) = create_test_registry();
        registry
            .register_all(&[
                AlgorithmVersion::new("v1", "first", 100, false),
                AlgorithmVersion::new("v2", "second", 200, true),
            ])
            .unwrap();
        assert_eq!(registry.list().unwrap().len(), 2);
        assert_eq!(
            registry.current_active().unwrap().unwrap().version_id,
            "v2"
        );
    }

    #[test]
    fn test_two_active_rows_rejected_by_schema() {
        let (registry, _tmp) = create_test_registry();
        registry
            .register(&AlgorithmVersion::new("v1", "first", 100, true))
            .unwrap();
        registry
            .register(&AlgorithmVersion::new("v2", "second", 200, false))
            .unwrap();

        let result = registry.db.write(|conn| {
            conn.execute(
                "UPDATE algorithm_versions SET is_active = 1 WHERE version_id = 'v2'",
                [],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_register_rejects_empty_id() {
        let (registry, _tmp) = create_test_registry();
        let err = registry
            .register(&AlgorithmVersion::new(" ", "blank", 1, true))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
