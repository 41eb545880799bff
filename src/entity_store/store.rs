//! SQLite-backed entity store implementation.

use super::models::{DerivedRecord, SortOrder, UpsertOutcome, VersionedBlob};
use super::trait_def::EntityStore;
use crate::error::{FailureKind, LedgerError, Result};
use crate::identity::{normalize, ItemId};
use crate::rollup::RollupKind;
use crate::sqlite_persistence::Database;
use anyhow::Context;
use rusqlite::{
    params, params_from_iter, types::Type, Connection, ErrorCode, OptionalExtension, Row,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Column list matching [`row_to_record`].
pub(crate) const RECORD_COLUMNS: &str = "item_id, name, group_key, context, raw_blob, computed_blob, \
     confidence, algorithm_version, computed_at, updated_at, is_valid, score, play_count, \
     first_seen, last_seen, tags_json";

const SCAN_PAGE_SIZE: usize = 500;

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| {
        let index = row.as_ref().column_index(column).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}

pub(crate) fn row_to_record(row: &Row) -> rusqlite::Result<DerivedRecord> {
    let item_id: String = row.get("item_id")?;
    let raw: VersionedBlob = json_column(row, "raw_blob")?;
    let computed: VersionedBlob = json_column(row, "computed_blob")?;
    let tags: Vec<String> = json_column(row, "tags_json")?;
    let play_count: i64 = row.get("play_count")?;

    Ok(DerivedRecord {
        item_id: ItemId::parse(&item_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
        })?,
        name: row.get("name")?,
        group_key: row.get("group_key")?,
        context: row.get("context")?,
        raw,
        computed,
        confidence: row.get("confidence")?,
        algorithm_version: row.get("algorithm_version")?,
        computed_at: row.get("computed_at")?,
        updated_at: row.get("updated_at")?,
        is_valid: row.get::<_, i32>("is_valid")? != 0,
        score: row.get("score")?,
        play_count: play_count.max(0) as u64,
        first_seen: row.get("first_seen")?,
        last_seen: row.get("last_seen")?,
        tags,
    })
}

pub(crate) fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> anyhow::Result<Vec<DerivedRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let records = stmt
        .query_map(params, row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read derived records")?;
    Ok(records)
}

/// Escapes LIKE wildcards so user text matches literally.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn search_text(record: &DerivedRecord) -> String {
    normalize(&format!(
        "{} {} {}",
        record.name, record.group_key, record.context
    ))
}

/// Writes one record and rewrites its field and tag index rows.
fn write_record(conn: &Connection, record: &DerivedRecord, now: i64) -> anyhow::Result<()> {
    let tags: BTreeSet<String> = record
        .tags
        .iter()
        .map(|t| normalize(t))
        .filter(|t| !t.is_empty())
        .collect();
    let tags_json = serde_json::to_string(&tags)?;

    conn.prepare_cached(
        "INSERT INTO items (item_id, name, group_key, context, search_text, raw_blob, computed_blob,
                            confidence, algorithm_version, computed_at, updated_at, is_valid, score,
                            play_count, first_seen, last_seen, tags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(item_id) DO UPDATE SET
            name = excluded.name,
            group_key = excluded.group_key,
            context = excluded.context,
            search_text = excluded.search_text,
            raw_blob = excluded.raw_blob,
            computed_blob = excluded.computed_blob,
            confidence = excluded.confidence,
            algorithm_version = excluded.algorithm_version,
            computed_at = excluded.computed_at,
            updated_at = excluded.updated_at,
            is_valid = excluded.is_valid,
            score = excluded.score,
            play_count = excluded.play_count,
            first_seen = excluded.first_seen,
            last_seen = excluded.last_seen,
            tags_json = excluded.tags_json",
    )?
    .execute(params![
        record.item_id.as_str(),
        record.name,
        normalize(&record.group_key),
        record.context,
        search_text(record),
        serde_json::to_string(&record.raw)?,
        serde_json::to_string(&record.computed)?,
        record.confidence,
        record.algorithm_version,
        record.computed_at,
        now,
        record.is_valid as i32,
        record.score,
        record.play_count as i64,
        record.first_seen,
        record.last_seen,
        tags_json,
    ])
    .with_context(|| format!("Failed to write item {}", record.item_id))?;

    conn.prepare_cached("DELETE FROM item_fields WHERE item_id = ?1")?
        .execute(params![record.item_id.as_str()])?;
    let mut insert_field =
        conn.prepare_cached("INSERT INTO item_fields (item_id, field, value) VALUES (?1, ?2, ?3)")?;
    for (field, value) in record.fields() {
        insert_field.execute(params![record.item_id.as_str(), field, value])?;
    }

    conn.prepare_cached("DELETE FROM item_tags WHERE item_id = ?1")?
        .execute(params![record.item_id.as_str()])?;
    let mut insert_tag = conn.prepare_cached("INSERT INTO item_tags (item_id, tag) VALUES (?1, ?2)")?;
    for tag in &tags {
        insert_tag.execute(params![record.item_id.as_str(), tag])?;
    }
    Ok(())
}

/// SQLite-backed entity store.
#[derive(Clone)]
pub struct SqliteEntityStore {
    db: Database,
}

impl SqliteEntityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn write_batch(&self, records: &[DerivedRecord], atomic: bool) -> Result<UpsertOutcome> {
        let now = chrono::Utc::now().timestamp();
        let outcome = self.db.write(|conn| {
            let mut outcome = UpsertOutcome::default();
            let mut tx = conn
                .transaction()
                .context("Failed to begin batch upsert transaction")?;

            for record in records {
                if let Err(reason) = record.validate() {
                    debug!("Rejected item {}: {}", record.item_id, reason);
                    outcome.record_failure(record.item_id.as_str(), FailureKind::Validation, reason);
                    continue;
                }

                let sp = tx.savepoint()?;
                match write_record(&sp, record, now) {
                    Ok(()) => {
                        sp.commit()?;
                        outcome.succeeded += 1;
                    }
                    // Dropping the savepoint rolls back this record only
                    Err(e) if is_record_error(&e) => {
                        debug!("Rolled back item {}: {:#}", record.item_id, e);
                        outcome.record_failure(
                            record.item_id.as_str(),
                            FailureKind::Persistence,
                            format!("{:#}", e),
                        );
                    }
                    // Dropping the transaction rolls back the whole batch
                    Err(e) => {
                        return Err(e.context(format!(
                            "Batch upsert aborted at item {}",
                            record.item_id
                        )));
                    }
                }
            }

            if atomic && !outcome.failed.is_empty() {
                tx.rollback().context("Failed to roll back batch upsert")?;
                outcome.succeeded = 0;
                return Ok(outcome);
            }
            tx.commit().context("Failed to commit batch upsert")?;
            Ok(outcome)
        })?;

        if !outcome.failed.is_empty() {
            info!(
                "Batch upsert: {} written, {} rejected{}",
                outcome.succeeded,
                outcome.failed.len(),
                if atomic && outcome.succeeded == 0 { ", batch rolled back" } else { "" }
            );
        }
        Ok(outcome)
    }
}

/// Whether a write error belongs to the record itself (a constraint it
/// violates, or a payload that does not serialize) rather than to the store.
fn is_record_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.is::<serde_json::Error>() {
            return true;
        }
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation
        )
    })
}

impl EntityStore for SqliteEntityStore {
    fn upsert(&self, record: &DerivedRecord) -> Result<()> {
        record.validate().map_err(LedgerError::Validation)?;
        let now = chrono::Utc::now().timestamp();
        self.db.write(|conn| {
            let tx = conn
                .transaction()
                .context("Failed to begin upsert transaction")?;
            write_record(&tx, record, now)?;
            tx.commit().context("Failed to commit upsert")?;
            Ok(())
        })?;
        Ok(())
    }

    fn upsert_batch(&self, records: &[DerivedRecord]) -> Result<UpsertOutcome> {
        self.write_batch(records, false)
    }

    fn upsert_batch_atomic(&self, records: &[DerivedRecord]) -> Result<UpsertOutcome> {
        self.write_batch(records, true)
    }

    fn get_by_identifier(&self, item_id: &ItemId) -> Result<Option<DerivedRecord>> {
        let record = self.db.read(|conn| {
            let sql = format!("SELECT {} FROM items WHERE item_id = ?1", RECORD_COLUMNS);
            Ok(conn
                .prepare_cached(&sql)?
                .query_row(params![item_id.as_str()], row_to_record)
                .optional()?)
        })?;
        Ok(record)
    }

    fn get_by_group_key(&self, group_key: &str) -> Result<Vec<DerivedRecord>> {
        let key = normalize(group_key);
        let records = self.db.read(|conn| {
            let sql = format!(
                "SELECT {} FROM items WHERE group_key = ?1 ORDER BY score DESC, item_id ASC",
                RECORD_COLUMNS
            );
            query_records(conn, &sql, params![key])
        })?;
        Ok(records)
    }

    fn get_by_group_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<DerivedRecord>> {
        let pattern = format!("{}%", like_escape(&normalize(prefix)));
        let records = self.db.read(|conn| {
            let sql = format!(
                "SELECT {} FROM items WHERE group_key LIKE ?1 ESCAPE '\\'
                 ORDER BY group_key ASC, score DESC, item_id ASC LIMIT ?2",
                RECORD_COLUMNS
            );
            query_records(conn, &sql, params![pattern, limit as i64])
        })?;
        Ok(records)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<DerivedRecord>> {
        let normalized = normalize(query);
        let tokens: Vec<String> = normalized
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|t| format!("%{}%", like_escape(t)))
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let conditions = (1..=tokens.len())
            .map(|i| format!("search_text LIKE ?{} ESCAPE '\\'", i))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM items WHERE {} ORDER BY score DESC, item_id ASC LIMIT {}",
            RECORD_COLUMNS, conditions, limit
        );
        let records = self
            .db
            .read(|conn| query_records(conn, &sql, params_from_iter(tokens.iter())))?;
        Ok(records)
    }

    fn query_by_score_range(
        &self,
        min: f64,
        max: f64,
        order: SortOrder,
    ) -> Result<Vec<DerivedRecord>> {
        let sql = format!(
            "SELECT {} FROM items WHERE score >= ?1 AND score <= ?2 ORDER BY score {}, item_id ASC",
            RECORD_COLUMNS,
            order.as_sql()
        );
        let records = self
            .db
            .read(|conn| query_records(conn, &sql, params![min, max]))?;
        Ok(records)
    }

    fn query_by_computed_field(
        &self,
        field: &str,
        min: f64,
        max: f64,
        order: SortOrder,
    ) -> Result<Vec<DerivedRecord>> {
        let columns = RECORD_COLUMNS
            .split(", ")
            .map(|c| format!("i.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM item_fields f JOIN items i ON i.item_id = f.item_id
             WHERE f.field = ?1 AND f.value >= ?2 AND f.value <= ?3
             ORDER BY f.value {}, i.item_id ASC",
            columns,
            order.as_sql()
        );
        let records = self
            .db
            .read(|conn| query_records(conn, &sql, params![field, min, max]))?;
        Ok(records)
    }

    fn query_by_time_range(&self, start: i64, end: i64) -> Result<Vec<DerivedRecord>> {
        let sql = format!(
            "SELECT {} FROM items WHERE computed_at >= ?1 AND computed_at <= ?2
             ORDER BY computed_at ASC, item_id ASC",
            RECORD_COLUMNS
        );
        let records = self
            .db
            .read(|conn| query_records(conn, &sql, params![start, end]))?;
        Ok(records)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?))?;
        Ok(count as usize)
    }

    fn list_group_keys(&self) -> Result<Vec<String>> {
        let keys = self.db.read(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT DISTINCT group_key FROM items ORDER BY group_key")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })?;
        Ok(keys)
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        let tags = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached("SELECT DISTINCT tag FROM item_tags ORDER BY tag")?;
            let tags = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(tags)
        })?;
        Ok(tags)
    }

    fn for_each_record(&self, f: &mut dyn FnMut(DerivedRecord) -> Result<()>) -> Result<()> {
        // Keyset pages, so the read lock is released between pages and `f`
        // may call back into the store.
        let sql = format!(
            "SELECT {} FROM items WHERE item_id > ?1 ORDER BY item_id ASC LIMIT ?2",
            RECORD_COLUMNS
        );
        let mut cursor = String::new();
        loop {
            let page = self
                .db
                .read(|conn| query_records(conn, &sql, params![cursor, SCAN_PAGE_SIZE as i64]))?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            cursor = last.item_id.as_str().to_string();
            let page_len = page.len();
            for record in page {
                f(record)?;
            }
            if page_len < SCAN_PAGE_SIZE {
                return Ok(());
            }
        }
    }

    fn records_for_rollup(&self, kind: RollupKind, key: &str) -> Result<Vec<DerivedRecord>> {
        let records = match kind {
            RollupKind::Group => {
                let sql = format!(
                    "SELECT {} FROM items WHERE group_key = ?1 ORDER BY item_id ASC",
                    RECORD_COLUMNS
                );
                let key = normalize(key);
                self.db.read(|conn| query_records(conn, &sql, params![key]))?
            }
            RollupKind::Tag => {
                let sql = format!(
                    "SELECT {} FROM items WHERE item_id IN (SELECT item_id FROM item_tags WHERE tag = ?1)
                     ORDER BY item_id ASC",
                    RECORD_COLUMNS
                );
                let key = normalize(key);
                self.db.read(|conn| query_records(conn, &sql, params![key]))?
            }
            RollupKind::Period => {
                let (start, end) = RollupKind::period_bounds(key)?;
                let sql = format!(
                    "SELECT {} FROM items WHERE last_seen >= ?1 AND last_seen < ?2 ORDER BY item_id ASC",
                    RECORD_COLUMNS
                );
                self.db
                    .read(|conn| query_records(conn, &sql, params![start, end]))?
            }
        };
        Ok(records)
    }
}
