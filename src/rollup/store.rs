//! Persisted rollups, always rebuilt from the entity store.

use super::models::{GroupProfile, ProfileInput, RollupKind};
use crate::entity_store::EntityStore;
use crate::error::{LedgerError, Result};
use crate::sqlite_persistence::Database;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of profiles written by [`RollupStore::recompute_all`], per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupSummary {
    pub groups: usize,
    pub tags: usize,
    pub periods: usize,
}

fn row_to_profile(row: &Row) -> rusqlite::Result<GroupProfile> {
    let json: String = row.get("profile_json")?;
    serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn write_profile(conn: &Connection, profile: &GroupProfile) -> anyhow::Result<()> {
    conn.prepare_cached(
        "INSERT INTO group_profiles (kind, rollup_key, item_count, total_plays, weighted_score, profile_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(kind, rollup_key) DO UPDATE SET
            item_count = excluded.item_count,
            total_plays = excluded.total_plays,
            weighted_score = excluded.weighted_score,
            profile_json = excluded.profile_json",
    )?
    .execute(params![
        profile.kind.as_str(),
        profile.key,
        profile.item_count as i64,
        profile.total_plays as i64,
        profile.weighted_score,
        serde_json::to_string(profile)?,
    ])
    .with_context(|| format!("Failed to write {} profile {}", profile.kind, profile.key))?;
    Ok(())
}

/// Writes `profiles` after deleting every existing profile, in one transaction.
fn replace_all_profiles(db: &Database, profiles: &[GroupProfile]) -> anyhow::Result<()> {
    db.write(|conn| {
        let tx = conn
            .transaction()
            .context("Failed to begin rollup transaction")?;
        tx.execute("DELETE FROM group_profiles", [])?;
        for profile in profiles {
            write_profile(&tx, profile)?;
        }
        tx.commit().context("Failed to commit rollups")?;
        Ok(())
    })
}

pub struct RollupStore {
    db: Database,
    entities: Arc<dyn EntityStore>,
}

impl RollupStore {
    pub fn new(db: Database, entities: Arc<dyn EntityStore>) -> Self {
        Self { db, entities }
    }

    pub fn recompute_group_profile(&self, group_key: &str) -> Result<Option<GroupProfile>> {
        self.recompute_profile(RollupKind::Group, group_key)
    }

    /// Rebuilds one profile. When no record maps to the key the stored profile
    /// is removed and `None` is returned.
    pub fn recompute_profile(&self, kind: RollupKind, key: &str) -> Result<Option<GroupProfile>> {
        let records = self.entities.records_for_rollup(kind, key)?;
        let inputs: Vec<ProfileInput> = records.iter().map(ProfileInput::from).collect();
        let normalized_key = match kind {
            RollupKind::Period => key.to_string(),
            _ => crate::identity::normalize(key),
        };
        let profile = GroupProfile::build(kind, &normalized_key, &inputs);

        self.db.write(|conn| {
            match &profile {
                Some(profile) => write_profile(conn, profile)?,
                None => {
                    conn.execute(
                        "DELETE FROM group_profiles WHERE kind = ?1 AND rollup_key = ?2",
                        params![kind.as_str(), normalized_key],
                    )?;
                }
            }
            Ok(())
        })?;
        debug!(
            "Recomputed {} profile {:?} over {} records",
            kind,
            normalized_key,
            inputs.len()
        );
        Ok(profile)
    }

    /// Rebuilds every profile of every kind from a single scan.
    pub fn recompute_all(&self) -> Result<RollupSummary> {
        let mut inputs: BTreeMap<(RollupKind, String), Vec<ProfileInput>> = BTreeMap::new();
        self.entities.for_each_record(&mut |record| {
            let input = ProfileInput::from(&record);
            for kind in RollupKind::ALL {
                for key in kind.keys_for(&record) {
                    inputs.entry((kind, key)).or_default().push(input.clone());
                }
            }
            Ok(())
        })?;

        let profiles: Vec<GroupProfile> = inputs
            .iter()
            .filter_map(|((kind, key), inputs)| GroupProfile::build(*kind, key, inputs))
            .collect();
        replace_all_profiles(&self.db, &profiles)?;

        let mut summary = RollupSummary::default();
        for profile in &profiles {
            match profile.kind {
                RollupKind::Group => summary.groups += 1,
                RollupKind::Tag => summary.tags += 1,
                RollupKind::Period => summary.periods += 1,
            }
        }
        info!(
            "Rebuilt rollups: {} groups, {} tags, {} periods",
            summary.groups, summary.tags, summary.periods
        );
        Ok(summary)
    }

    pub fn get_profile(&self, kind: RollupKind, key: &str) -> Result<Option<GroupProfile>> {
        let profile = self.db.read(|conn| {
            Ok(conn
                .prepare_cached(
                    "SELECT profile_json FROM group_profiles WHERE kind = ?1 AND rollup_key = ?2",
                )?
                .query_row(params![kind.as_str(), key], row_to_profile)
                .optional()?)
        })?;
        Ok(profile)
    }

    /// Profiles of one kind, best weighted score first.
    pub fn list_profiles(&self, kind: RollupKind, limit: usize) -> Result<Vec<GroupProfile>> {
        let profiles = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT profile_json FROM group_profiles WHERE kind = ?1
                 ORDER BY weighted_score DESC, rollup_key ASC LIMIT ?2",
            )?;
            let profiles = stmt
                .query_map(params![kind.as_str(), limit as i64], row_to_profile)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(profiles)
        })?;
        Ok(profiles)
    }

    /// Every stored profile, ordered by kind then key.
    pub fn all_profiles(&self) -> Result<Vec<GroupProfile>> {
        let profiles = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT profile_json FROM group_profiles ORDER BY kind ASC, rollup_key ASC",
            )?;
            let profiles = stmt
                .query_map([], row_to_profile)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(profiles)
        })?;
        Ok(profiles)
    }

    pub fn count(&self, kind: RollupKind) -> Result<usize> {
        let count: i64 = self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM group_profiles WHERE kind = ?1",
                params![kind.as_str()],
                |r| r.get(0),
            )?)
        })?;
        Ok(count as usize)
    }

    /// Replaces every stored profile with `profiles` verbatim.
    pub fn replace_all(&self, profiles: &[GroupProfile]) -> Result<()> {
        if let Some(bad) = profiles.iter().find(|p| p.key.is_empty()) {
            return Err(LedgerError::Validation(format!(
                "{} profile with empty key",
                bad.kind
            )));
        }
        replace_all_profiles(&self.db, profiles)?;
        Ok(())
    }
}
