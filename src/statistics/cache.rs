//! Global statistics computed by explicit refresh and read back cheaply.

use super::models::{GlobalStatistics, ItemRef, Percentiles};
use crate::config::StatisticsSettings;
use crate::entity_store::{DerivedRecord, EntityStore};
use crate::error::Result;
use crate::sqlite_persistence::Database;
use crate::version_registry::VersionRegistry;
use anyhow::Context;
use rusqlite::{params, OptionalExtension};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

fn item_ref(record: &DerivedRecord) -> ItemRef {
    ItemRef {
        item_id: record.item_id.clone(),
        name: record.name.clone(),
        group_key: record.group_key.clone(),
        score: record.score,
    }
}

fn by_score_desc(a: &ItemRef, b: &ItemRef) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.item_id.cmp(&b.item_id))
}

fn by_score_asc(a: &ItemRef, b: &ItemRef) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.item_id.cmp(&b.item_id))
}

/// Keeps `list` sorted by `cmp` and at most `n` long.
fn push_bounded(
    list: &mut Vec<ItemRef>,
    item: ItemRef,
    n: usize,
    cmp: fn(&ItemRef, &ItemRef) -> Ordering,
) {
    let pos = list
        .binary_search_by(|entry| cmp(entry, &item))
        .unwrap_or_else(|pos| pos);
    if pos < n {
        list.insert(pos, item);
        list.truncate(n);
    }
}

pub struct StatisticsCache {
    db: Database,
    entities: Arc<dyn EntityStore>,
    registry: Arc<dyn VersionRegistry>,
    settings: StatisticsSettings,
}

impl StatisticsCache {
    pub fn new(
        db: Database,
        entities: Arc<dyn EntityStore>,
        registry: Arc<dyn VersionRegistry>,
        settings: StatisticsSettings,
    ) -> Self {
        Self {
            db,
            entities,
            registry,
            settings,
        }
    }

    /// Recomputes the statistics with one scan of the entity store and
    /// persists them.
    pub fn refresh(&self) -> Result<GlobalStatistics> {
        let active_version = self.registry.current_active()?.map(|v| v.version_id);
        let top_n = self.settings.top_n;

        let mut scores = Vec::new();
        let mut groups = HashSet::new();
        let mut top = Vec::with_capacity(top_n + 1);
        let mut bottom = Vec::with_capacity(top_n + 1);
        let mut earliest: Option<i64> = None;
        let mut latest: Option<i64> = None;
        let mut stale_count = 0;

        self.entities.for_each_record(&mut |record| {
            scores.push(record.score);
            groups.insert(record.group_key.clone());
            earliest = Some(earliest.map_or(record.computed_at, |e| e.min(record.computed_at)));
            latest = Some(latest.map_or(record.computed_at, |l| l.max(record.computed_at)));
            if let Some(active) = &active_version {
                if &record.algorithm_version != active {
                    stale_count += 1;
                }
            }
            push_bounded(&mut top, item_ref(&record), top_n, by_score_desc);
            push_bounded(&mut bottom, item_ref(&record), top_n, by_score_asc);
            Ok(())
        })?;

        let n = scores.len();
        let (mean_score, std_dev_score) = if n == 0 {
            (0.0, 0.0)
        } else {
            let mean = scores.iter().sum::<f64>() / n as f64;
            let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
            (mean, variance.sqrt())
        };
        scores.sort_by(f64::total_cmp);
        let percentiles = (!scores.is_empty()).then(|| Percentiles::from_sorted(&scores));

        let stats = GlobalStatistics {
            entity_count: n,
            group_count: groups.len(),
            earliest_computed_at: earliest,
            latest_computed_at: latest,
            percentiles,
            mean_score,
            std_dev_score,
            top,
            bottom,
            active_version,
            stale_count,
            refreshed_at: chrono::Utc::now().timestamp(),
        };
        self.store(&stats)?;
        info!(
            "Refreshed statistics: {} records, {} groups, {} stale",
            stats.entity_count, stats.group_count, stats.stale_count
        );
        Ok(stats)
    }

    /// The last persisted snapshot, without recomputing.
    pub fn read(&self) -> Result<Option<GlobalStatistics>> {
        let payload: Option<String> = self.db.read(|conn| {
            Ok(conn
                .query_row("SELECT payload FROM global_stats WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()?)
        })?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Overwrites the single statistics row.
    pub fn store(&self, stats: &GlobalStatistics) -> Result<()> {
        let payload = serde_json::to_string(stats)?;
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO global_stats (id, payload, refreshed_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, refreshed_at = excluded.refreshed_at",
                params![payload, stats.refreshed_at],
            )
            .context("Failed to write global statistics")?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::{
        ComputedOutput, SqliteEntityStore, VersionedBlob, COMPUTED_SCHEMA_VERSION,
        RAW_SCHEMA_VERSION,
    };
    use crate::identity::NaturalKey;
    use crate::version_registry::{AlgorithmVersion, SqliteVersionRegistry};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        cache: StatisticsCache,
        entities: Arc<SqliteEntityStore>,
        registry: Arc<SqliteVersionRegistry>,
        _tmp: TempDir,
    }

    fn create_fixture(top_n: usize) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("ledger.db")).unwrap();
        let registry = Arc::new(SqliteVersionRegistry::new(db.clone()));
        registry
            .register(&AlgorithmVersion::new("v1", "first", 100, true))
            .unwrap();
        let entities = Arc::new(SqliteEntityStore::new(db.clone()));
        let cache = StatisticsCache::new(
            db,
            entities.clone(),
            registry.clone(),
            StatisticsSettings { top_n },
        );
        Fixture {
            cache,
            entities,
            registry,
            _tmp: temp_dir,
        }
    }

    fn make_record(name: &str, group: &str, score: f64, computed_at: i64) -> DerivedRecord {
        let key = NaturalKey::new(name, group, "");
        DerivedRecord {
            item_id: key.item_id(),
            name: name.to_string(),
            group_key: key.group.clone(),
            context: String::new(),
            raw: VersionedBlob::encode(RAW_SCHEMA_VERSION, &json!({})).unwrap(),
            computed: VersionedBlob::encode(
                COMPUTED_SCHEMA_VERSION,
                &ComputedOutput {
                    score,
                    confidence: 1.0,
                    fields: Default::default(),
                },
            )
            .unwrap(),
            confidence: 1.0,
            algorithm_version: "v1".to_string(),
            computed_at,
            updated_at: 0,
            is_valid: true,
            score,
            play_count: 1,
            first_seen: 0,
            last_seen: 0,
            tags: vec![],
        }
    }

    #[test]
    fn test_read_before_refresh_is_none() {
        let fixture = create_fixture(10);
        assert!(fixture.cache.read().unwrap().is_none());
    }

    #[test]
    fn test_refresh_empty_store() {
        let fixture = create_fixture(10);
        let stats = fixture.cache.refresh().unwrap();
        assert_eq!(stats.entity_count, 0);
        assert!(stats.percentiles.is_none());
        assert!(stats.top.is_empty());
        assert_eq!(stats.active_version.as_deref(), Some("v1"));
    }

    #[test]
    fn test_refresh_computes_distribution() {
        let fixture = create_fixture(2);
        let records: Vec<_> = [10.0, 20.0, 30.0, 40.0, 50.0]
            .iter()
            .enumerate()
            .map(|(i, s)| make_record(&format!("song {}", i), if i < 2 { "a" } else { "b" }, *s, 100 + i as i64))
            .collect();
        fixture.entities.upsert_batch(&records).unwrap();

        let stats = fixture.cache.refresh().unwrap();
        assert_eq!(stats.entity_count, 5);
        assert_eq!(stats.group_count, 2);
        assert_eq!(stats.earliest_computed_at, Some(100));
        assert_eq!(stats.latest_computed_at, Some(104));
        assert_eq!(stats.mean_score, 30.0);
        assert!((stats.std_dev_score - 200f64.sqrt()).abs() < 1e-9);

        let p = stats.percentiles.unwrap();
        assert_eq!(p.p50, 30.0);
        assert_eq!(p.p25, 20.0);
        assert!((p.p10 - 14.0).abs() < 1e-9);

        let top: Vec<_> = stats.top.iter().map(|r| r.score).collect();
        assert_eq!(top, vec![50.0, 40.0]);
        let bottom: Vec<_> = stats.bottom.iter().map(|r| r.score).collect();
        assert_eq!(bottom, vec![10.0, 20.0]);
    }

    #[test]
    fn test_read_returns_last_snapshot_without_recomputing() {
        let fixture = create_fixture(10);
        fixture
            .entities
            .upsert(&make_record("a", "g", 10.0, 1))
            .unwrap();
        let refreshed = fixture.cache.refresh().unwrap();

        fixture
            .entities
            .upsert(&make_record("b", "g", 90.0, 2))
            .unwrap();
        let read = fixture.cache.read().unwrap().unwrap();
        assert_eq!(read.entity_count, 1);
        assert_eq!(read.refreshed_at, refreshed.refreshed_at);

        assert_eq!(fixture.cache.refresh().unwrap().entity_count, 2);
    }

    #[test]
    fn test_stale_count_tracks_active_version() {
        let fixture = create_fixture(10);
        fixture
            .entities
            .upsert_batch(&[make_record("a", "g", 10.0, 1), make_record("b", "g", 20.0, 1)])
            .unwrap();
        fixture
            .registry
            .register(&AlgorithmVersion::new("v2", "second", 200, true))
            .unwrap();

        let stats = fixture.cache.refresh().unwrap();
        assert_eq!(stats.active_version.as_deref(), Some("v2"));
        assert_eq!(stats.stale_count, 2);
    }

    #[test]
    fn test_top_ties_broken_by_item_id() {
        let fixture = create_fixture(3);
        let records: Vec<_> = (0..6)
            .map(|i| make_record(&format!("tie {}", i), "g", 50.0, 1))
            .collect();
        fixture.entities.upsert_batch(&records).unwrap();

        let stats = fixture.cache.refresh().unwrap();
        let mut ids: Vec<_> = records.iter().map(|r| r.item_id.clone()).collect();
        ids.sort();
        let top: Vec<_> = stats.top.iter().map(|r| r.item_id.clone()).collect();
        assert_eq!(top, ids[..3].to_vec());
    }
}
