//! EntityStore trait definition.

use super::models::{DerivedRecord, SortOrder, UpsertOutcome};
use crate::error::Result;
use crate::identity::ItemId;
use crate::rollup::RollupKind;

/// Trait for derived-record storage backends.
pub trait EntityStore: Send + Sync {
    // =========================================================================
    // Writes
    // =========================================================================

    /// Validates and inserts or updates a single record.
    fn upsert(&self, record: &DerivedRecord) -> Result<()>;

    /// Writes all records in one transaction. A record that fails validation
    /// or a constraint is rolled back alone and reported in the outcome. Any
    /// other storage error rolls back the whole batch and is returned.
    fn upsert_batch(&self, records: &[DerivedRecord]) -> Result<UpsertOutcome>;

    /// Like [`EntityStore::upsert_batch`], but a single rejected record rolls
    /// back the whole batch. `succeeded` is then 0.
    fn upsert_batch_atomic(&self, records: &[DerivedRecord]) -> Result<UpsertOutcome>;

    // =========================================================================
    // Point and key lookups
    // =========================================================================

    fn get_by_identifier(&self, item_id: &ItemId) -> Result<Option<DerivedRecord>>;

    /// All records whose normalized grouping key equals `group_key`, best
    /// score first.
    fn get_by_group_key(&self, group_key: &str) -> Result<Vec<DerivedRecord>>;

    fn get_by_group_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<DerivedRecord>>;

    /// Records whose name, group or context contain every token of `query`.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<DerivedRecord>>;

    // =========================================================================
    // Range scans (bounds inclusive, ties broken by item id)
    // =========================================================================

    fn query_by_score_range(&self, min: f64, max: f64, order: SortOrder)
        -> Result<Vec<DerivedRecord>>;

    fn query_by_computed_field(
        &self,
        field: &str,
        min: f64,
        max: f64,
        order: SortOrder,
    ) -> Result<Vec<DerivedRecord>>;

    /// Records computed within `[start, end]`, oldest first.
    fn query_by_time_range(&self, start: i64, end: i64) -> Result<Vec<DerivedRecord>>;

    // =========================================================================
    // Scans
    // =========================================================================

    fn count(&self) -> Result<usize>;

    fn list_group_keys(&self) -> Result<Vec<String>>;

    fn list_tags(&self) -> Result<Vec<String>>;

    /// Streams every record in item id order.
    fn for_each_record(&self, f: &mut dyn FnMut(DerivedRecord) -> Result<()>) -> Result<()>;

    /// Records contributing to the rollup `(kind, key)`, in item id order.
    fn records_for_rollup(&self, kind: RollupKind, key: &str) -> Result<Vec<DerivedRecord>>;
}
