//! SQLite schema definitions for the ledger database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, Index, SqlType, Table, VersionedSchema,
};

const ALGORITHM_VERSIONS_TABLE: Table = Table {
    name: "algorithm_versions",
    columns: &[
        sqlite_column!("version_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("label", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "is_active",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[Index {
        name: "idx_algorithm_versions_single_active",
        columns: "is_active",
        unique: true,
        predicate: Some("is_active = 1"),
    }],
    unique_constraints: &[],
};

const ALGORITHM_VERSION_FK: ForeignKey = ForeignKey {
    foreign_table: "algorithm_versions",
    foreign_column: "version_id",
    on_delete: ForeignKeyOnChange::Restrict,
};

const ITEMS_TABLE: Table = Table {
    name: "items",
    columns: &[
        sqlite_column!("item_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("group_key", &SqlType::Text, non_null = true),
        sqlite_column!("context", &SqlType::Text, non_null = true),
        // Normalized "name group context", matched token by token
        sqlite_column!("search_text", &SqlType::Text, non_null = true),
        sqlite_column!("raw_blob", &SqlType::Text, non_null = true), // JSON VersionedBlob
        sqlite_column!("computed_blob", &SqlType::Text, non_null = true), // JSON VersionedBlob
        sqlite_column!("confidence", &SqlType::Real, non_null = true),
        sqlite_column!(
            "algorithm_version",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ALGORITHM_VERSION_FK)
        ),
        sqlite_column!("computed_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "is_valid",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("score", &SqlType::Real, non_null = true),
        sqlite_column!("play_count", &SqlType::Integer, non_null = true),
        sqlite_column!("first_seen", &SqlType::Integer, non_null = true),
        sqlite_column!("last_seen", &SqlType::Integer, non_null = true),
        sqlite_column!("tags_json", &SqlType::Text, non_null = true), // JSON array
    ],
    indices: &[
        Index::plain("idx_items_score", "score"),
        Index::plain("idx_items_computed_at", "computed_at"),
        Index::plain("idx_items_group_key", "group_key"),
        Index::plain("idx_items_version", "algorithm_version"),
    ],
    unique_constraints: &[],
};

const ITEM_FK: ForeignKey = ForeignKey {
    foreign_table: "items",
    foreign_column: "item_id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const ITEM_FIELDS_TABLE: Table = Table {
    name: "item_fields",
    columns: &[
        sqlite_column!(
            "item_id",
            &SqlType::Text,
            is_primary_key = true,
            non_null = true,
            foreign_key = Some(&ITEM_FK)
        ),
        sqlite_column!("field", &SqlType::Text, is_primary_key = true, non_null = true),
        sqlite_column!("value", &SqlType::Real, non_null = true),
    ],
    indices: &[Index::plain("idx_item_fields_field_value", "field, value")],
    unique_constraints: &[],
};

const ITEM_TAGS_TABLE: Table = Table {
    name: "item_tags",
    columns: &[
        sqlite_column!(
            "item_id",
            &SqlType::Text,
            is_primary_key = true,
            non_null = true,
            foreign_key = Some(&ITEM_FK)
        ),
        sqlite_column!("tag", &SqlType::Text, is_primary_key = true, non_null = true),
    ],
    indices: &[Index::plain("idx_item_tags_tag", "tag")],
    unique_constraints: &[],
};

const GROUP_PROFILES_TABLE: Table = Table {
    name: "group_profiles",
    columns: &[
        sqlite_column!("kind", &SqlType::Text, is_primary_key = true, non_null = true),
        sqlite_column!(
            "rollup_key",
            &SqlType::Text,
            is_primary_key = true,
            non_null = true
        ),
        sqlite_column!("item_count", &SqlType::Integer, non_null = true),
        sqlite_column!("total_plays", &SqlType::Integer, non_null = true),
        sqlite_column!("weighted_score", &SqlType::Real, non_null = true),
        sqlite_column!("profile_json", &SqlType::Text, non_null = true),
    ],
    indices: &[Index::plain(
        "idx_group_profiles_kind_score",
        "kind, weighted_score",
    )],
    unique_constraints: &[],
};

const BATCH_JOBS_TABLE: Table = Table {
    name: "batch_jobs",
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("total_items", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "processed_items",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "failed_items",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("checkpoint_json", &SqlType::Text),
        sqlite_column!("error_log_json", &SqlType::Text, non_null = true),
        sqlite_column!("target_version", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("failure_reason", &SqlType::Text),
        // Refreshed after every chunk while the job runs
        sqlite_column!("heartbeat_at", &SqlType::Integer),
    ],
    indices: &[Index::plain("idx_batch_jobs_status", "status")],
    unique_constraints: &[],
};

/// Single row, always `id = 1`.
const GLOBAL_STATS_TABLE: Table = Table {
    name: "global_stats",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true), // JSON GlobalStatistics
        sqlite_column!("refreshed_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

pub const LEDGER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        ALGORITHM_VERSIONS_TABLE,
        ITEMS_TABLE,
        ITEM_FIELDS_TABLE,
        ITEM_TAGS_TABLE,
        GROUP_PROFILES_TABLE,
        BATCH_JOBS_TABLE,
        GLOBAL_STATS_TABLE,
    ],
    migration: None,
}];
