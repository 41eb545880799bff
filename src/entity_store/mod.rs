mod models;
mod store;
mod trait_def;

pub use models::{
    ComputedOutput, DerivedRecord, SortOrder, UpsertOutcome, VersionedBlob,
    COMPUTED_SCHEMA_VERSION, RAW_SCHEMA_VERSION,
};
pub(crate) use store::{query_records, RECORD_COLUMNS};
pub use store::SqliteEntityStore;
pub use trait_def::EntityStore;
