mod database;
mod versioned_schema;

pub use database::Database;
pub use versioned_schema::{
    Column, ForeignKey, ForeignKeyOnChange, Index, SqlType, Table, VersionedSchema,
    BASE_DB_VERSION,
};
