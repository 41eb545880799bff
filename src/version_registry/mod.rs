mod models;
mod registry;

pub use models::AlgorithmVersion;
pub use registry::{SqliteVersionRegistry, VersionRegistry};
