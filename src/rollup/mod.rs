mod models;
mod store;
pub mod weighting;

pub use models::{GroupProfile, RollupKind};
pub use store::{RollupStore, RollupSummary};
