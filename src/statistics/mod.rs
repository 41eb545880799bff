mod cache;
mod models;

pub use cache::StatisticsCache;
pub use models::{GlobalStatistics, ItemRef, Percentiles};
