use serde::{Deserialize, Serialize};

/// A registered scoring algorithm version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmVersion {
    pub version_id: String,
    pub label: String,
    /// Unix seconds.
    pub created_at: i64,
    pub is_active: bool,
}

impl AlgorithmVersion {
    pub fn new(version_id: &str, label: &str, created_at: i64, is_active: bool) -> Self {
        Self {
            version_id: version_id.to_string(),
            label: label.to_string(),
            created_at,
            is_active,
        }
    }
}
