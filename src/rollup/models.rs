use super::weighting::{recency_weight, WeightedMean};
use crate::entity_store::DerivedRecord;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a rollup key groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupKind {
    /// Keyed by the record's normalized group key (the artist).
    Group,
    /// Keyed by each of the record's tags (genre-like).
    Tag,
    /// Keyed by the `YYYY-MM` month of the record's `last_seen`, UTC.
    Period,
}

impl RollupKind {
    pub const ALL: [RollupKind; 3] = [RollupKind::Group, RollupKind::Tag, RollupKind::Period];

    pub fn as_str(&self) -> &'static str {
        match self {
            RollupKind::Group => "group",
            RollupKind::Tag => "tag",
            RollupKind::Period => "period",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group" => Some(RollupKind::Group),
            "tag" => Some(RollupKind::Tag),
            "period" => Some(RollupKind::Period),
            _ => None,
        }
    }

    pub fn period_key(timestamp: i64) -> String {
        DateTime::<Utc>::from_timestamp(timestamp, 0)
            .unwrap_or_default()
            .format("%Y-%m")
            .to_string()
    }

    /// Unix second range `[start, end)` covered by a `YYYY-MM` period key.
    pub fn period_bounds(key: &str) -> Result<(i64, i64)> {
        let start = NaiveDate::parse_from_str(&format!("{}-01", key), "%Y-%m-%d")
            .map_err(|_| LedgerError::Validation(format!("invalid period key {:?}", key)))?;
        let (year, month) = if start.month() == 12 {
            (start.year() + 1, 1)
        } else {
            (start.year(), start.month() + 1)
        };
        let end = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| LedgerError::Validation(format!("invalid period key {:?}", key)))?;
        Ok((
            start.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp(),
            end.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp(),
        ))
    }

    /// The keys a record contributes to for this kind.
    pub fn keys_for(&self, record: &DerivedRecord) -> Vec<String> {
        match self {
            RollupKind::Group => vec![record.group_key.clone()],
            RollupKind::Tag => record.tags.clone(),
            RollupKind::Period => vec![Self::period_key(record.last_seen)],
        }
    }
}

impl std::fmt::Display for RollupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subset of a record that feeds a rollup.
#[derive(Debug, Clone)]
pub(crate) struct ProfileInput {
    pub score: f64,
    pub confidence: f64,
    pub play_count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub fields: BTreeMap<String, f64>,
}

impl From<&DerivedRecord> for ProfileInput {
    fn from(record: &DerivedRecord) -> Self {
        Self {
            score: record.score,
            confidence: record.confidence,
            play_count: record.play_count,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            fields: record.fields(),
        }
    }
}

/// Weighted aggregate over the records sharing one rollup key.
///
/// Contains no wall-clock data: rebuilding it from the same records always
/// yields the same value and the same [`GroupProfile::canonical_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProfile {
    pub kind: RollupKind,
    pub key: String,
    pub item_count: usize,
    pub total_plays: u64,
    pub weighted_score: f64,
    pub weighted_fields: BTreeMap<String, f64>,
    pub min_score: f64,
    pub max_score: f64,
    /// Population variance of the unweighted scores.
    pub score_variance: f64,
    pub mean_confidence: f64,
    pub first_seen: i64,
    pub last_seen: i64,
    /// False when every weight was 0 and plain averages were used.
    pub recency_weighted: bool,
}

impl GroupProfile {
    /// Inputs must be in item id order for the float sums to be reproducible.
    pub(crate) fn build(kind: RollupKind, key: &str, inputs: &[ProfileInput]) -> Option<Self> {
        if inputs.is_empty() {
            return None;
        }
        let reference = inputs.iter().map(|i| i.last_seen).max().unwrap_or_default();

        let mut score = WeightedMean::default();
        let mut fields: BTreeMap<String, WeightedMean> = BTreeMap::new();
        let mut min_score = f64::INFINITY;
        let mut max_score = f64::NEG_INFINITY;
        let mut score_sum = 0.0;
        let mut confidence_sum = 0.0;
        let mut total_plays = 0u64;
        let mut first_seen = i64::MAX;

        for input in inputs {
            let weight = recency_weight(input.play_count, input.last_seen, reference);
            score.add(input.score, weight);
            for (field, value) in &input.fields {
                fields.entry(field.clone()).or_default().add(*value, weight);
            }
            min_score = min_score.min(input.score);
            max_score = max_score.max(input.score);
            score_sum += input.score;
            confidence_sum += input.confidence;
            total_plays += input.play_count;
            first_seen = first_seen.min(input.first_seen);
        }

        let n = inputs.len() as f64;
        let mean = score_sum / n;
        let score_variance = inputs
            .iter()
            .map(|i| (i.score - mean).powi(2))
            .sum::<f64>()
            / n;

        Some(Self {
            kind,
            key: key.to_string(),
            item_count: inputs.len(),
            total_plays,
            weighted_score: score.value().unwrap_or_default(),
            weighted_fields: fields
                .into_iter()
                .filter_map(|(field, mean)| mean.value().map(|v| (field, v)))
                .collect(),
            min_score,
            max_score,
            score_variance,
            mean_confidence: confidence_sum / n,
            first_seen,
            last_seen: reference,
            recency_weighted: score.is_weighted(),
        })
    }

    /// Stable serialization used for storage and reproducibility checks.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(score: f64, plays: u64, last_seen: i64) -> ProfileInput {
        ProfileInput {
            score,
            confidence: 0.5,
            play_count: plays,
            first_seen: last_seen - 10,
            last_seen,
            fields: BTreeMap::from([("energy".to_string(), score / 10.0)]),
        }
    }

    #[test]
    fn test_period_key_and_bounds() {
        assert_eq!(RollupKind::period_key(1_704_067_200), "2024-01");
        assert_eq!(RollupKind::period_key(1_704_067_199), "2023-12");

        let (start, end) = RollupKind::period_bounds("2023-12").unwrap();
        assert_eq!(start, 1_701_388_800);
        assert_eq!(end, 1_704_067_200);
        assert!(RollupKind::period_bounds("december").is_err());
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in RollupKind::ALL {
            assert_eq!(RollupKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RollupKind::parse("genre"), None);
    }

    #[test]
    fn test_build_empty_is_none() {
        assert!(GroupProfile::build(RollupKind::Group, "x", &[]).is_none());
    }

    #[test]
    fn test_build_uniform_scores() {
        let inputs = vec![input(50.0, 1, 100), input(50.0, 9, 50), input(50.0, 3, 0)];
        let profile = GroupProfile::build(RollupKind::Group, "artist", &inputs).unwrap();
        assert_eq!(profile.item_count, 3);
        assert_eq!(profile.total_plays, 13);
        assert!((profile.weighted_score - 50.0).abs() < 1e-9);
        assert_eq!(profile.score_variance, 0.0);
        assert_eq!(profile.first_seen, -10);
        assert_eq!(profile.last_seen, 100);
        assert!(profile.recency_weighted);
    }

    #[test]
    fn test_build_favors_frequent_items() {
        let inputs = vec![input(10.0, 1, 100), input(90.0, 100, 100)];
        let profile = GroupProfile::build(RollupKind::Tag, "rock", &inputs).unwrap();
        assert!(profile.weighted_score > 50.0);
        assert_eq!(profile.min_score, 10.0);
        assert_eq!(profile.max_score, 90.0);
        assert_eq!(profile.score_variance, 1600.0);
        assert!(profile.weighted_fields["energy"] > 5.0);
    }

    #[test]
    fn test_build_zero_plays_uses_plain_average() {
        let inputs = vec![input(10.0, 0, 100), input(30.0, 0, 100)];
        let profile = GroupProfile::build(RollupKind::Group, "g", &inputs).unwrap();
        assert_eq!(profile.weighted_score, 20.0);
        assert!(!profile.recency_weighted);
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let inputs = vec![input(12.5, 4, 1000), input(77.25, 2, 400)];
        let a = GroupProfile::build(RollupKind::Group, "g", &inputs).unwrap();
        let b = GroupProfile::build(RollupKind::Group, "g", &inputs).unwrap();
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
    }
}
