//! Stable item identity derived from a natural key.

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const ID_LEN: usize = 32;
const KEY_SEPARATOR: char = '\u{1f}';

/// Trims, lowercases and collapses internal whitespace runs to one space.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The (name, group, context) triple identifying an item, e.g.
/// (track title, artist, album). Always held in normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub name: String,
    pub group: String,
    pub context: String,
}

impl NaturalKey {
    pub fn new(name: &str, group: &str, context: &str) -> Self {
        Self {
            name: normalize(name),
            group: normalize(group),
            context: normalize(context),
        }
    }

    pub fn item_id(&self) -> ItemId {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(KEY_SEPARATOR.to_string().as_bytes());
        hasher.update(self.group.as_bytes());
        hasher.update(KEY_SEPARATOR.to_string().as_bytes());
        hasher.update(self.context.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        ItemId(digest[..ID_LEN].to_string())
    }

    /// Text indexed for free-text search.
    pub fn search_text(&self) -> String {
        format!("{} {} {}", self.name, self.group, self.context)
            .trim()
            .to_string()
    }
}

/// 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn from_key(name: &str, group: &str, context: &str) -> Self {
        NaturalKey::new(name, group, context).item_id()
    }

    /// Accepts an already-computed identifier, e.g. one read back from storage.
    pub fn parse(s: &str) -> Result<Self> {
        if Self::is_well_formed(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(LedgerError::Validation(format!(
                "item id must be {} lowercase hex characters, got {:?}",
                ID_LEN, s
            )))
        }
    }

    pub fn is_well_formed(s: &str) -> bool {
        s.len() == ID_LEN && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
