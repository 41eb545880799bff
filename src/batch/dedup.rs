//! Collapsing raw events into one work unit per item.

use crate::identity::{ItemId, NaturalKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One listening event as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub context: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub features: Option<Value>,
}

impl RawEvent {
    pub fn new(name: &str, group: &str, context: &str, timestamp: i64) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            context: context.to_string(),
            timestamp,
            tags: None,
            features: None,
        }
    }

    fn problem(&self) -> Option<String> {
        if self.name.trim().is_empty() {
            Some("event has a blank name".to_string())
        } else if self.group.trim().is_empty() {
            Some("event has a blank group".to_string())
        } else if self.timestamp < 0 {
            Some(format!("event has a negative timestamp {}", self.timestamp))
        } else {
            None
        }
    }
}

/// An input slot: a parsed event, or input that could not be parsed at all.
#[derive(Debug, Clone, PartialEq)]
pub enum EventInput {
    Event(RawEvent),
    Malformed(String),
}

impl From<RawEvent> for EventInput {
    fn from(event: RawEvent) -> Self {
        EventInput::Event(event)
    }
}

impl EventInput {
    /// Parses one JSON line. Parse errors become [`EventInput::Malformed`].
    pub fn from_json_line(line: &str) -> Self {
        match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => EventInput::Event(event),
            Err(e) => EventInput::Malformed(format!("unparseable event: {}", e)),
        }
    }
}

/// All events of one item, plus the enrichment they carried.
///
/// Serialized as the record's raw payload, so a recompute can re-score the
/// item without the original input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub item_id: ItemId,
    pub key: NaturalKey,
    /// Display strings of the first event seen for the item.
    pub display_name: String,
    pub display_group: String,
    pub display_context: String,
    pub timestamps: Vec<i64>,
    pub tags: Vec<String>,
    pub features: Option<Value>,
    /// True when some event carried tags, so enrichment can be skipped.
    pub tags_supplied: bool,
}

impl WorkUnit {
    fn from_event(item_id: ItemId, key: NaturalKey, event: RawEvent) -> Self {
        let tags_supplied = event.tags.is_some();
        Self {
            item_id,
            key,
            display_name: event.name.trim().to_string(),
            display_group: event.group.trim().to_string(),
            display_context: event.context.trim().to_string(),
            timestamps: vec![event.timestamp],
            tags: event.tags.unwrap_or_default(),
            features: event.features,
            tags_supplied,
        }
    }

    fn absorb(&mut self, event: RawEvent) {
        self.timestamps.push(event.timestamp);
        if let Some(tags) = event.tags {
            self.tags_supplied = true;
            for tag in tags {
                if !self.tags.contains(&tag) {
                    self.tags.push(tag);
                }
            }
        }
        if self.features.is_none() {
            self.features = event.features;
        }
    }

    pub fn play_count(&self) -> u64 {
        self.timestamps.len() as u64
    }

    pub fn first_seen(&self) -> i64 {
        self.timestamps.iter().copied().min().unwrap_or_default()
    }

    pub fn last_seen(&self) -> i64 {
        self.timestamps.iter().copied().max().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingItem {
    Unit(WorkUnit),
    Invalid { marker: String, reason: String },
}

impl PendingItem {
    /// Stable marker recorded in checkpoints and error logs.
    pub fn marker(&self) -> String {
        match self {
            PendingItem::Unit(unit) => unit.item_id.to_string(),
            PendingItem::Invalid { marker, .. } => marker.clone(),
        }
    }
}

/// Collapses events by item id, keeping first-appearance order. Malformed
/// events stay in place as [`PendingItem::Invalid`].
pub fn deduplicate<I>(events: I) -> Vec<PendingItem>
where
    I: IntoIterator,
    I::Item: Into<EventInput>,
{
    let mut items: Vec<PendingItem> = Vec::new();
    let mut index_by_id: HashMap<ItemId, usize> = HashMap::new();

    for (input_index, input) in events.into_iter().enumerate() {
        let event = match input.into() {
            EventInput::Event(event) => event,
            EventInput::Malformed(reason) => {
                items.push(PendingItem::Invalid {
                    marker: format!("input#{}", input_index),
                    reason,
                });
                continue;
            }
        };
        if let Some(reason) = event.problem() {
            items.push(PendingItem::Invalid {
                marker: format!("input#{}", input_index),
                reason,
            });
            continue;
        }

        let key = NaturalKey::new(&event.name, &event.group, &event.context);
        let item_id = key.item_id();
        match index_by_id.get(&item_id) {
            Some(&slot) => {
                if let PendingItem::Unit(unit) = &mut items[slot] {
                    unit.absorb(event);
                }
            }
            None => {
                index_by_id.insert(item_id.clone(), items.len());
                items.push(PendingItem::Unit(WorkUnit::from_event(item_id, key, event)));
            }
        }
    }
    items
}
