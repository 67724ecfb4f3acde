//! Streaming extraction of Forbidden Flame / Forbidden Flesh listings from a
//! public-stash-tabs response body.
//!
//! River responses can run to tens of megabytes with thousands of stashes,
//! almost all of them irrelevant. The extractor drives `serde_json` through a
//! [`DeserializeSeed`] so that only one stash tab is materialized at a time:
//! foreign top-level keys are skipped with [`IgnoredAny`], and each element
//! of the `stashes` array is decoded, filtered and dropped before the next
//! one is read.

use std::fmt;
use std::io::Read;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use tracing::debug;

use crate::error::PipelineError;
use crate::price::{self, Price};

static ALLOCATES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^Allocates (.+) if you have the matching modifier").expect("valid regex")
});

// upstream wire types

#[derive(Debug, Deserialize)]
pub struct RawStashTab {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub league: Option<String>,
    /// Tab name; sellers often price a whole tab through it.
    #[serde(default, rename = "stash")]
    pub name: Option<String>,
    #[serde(default)]
    pub items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub requirements: Vec<RawItemProperty>,
    #[serde(default, rename = "explicitMods")]
    pub explicit_mods: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawItemProperty {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub values: Vec<RawPropertyValue>,
}

/// Property values arrive as tuple-shaped `[text, displayMode]` pairs.
#[derive(Debug, Deserialize)]
pub struct RawPropertyValue(pub String, pub i64);

// application types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JewelType {
    ForbiddenFlame,
    ForbiddenFlesh,
}

impl JewelType {
    pub fn from_item_name(name: &str) -> Option<Self> {
        match name {
            "Forbidden Flame" => Some(JewelType::ForbiddenFlame),
            "Forbidden Flesh" => Some(JewelType::ForbiddenFlesh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JewelType::ForbiddenFlame => "Forbidden Flame",
            JewelType::ForbiddenFlesh => "Forbidden Flesh",
        }
    }
}

impl fmt::Display for JewelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One priced target jewel inside a stash tab.
#[derive(Debug, Clone, PartialEq)]
pub struct JewelEntry {
    pub item_id: String,
    pub jewel_type: JewelType,
    pub class: String,
    pub node: String,
    pub price: Price,
}

/// The state of one stash tab as of a single change event. Only produced
/// when at least one target jewel survived extraction.
#[derive(Debug, Clone)]
pub struct StashSnapshot {
    pub stash_id: String,
    pub league: String,
    pub items: Vec<JewelEntry>,
    pub change_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Stream-parse a river response body, returning a snapshot for every stash
/// that contains at least one priced target jewel.
pub fn extract_stashes<R: Read>(
    body: R,
    change_id: &str,
) -> Result<Vec<StashSnapshot>, PipelineError> {
    let recorded_at = Utc::now();
    let mut out = Vec::new();

    let mut de = serde_json::Deserializer::from_reader(body);
    RiverDocument {
        out: &mut out,
        change_id,
        recorded_at,
    }
    .deserialize(&mut de)
    .map_err(|e| PipelineError::Decode(format!("river body: {e}")))?;

    Ok(out)
}

struct RiverDocument<'a> {
    out: &'a mut Vec<StashSnapshot>,
    change_id: &'a str,
    recorded_at: DateTime<Utc>,
}

impl<'de, 'a> DeserializeSeed<'de> for RiverDocument<'a> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, 'a> Visitor<'de> for RiverDocument<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a public-stash-tabs response object")
    }

    fn visit_map<A: MapAccess<'de>>(mut self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "stashes" {
                map.next_value_seed(StashArray {
                    out: &mut *self.out,
                    change_id: self.change_id,
                    recorded_at: self.recorded_at,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct StashArray<'a> {
    out: &'a mut Vec<StashSnapshot>,
    change_id: &'a str,
    recorded_at: DateTime<Utc>,
}

impl<'de, 'a> DeserializeSeed<'de> for StashArray<'a> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a> Visitor<'de> for StashArray<'a> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of stash tabs")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(tab) = seq.next_element::<RawStashTab>()? {
            if let Some(snapshot) = snapshot_from_tab(tab, self.change_id, self.recorded_at) {
                self.out.push(snapshot);
            }
        }
        Ok(())
    }
}

fn snapshot_from_tab(
    tab: RawStashTab,
    change_id: &str,
    recorded_at: DateTime<Utc>,
) -> Option<StashSnapshot> {
    let mut jewels = Vec::new();
    for item in &tab.items {
        if let Some(jewel) = jewel_from_item(item, &tab) {
            debug!(
                "{} ({}|{}) found at price {} {}",
                jewel.jewel_type, jewel.class, jewel.node, jewel.price.amount, jewel.price.currency
            );
            jewels.push(jewel);
        }
    }

    if jewels.is_empty() {
        return None;
    }

    Some(StashSnapshot {
        stash_id: tab.id,
        league: tab.league.unwrap_or_default(),
        items: jewels,
        change_id: change_id.to_string(),
        recorded_at,
    })
}

/// Pull a [`JewelEntry`] out of a raw item, or `None` when the item is not a
/// target jewel, is missing the expected metadata, or carries no price.
fn jewel_from_item(item: &RawItem, tab: &RawStashTab) -> Option<JewelEntry> {
    let jewel_type = JewelType::from_item_name(&item.name)?;
    let class = item.requirements.first()?.values.first()?.0.clone();
    let node = ALLOCATES_RE
        .captures(item.explicit_mods.first()?)?
        .get(1)?
        .as_str()
        .to_string();
    let price = price::find_price(
        item.note.as_deref().unwrap_or(""),
        tab.name.as_deref().unwrap_or(""),
    )?;

    Some(JewelEntry {
        item_id: item.id.clone(),
        jewel_type,
        class,
        node,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAME_MOD: &str = "Allocates Inner Conviction if you have the matching modifier";

    fn item_json(id: &str, name: &str, note: &str) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "name": "{name}",
                "note": "{note}",
                "typeLine": "Cobalt Jewel",
                "ilvl": 84,
                "requirements": [{{"name": "Class:", "values": [["Witch", 0]]}}],
                "explicitMods": ["{FLAME_MOD}"]
            }}"#
        )
    }

    #[test]
    fn test_extracts_priced_target_jewels() {
        let flame = item_json("jewel-1", "Forbidden Flame", "~price 5 chaos");
        let sword = item_json("sword-1", "Starforge", "~price 1 divine");
        let body = format!(
            r#"{{"next_change_id": "1-2-3", "stashes": [
                {{"id": "stash-a", "league": "Settlers", "stash": "sell", "items": [{flame}, {sword}]}}
            ]}}"#
        );

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].stash_id, "stash-a");
        assert_eq!(tabs[0].league, "Settlers");
        assert_eq!(tabs[0].change_id, "0-0-0");
        assert_eq!(tabs[0].items.len(), 1);

        let jewel = &tabs[0].items[0];
        assert_eq!(jewel.item_id, "jewel-1");
        assert_eq!(jewel.jewel_type, JewelType::ForbiddenFlame);
        assert_eq!(jewel.class, "Witch");
        assert_eq!(jewel.node, "Inner Conviction");
        assert_eq!(jewel.price.amount, 5.0);
        assert_eq!(jewel.price.currency, "chaos");
    }

    #[test]
    fn test_unpriced_jewels_are_dropped() {
        let flame = item_json("jewel-1", "Forbidden Flesh", "");
        let body = format!(
            r#"{{"stashes": [{{"id": "stash-a", "stash": "dump tab", "items": [{flame}]}}]}}"#
        );

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert!(tabs.is_empty());
    }

    #[test]
    fn test_tab_level_price_applies() {
        let flame = item_json("jewel-1", "Forbidden Flame", "");
        let body = format!(
            r#"{{"stashes": [{{"id": "stash-a", "stash": "~price 3 divine", "items": [{flame}]}}]}}"#
        );

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].items[0].price, Price {
            amount: 3.0,
            currency: "divine".to_string(),
        });
    }

    #[test]
    fn test_stashes_without_targets_produce_no_snapshot() {
        let sword = item_json("sword-1", "Starforge", "~price 1 divine");
        let body = format!(
            r#"{{"stashes": [
                {{"id": "stash-a", "items": [{sword}]}},
                {{"id": "stash-b", "items": []}}
            ]}}"#
        );

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert!(tabs.is_empty());
    }

    #[test]
    fn test_foreign_top_level_keys_are_skipped() {
        let flame = item_json("jewel-1", "Forbidden Flame", "~price 1 chaos");
        let body = format!(
            r#"{{
                "meta": {{"nested": [1, 2, {{"deep": true}}]}},
                "stashes": [{{"id": "stash-a", "items": [{flame}]}}],
                "trailer": "ignored"
            }}"#
        );

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert_eq!(tabs.len(), 1);
    }

    #[test]
    fn test_items_missing_metadata_are_skipped() {
        // a target jewel with no requirements and no mods must not kill the
        // stream, just the item
        let body = r#"{"stashes": [{
            "id": "stash-a",
            "items": [{"id": "jewel-1", "name": "Forbidden Flame", "note": "~price 1 chaos"}]
        }]}"#;

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert!(tabs.is_empty());
    }

    #[test]
    fn test_fractional_prices_and_missing_league() {
        let flesh = item_json("jewel-9", "Forbidden Flesh", "~price 2.5 divine");
        let body = format!(r#"{{"stashes": [{{"id": "stash-a", "items": [{flesh}]}}]}}"#);

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].league, "");
        assert_eq!(tabs[0].items[0].price.amount, 2.5);
    }

    #[test]
    fn test_stash_order_is_preserved() {
        let first = item_json("jewel-1", "Forbidden Flame", "~price 1 chaos");
        let second = item_json("jewel-2", "Forbidden Flame", "~price 2 chaos");
        let body = format!(
            r#"{{"stashes": [
                {{"id": "stash-a", "items": [{first}]}},
                {{"id": "stash-b", "items": [{second}]}}
            ]}}"#
        );

        let tabs = extract_stashes(body.as_bytes(), "0-0-0").unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].stash_id, "stash-a");
        assert_eq!(tabs[1].stash_id, "stash-b");
    }

    #[test]
    fn test_truncated_body_is_a_decode_error() {
        let body = r#"{"stashes": [{"id": "stash-a""#;
        assert!(matches!(
            extract_stashes(body.as_bytes(), "0-0-0"),
            Err(PipelineError::Decode(_))
        ));
    }
}
