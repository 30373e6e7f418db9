//! NIP-01 subscription filters.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Tag keys beyond which a filter counts as complex.
const COMPLEX_TAG_KEYS: usize = 2;
/// Combined tag keys and kinds beyond which a filter counts as complex.
const COMPLEX_ITEMS: usize = 4;

/// Query predicate over event attributes. All present constraints must hold;
/// values inside a single constraint are alternatives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// `#x` constraints keyed by the single-letter tag name.
    pub tags: BTreeMap<char, Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a `Filter` from a filter JSON object. Unknown keys and values of
    /// the wrong type are ignored; `None` means the value is not an object.
    pub fn from_value(val: &Value) -> Option<Self> {
        let obj = val.as_object()?;
        let strings = |key: &str| {
            obj.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
        };
        let kinds = obj.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                .collect()
        });
        let mut tags = BTreeMap::new();
        for (key, value) in obj {
            let mut chars = key.chars();
            if let (Some('#'), Some(letter), None) = (chars.next(), chars.next(), chars.next()) {
                if let Some(arr) = value.as_array() {
                    let values = arr
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect();
                    tags.insert(letter, values);
                }
            }
        }
        Some(Filter {
            ids: strings("ids"),
            authors: strings("authors"),
            kinds,
            tags,
            since: obj.get("since").and_then(|v| v.as_u64()),
            until: obj.get("until").and_then(|v| v.as_u64()),
            limit: obj
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        })
    }

    /// Serialize back into the JSON shape accepted by relays.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        let strings = |v: &[String]| Value::Array(v.iter().cloned().map(Value::String).collect());
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            let arr = kinds.iter().map(|k| Value::Number((*k).into())).collect();
            obj.insert("kinds".into(), Value::Array(arr));
        }
        for (letter, values) in &self.tags {
            obj.insert(format!("#{letter}"), strings(values));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        Value::Object(obj)
    }

    /// Check whether an event satisfies every constraint.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if !self.in_time_range(ev.created_at) {
            return false;
        }
        self.tags.iter().all(|(letter, values)| {
            let name = letter.to_string();
            let hit = ev.tag_values(&name).any(|v| values.iter().any(|w| w == v));
            hit
        })
    }

    pub fn in_time_range(&self, created_at: u64) -> bool {
        self.since.map_or(true, |s| created_at >= s) && self.until.map_or(true, |u| created_at <= u)
    }

    /// True when `since` lies after `until` or the limit is zero.
    pub fn is_unsatisfiable(&self) -> bool {
        matches!((self.since, self.until), (Some(s), Some(u)) if s > u) || self.limit == Some(0)
    }

    /// Number of enumerated values across ids, authors, kinds and tag constraints.
    pub fn constraint_count(&self) -> usize {
        let len = |v: &Option<Vec<_>>| v.as_ref().map_or(0, Vec::len);
        len(&self.ids)
            + len(&self.authors)
            + self.kinds.as_ref().map_or(0, Vec::len)
            + self.tags.values().map(Vec::len).sum::<usize>()
    }

    /// A filter without any enumerated constraint would match the whole store.
    pub fn is_empty(&self) -> bool {
        self.constraint_count() == 0
    }

    /// Many tag keys combined with many kinds are expensive to index.
    pub fn is_complex(&self) -> bool {
        let tag_keys = self.tags.len();
        let items = tag_keys + self.kinds.as_ref().map_or(0, Vec::len);
        items > COMPLEX_ITEMS && tag_keys > COMPLEX_TAG_KEYS
    }
}
