//! Change detection between two descriptions of the same subject.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Description;

/// One field-level change between an old and a new description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DescriptionChange {
    TextChanged {
        old: String,
        new: String,
        /// Word-level Jaccard similarity of the two texts (0.0 - 1.0).
        similarity: f32,
    },
    TagAdded {
        tag: String,
    },
    TagRemoved {
        tag: String,
    },
    AttributeAdded {
        key: String,
        value: Value,
    },
    AttributeRemoved {
        key: String,
        value: Value,
    },
    AttributeChanged {
        key: String,
        old: Value,
        new: Value,
    },
}

/// Compute the structured diff from `old` to `new`.
///
/// Output is deterministic: text first, then tags, then attributes, each in
/// lexical order.
pub fn diff_descriptions(old: &Description, new: &Description) -> Vec<DescriptionChange> {
    let mut changes = Vec::new();

    if old.text.trim() != new.text.trim() {
        changes.push(DescriptionChange::TextChanged {
            old: old.text.clone(),
            new: new.text.clone(),
            similarity: word_jaccard(&old.text, &new.text),
        });
    }

    let old_tags = normalized_tags(&old.tags);
    let new_tags = normalized_tags(&new.tags);
    for tag in new_tags.difference(&old_tags) {
        changes.push(DescriptionChange::TagAdded { tag: tag.clone() });
    }
    for tag in old_tags.difference(&new_tags) {
        changes.push(DescriptionChange::TagRemoved { tag: tag.clone() });
    }

    let keys: BTreeSet<&String> = old
        .attributes
        .keys()
        .chain(new.attributes.keys())
        .filter(|k| !k.starts_with('_'))
        .collect();
    for key in keys {
        match (old.attributes.get(key), new.attributes.get(key)) {
            (None, Some(value)) => changes.push(DescriptionChange::AttributeAdded {
                key: key.clone(),
                value: value.clone(),
            }),
            (Some(value), None) => changes.push(DescriptionChange::AttributeRemoved {
                key: key.clone(),
                value: value.clone(),
            }),
            (Some(a), Some(b)) if a != b => changes.push(DescriptionChange::AttributeChanged {
                key: key.clone(),
                old: a.clone(),
                new: b.clone(),
            }),
            _ => {}
        }
    }

    changes
}

/// Jaccard similarity over lowercase whitespace-separated words.
pub fn word_jaccard(a: &str, b: &str) -> f32 {
    let words_a: BTreeSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let words_b: BTreeSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f32 / union as f32
}

fn normalized_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
