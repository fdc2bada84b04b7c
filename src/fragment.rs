//! Fragment algebra.
//!
//! A fragment is a piece of derived application state. Rules produce fragments
//! as nested values; the engine flattens them to dotted paths, diffs them
//! against what the rule produced last time, and hands the resulting
//! [`FragmentDelta`] to the merge stage.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A nested value flattened to `(dotted.path, leaf)` pairs.
pub type FlatFragment = Vec<(String, Value)>;

/// Paths to write and paths to remove.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentDelta {
    /// Paths to write, with their new leaf values.
    pub set: BTreeMap<String, Value>,
    /// Paths to remove.
    pub unset: BTreeSet<String>,
}

impl FragmentDelta {
    /// An empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the delta neither sets nor unsets anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Add a path to `set`.
    #[must_use]
    pub fn with_set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.set.insert(path.into(), value);
        self
    }

    /// Add a path to `unset`.
    #[must_use]
    pub fn with_unset(mut self, path: impl Into<String>) -> Self {
        self.unset.insert(path.into());
        self
    }

    /// Merge `other` into `self`.
    ///
    /// `set` and `unset` are unioned key-wise. When both sides set an array
    /// at the same path the arrays are concatenated in call order, otherwise
    /// `other` wins.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.merge_in(other);
        self
    }

    /// In-place form of [`FragmentDelta::merge`].
    pub fn merge_in(&mut self, other: Self) {
        for (path, value) in other.set {
            match self.set.get_mut(&path) {
                Some(Value::Array(existing)) if value.is_array() => {
                    if let Value::Array(mut more) = value {
                        existing.append(&mut more);
                    }
                }
                _ => {
                    self.set.insert(path, value);
                }
            }
        }
        self.unset.extend(other.unset);
    }
}

/// Flatten a nested value into dotted-path leaves.
///
/// Objects are descended into; arrays and scalars are leaves. A top-level
/// value that is not an object flattens to nothing, and so does an empty
/// object at any depth.
#[must_use]
pub fn flatten(value: &Value) -> FlatFragment {
    let mut out = Vec::new();
    if let Value::Object(map) = value {
        for (key, child) in map {
            flatten_into(child, key.clone(), &mut out);
        }
    }
    out
}

fn flatten_into(value: &Value, path: String, out: &mut FlatFragment) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, format!("{path}.{key}"), out);
            }
        }
        leaf => out.push((path, leaf.clone())),
    }
}

/// Diff a freshly flattened fragment against the previous one.
///
/// Every defined new leaf is set. A path is unset when its new leaf is
/// undefined (`null`) or when it only exists in `old_flat`.
///
/// `null` doubles as undefined, so a fragment cannot store a literal `null`:
/// such a leaf removes its path from the state instead.
#[must_use]
pub fn diff(new_flat: &[(String, Value)], old_flat: &[(String, Value)]) -> FragmentDelta {
    let mut delta = FragmentDelta::new();

    for (path, value) in new_flat {
        if value.is_null() {
            delta.unset.insert(path.clone());
        } else {
            delta.set.insert(path.clone(), value.clone());
        }
    }

    for (path, _) in old_flat {
        if !delta.set.contains_key(path) {
            delta.unset.insert(path.clone());
        }
    }

    delta
}
