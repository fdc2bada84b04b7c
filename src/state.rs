//! Persistent application-state snapshots.
//!
//! An [`AppState`] is an immutable nested map. Applying a [`FragmentDelta`]
//! yields a new snapshot that shares structure with the old one; the old one
//! stays valid and unchanged.

use im::OrdMap;
use serde_json::Map;

use crate::fragment::{diff, flatten, FragmentDelta};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(Value),
    Branch(OrdMap<String, Node>),
}

impl Node {
    fn to_json(&self) -> Value {
        match self {
            Self::Leaf(v) => v.clone(),
            Self::Branch(children) => branch_to_json(children),
        }
    }
}

fn branch_to_json(children: &OrdMap<String, Node>) -> Value {
    let mut map = Map::new();
    for (key, node) in children {
        map.insert(key.clone(), node.to_json());
    }
    Value::Object(map)
}

/// Immutable snapshot of the derived application state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    root: OrdMap<String, Node>,
}

impl AppState {
    /// An empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot holding every defined leaf of a nested value.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        Self::new().apply(&diff(&flatten(value), &[]))
    }

    /// True when the snapshot holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Read the value at a dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut node = self.root.get(first)?;
        for seg in segments {
            match node {
                Node::Branch(children) => node = children.get(seg)?,
                Node::Leaf(_) => return None,
            }
        }
        Some(node.to_json())
    }

    /// The whole snapshot as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        branch_to_json(&self.root)
    }

    /// Apply a delta, producing the next snapshot.
    ///
    /// Unset paths are removed first, deepest first (reverse-sorted), and a
    /// map emptied by a removal is removed with it. Set paths are then written
    /// in sorted order, creating intermediate maps as needed; a leaf standing
    /// where a map is needed is replaced.
    #[must_use]
    pub fn apply(&self, delta: &FragmentDelta) -> Self {
        let mut root = self.root.clone();

        for path in delta.unset.iter().rev() {
            let segments: Vec<&str> = path.split('.').collect();
            remove_in(&mut root, &segments);
        }

        for (path, value) in &delta.set {
            let segments: Vec<&str> = path.split('.').collect();
            set_in(&mut root, &segments, value.clone());
        }

        Self { root }
    }
}

fn set_in(map: &mut OrdMap<String, Node>, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        map.insert((*head).to_string(), Node::Leaf(value));
        return;
    }

    match map.get_mut(*head) {
        Some(Node::Branch(child)) => set_in(child, rest, value),
        _ => {
            let mut child = OrdMap::new();
            set_in(&mut child, rest, value);
            map.insert((*head).to_string(), Node::Branch(child));
        }
    }
}

fn remove_in(map: &mut OrdMap<String, Node>, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        map.remove(*head);
        return;
    }

    if let Some(Node::Branch(child)) = map.get_mut(*head) {
        remove_in(child, rest);
        if child.is_empty() {
            map.remove(*head);
        }
    }
}
