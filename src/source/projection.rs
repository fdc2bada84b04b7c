//! Field projections.
//!
//! A projection is either pure inclusion or pure exclusion. `_id` is always
//! kept. Mixing both styles is rejected when the projection is parsed, so a
//! constructed [`Projection`] is always valid.

use std::collections::BTreeSet;

use serde_json::Map;

use crate::error::ValidationError;
use crate::value::{get_path, truthy, Document, Value, ID_FIELD};

/// Field restriction applied to query results.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Projection {
    Include(BTreeSet<String>),
    Exclude(BTreeSet<String>),
}

impl Projection {
    /// Keep only `fields` (plus `_id`).
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Include(fields.into_iter().map(Into::into).collect())
    }

    /// Drop `fields` (never `_id`).
    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exclude(fields.into_iter().map(Into::into).collect())
    }

    /// Parse a Mongo-style `{field: 1 | 0}` projection.
    ///
    /// `null` and `{}` mean "no projection".
    pub fn from_value(value: &Value) -> Result<Option<Self>, ValidationError> {
        let map = match value {
            Value::Null => return Ok(None),
            Value::Object(map) => map,
            other => {
                return Err(ValidationError::InvalidProjection {
                    reason: format!("projection must be an object, got {other}"),
                })
            }
        };

        if map.is_empty() {
            return Ok(None);
        }

        let included = map.values().filter(|v| truthy(v)).count();
        if included == map.len() {
            Ok(Some(Self::include(map.keys().cloned())))
        } else if included == 0 {
            Ok(Some(Self::exclude(map.keys().cloned())))
        } else {
            Err(ValidationError::InvalidProjection {
                reason: format!(
                    "mix of inclusion and exclusion styles: {}",
                    Value::Object(map.clone())
                ),
            })
        }
    }

    /// The `{field: 1 | 0}` form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let (fields, flag) = match self {
            Self::Include(fields) => (fields, 1),
            Self::Exclude(fields) => (fields, 0),
        };
        Value::Object(fields.iter().map(|f| (f.clone(), Value::from(flag))).collect())
    }

    /// Apply the projection to a document.
    #[must_use]
    pub fn apply(&self, doc: &Document) -> Document {
        let Value::Object(source) = doc else {
            return doc.clone();
        };

        match self {
            Self::Include(fields) => {
                let mut out = Map::new();
                if let Some(id) = source.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
                for field in fields {
                    if let Some(v) = get_path(doc, field) {
                        insert_path(&mut out, field, v.clone());
                    }
                }
                Value::Object(out)
            }
            Self::Exclude(fields) => {
                let mut out = doc.clone();
                for field in fields.iter().filter(|f| f.as_str() != ID_FIELD) {
                    remove_path(&mut out, field);
                }
                out
            }
        }
    }
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

fn remove_path(target: &mut Value, path: &str) {
    match path.split_once('.') {
        None => {
            if let Value::Object(map) = target {
                map.remove(path);
            }
        }
        Some((head, rest)) => {
            if let Some(child) = target.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pure_styles() {
        assert_eq!(
            Projection::from_value(&json!({"a": 1, "b": true})).unwrap(),
            Some(Projection::include(["a", "b"]))
        );
        assert_eq!(
            Projection::from_value(&json!({"a": 0})).unwrap(),
            Some(Projection::exclude(["a"]))
        );
        assert_eq!(Projection::from_value(&json!({})).unwrap(), None);
        assert_eq!(Projection::from_value(&Value::Null).unwrap(), None);
    }

    #[test]
    fn mixed_styles_are_rejected() {
        let err = Projection::from_value(&json!({"a": 1, "b": 0})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidProjection { .. }));
    }

    #[test]
    fn include_keeps_id_and_nested_fields() {
        let doc = json!({"_id": "x", "name": "n", "profile": {"age": 3, "city": "c"}, "secret": 1});
        let out = Projection::include(["name", "profile.age"]).apply(&doc);
        assert_eq!(out, json!({"_id": "x", "name": "n", "profile": {"age": 3}}));
    }

    #[test]
    fn exclude_never_drops_id() {
        let doc = json!({"_id": "x", "name": "n", "profile": {"age": 3, "city": "c"}});
        let out = Projection::exclude(["_id", "profile.city"]).apply(&doc);
        assert_eq!(out, json!({"_id": "x", "name": "n", "profile": {"age": 3}}));
    }

    #[test]
    fn to_value_round_trips() {
        let p = Projection::include(["a", "b"]);
        assert_eq!(Projection::from_value(&p.to_value()).unwrap(), Some(p));
    }
}
