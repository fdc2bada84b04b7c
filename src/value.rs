//! Value helpers shared by the engine.
//!
//! Every variable value, document and fragment leaf is a `serde_json::Value`.
//! `Value::Null` doubles as "undefined": a variable that has never been
//! computed, a `findOne` without a winner, or a fragment leaf to be unset.

pub use serde_json::Value;

/// A document produced by a [`crate::source::DataSource`].
pub type Document = Value;

/// Field holding a document's identity.
pub const ID_FIELD: &str = "_id";

/// Canonical key for a document's `_id`, if it has one.
///
/// The key is the id's JSON serialization, so `1` and `"1"` stay distinct.
#[must_use]
pub fn doc_id(doc: &Document) -> Option<String> {
    match doc.get(ID_FIELD)? {
        Value::Null => None,
        id => Some(id.to_string()),
    }
}

/// JavaScript-style truthiness.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Look up a dot-separated path inside a value.
#[must_use]
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
