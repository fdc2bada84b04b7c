//! Query registry.
//!
//! Rule variables request queries by descriptor. Structurally equal
//! descriptors share one canonical key and therefore one entry: the query is
//! executed once, by the first client, and every later client receives the
//! already materialized result. Transactions patch entries incrementally.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ExecutionError, StardustError, StardustResult, ValidationError};
use crate::source::{ChangeEvent, ChangeOp, DataSource, DocumentMatcher, MatcherFactory, Projection};
use crate::value::{doc_id, Document, Value};

use super::VarRef;

/// Query method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOp {
    /// Every matching document.
    Find,
    /// The first matching document.
    FindOne,
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
        })
    }
}

/// Declarative description of a query against a named source.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub source: String,
    pub op: QueryOp,
    pub selector: Value,
    pub projection: Option<Projection>,
}

impl QueryDescriptor {
    /// `find(selector)` on `source`.
    #[must_use]
    pub fn find(source: impl Into<String>, selector: Value) -> Self {
        Self {
            source: source.into(),
            op: QueryOp::Find,
            selector,
            projection: None,
        }
    }

    /// `findOne(selector)` on `source`.
    #[must_use]
    pub fn find_one(source: impl Into<String>, selector: Value) -> Self {
        Self {
            source: source.into(),
            op: QueryOp::FindOne,
            selector,
            projection: None,
        }
    }

    /// Restrict returned fields.
    #[must_use]
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Restrict returned fields using a `{field: 1 | 0}` object.
    pub fn with_projection_value(mut self, projection: &Value) -> Result<Self, ValidationError> {
        self.projection = Projection::from_value(projection)?;
        Ok(self)
    }

    /// Canonical key: structurally equal descriptors always share it.
    ///
    /// Object keys serialize sorted, so key order never splits entries.
    /// Nesting is kept: `{"a": {"b": 1}}` and `{"a.b": 1}` select differently.
    #[must_use]
    pub fn key(&self) -> String {
        let projection = self.projection.as_ref().map_or(Value::Null, Projection::to_value);
        [
            self.source.clone(),
            self.op.to_string(),
            self.selector.to_string(),
            projection.to_string(),
        ]
        .join(" | ")
    }
}

/// Materialized result of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    /// `find` results keyed by document id.
    Many(BTreeMap<String, Document>),
    /// `findOne` result.
    One(Option<Document>),
}

impl QueryData {
    /// The value a rule variable sees: an array for `find`, the document or
    /// undefined for `findOne`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Many(docs) => Value::Array(docs.values().cloned().collect()),
            Self::One(doc) => doc.clone().unwrap_or(Value::Null),
        }
    }

    /// Number of documents held.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Many(docs) => docs.len(),
            Self::One(doc) => usize::from(doc.is_some()),
        }
    }

    /// True when no document is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn winner_id(&self) -> Option<String> {
        match self {
            Self::One(Some(doc)) => doc_id(doc),
            _ => None,
        }
    }
}

/// A live query shared by one or more clients.
pub struct QueryEntry {
    descriptor: QueryDescriptor,
    data: Arc<QueryData>,
    matcher: Box<dyn DocumentMatcher>,
    clients: Vec<VarRef>,
}

impl QueryEntry {
    /// The descriptor that created this entry.
    #[must_use]
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Current result snapshot.
    #[must_use]
    pub fn data(&self) -> &Arc<QueryData> {
        &self.data
    }

    /// Variables observing this query.
    #[must_use]
    pub fn clients(&self) -> &[VarRef] {
        &self.clients
    }
}

impl fmt::Debug for QueryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEntry")
            .field("descriptor", &self.descriptor)
            .field("data", &self.data)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

enum Patch {
    Upsert(String, Document),
    Remove(String),
    Reexecute,
}

/// Reference-counted registry of live queries.
pub struct QueryRegistry {
    sources: HashMap<String, Arc<dyn DataSource>>,
    matchers: Arc<dyn MatcherFactory>,
    entries: HashMap<String, QueryEntry>,
}

impl QueryRegistry {
    /// An empty registry building matchers with `matchers`.
    #[must_use]
    pub fn new(matchers: Arc<dyn MatcherFactory>) -> Self {
        Self {
            sources: HashMap::new(),
            matchers,
            entries: HashMap::new(),
        }
    }

    /// Make a source queryable.
    ///
    /// The source's own name wins over `name`. Returns the name it was
    /// registered under.
    pub fn add_source(&mut self, source: Arc<dyn DataSource>, name: Option<&str>) -> StardustResult<String> {
        let name = source
            .name()
            .or_else(|| name.map(str::to_string))
            .filter(|n| !n.trim().is_empty())
            .ok_or(ValidationError::UnnamedSource)?;

        if self.sources.contains_key(&name) {
            return Err(ValidationError::DuplicateSource { name }.into());
        }

        self.sources.insert(name.clone(), source);
        Ok(name)
    }

    /// Forget the source registered under `name`, returning it.
    ///
    /// Live entries against it keep their last result.
    pub fn remove_source(&mut self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.remove(name)
    }

    /// The source registered under `name`.
    #[must_use]
    pub fn source(&self, name: &str) -> Option<&Arc<dyn DataSource>> {
        self.sources.get(name)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no query is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The live entry for `descriptor`.
    #[must_use]
    pub fn get(&self, descriptor: &QueryDescriptor) -> Option<&QueryEntry> {
        self.entries.get(&descriptor.key())
    }

    /// Add `client` to the entry for `descriptor`, executing the query if it
    /// is not live yet, and return the current result.
    pub fn register(&mut self, descriptor: &QueryDescriptor, client: &VarRef) -> StardustResult<Arc<QueryData>> {
        let key = descriptor.key();

        if let Some(entry) = self.entries.get_mut(&key) {
            if !entry.clients.contains(client) {
                entry.clients.push(client.clone());
            }
            return Ok(Arc::clone(&entry.data));
        }

        let matcher = self.matchers.build(&descriptor.selector)?;
        let data = Arc::new(execute(&self.sources, descriptor)?);
        debug!(query = %key, client = %client, "query registered");

        self.entries.insert(
            key,
            QueryEntry {
                descriptor: descriptor.clone(),
                data: Arc::clone(&data),
                matcher,
                clients: vec![client.clone()],
            },
        );
        Ok(data)
    }

    /// Remove `client` from the entry for `descriptor`. Returns true when
    /// that was the last client and the entry was torn down.
    pub fn unregister(&mut self, descriptor: &QueryDescriptor, client: &VarRef) -> bool {
        let key = descriptor.key();
        let Some(entry) = self.entries.get_mut(&key) else {
            debug!(query = %key, client = %client, "unregister of unknown query");
            return false;
        };

        entry.clients.retain(|c| c != client);
        if entry.clients.is_empty() {
            self.entries.remove(&key);
            debug!(query = %key, "query torn down");
            true
        } else {
            false
        }
    }

    /// Patch every live query on the event's source and return the clients
    /// of the queries whose result changed.
    ///
    /// A `findOne` whose winner is removed or stops matching is re-executed,
    /// since another document may now be the answer. Failures are pushed to
    /// `errors`; the failing entry keeps its previous result.
    pub fn apply_change(&mut self, event: &ChangeEvent, errors: &mut Vec<StardustError>) -> Vec<VarRef> {
        let mut affected = Vec::new();
        let Some(id) = doc_id(&event.doc) else {
            warn!(source = %event.source, op = %event.op, "ignoring change event without _id");
            return affected;
        };

        for (key, entry) in &mut self.entries {
            if entry.descriptor.source != event.source {
                continue;
            }

            let Some(patch) = plan(entry, event, &id) else {
                continue;
            };

            match patch {
                Patch::Upsert(id, doc) => match Arc::make_mut(&mut entry.data) {
                    QueryData::Many(docs) => {
                        docs.insert(id, doc);
                    }
                    QueryData::One(slot) => *slot = Some(doc),
                },
                Patch::Remove(id) => {
                    if let QueryData::Many(docs) = Arc::make_mut(&mut entry.data) {
                        docs.remove(&id);
                    }
                }
                Patch::Reexecute => match execute(&self.sources, &entry.descriptor) {
                    Ok(data) => entry.data = Arc::new(data),
                    Err(err) => {
                        warn!(query = %key, error = %err, "re-executing query failed");
                        errors.push(err);
                        continue;
                    }
                },
            }

            affected.extend(entry.clients.iter().cloned());
        }

        affected
    }
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

fn project(descriptor: &QueryDescriptor, doc: &Document) -> Document {
    match &descriptor.projection {
        Some(p) => p.apply(doc),
        None => doc.clone(),
    }
}

fn plan(entry: &QueryEntry, event: &ChangeEvent, id: &str) -> Option<Patch> {
    let upsert = || Some(Patch::Upsert(id.to_string(), project(&entry.descriptor, &event.doc)));

    match (event.op, entry.data.as_ref()) {
        (ChangeOp::Added, QueryData::Many(_)) => entry.matcher.matches(&event.doc).then(upsert).flatten(),
        // An added document never displaces an existing winner.
        (ChangeOp::Added, QueryData::One(current)) => {
            (current.is_none() && entry.matcher.matches(&event.doc)).then(upsert).flatten()
        }

        (ChangeOp::Changed, QueryData::Many(docs)) => {
            match (entry.matcher.matches(&event.doc), docs.contains_key(id)) {
                (true, _) => upsert(),
                (false, true) => Some(Patch::Remove(id.to_string())),
                (false, false) => None,
            }
        }
        (ChangeOp::Changed, data @ QueryData::One(_)) => {
            match (entry.matcher.matches(&event.doc), data.winner_id()) {
                (true, None) => upsert(),
                (true, Some(winner)) if winner == id => upsert(),
                (false, Some(winner)) if winner == id => Some(Patch::Reexecute),
                _ => None,
            }
        }

        (ChangeOp::Removed, QueryData::Many(docs)) => docs.contains_key(id).then(|| Patch::Remove(id.to_string())),
        (ChangeOp::Removed, data @ QueryData::One(_)) => {
            (data.winner_id().as_deref() == Some(id)).then_some(Patch::Reexecute)
        }
    }
}

fn execute(sources: &HashMap<String, Arc<dyn DataSource>>, descriptor: &QueryDescriptor) -> StardustResult<QueryData> {
    let source = sources.get(&descriptor.source).ok_or_else(|| ExecutionError::UnknownSource {
        name: descriptor.source.clone(),
    })?;
    let projection = descriptor.projection.as_ref();

    match descriptor.op {
        QueryOp::Find => {
            let mut docs = BTreeMap::new();
            for doc in source.find(&descriptor.selector, projection)? {
                match doc_id(&doc) {
                    Some(id) => {
                        docs.insert(id, doc);
                    }
                    None => warn!(source = %descriptor.source, "skipping result document without _id"),
                }
            }
            Ok(QueryData::Many(docs))
        }
        QueryOp::FindOne => Ok(QueryData::One(source.find_one(&descriptor.selector, projection)?)),
    }
}
