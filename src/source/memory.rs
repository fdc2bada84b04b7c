//! In-memory collaborators.
//!
//! [`MemoryCollection`] and [`MemoryTransport`] are thread-safe reference
//! implementations of the collaborator traits. They are intended for embedded
//! usage and tests, and count how often they are asked to do work.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::value::{doc_id, Document, Value};

use super::event::{ChangeOp, ChangeSink};
use super::matcher::SelectorMatcher;
use super::projection::Projection;
use super::traits::{
    DataSource, DocumentMatcher, ReadyCallback, SourceError, SubscriptionHandle, SubscriptionTransport,
};

fn lock_err(context: &'static str) -> SourceError {
    SourceError::BackendError(format!("poisoned lock: {context}"))
}

/// An observable in-memory collection keyed by `_id`.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    name: Option<String>,
    docs: RwLock<BTreeMap<String, Document>>,
    sinks: RwLock<Vec<ChangeSink>>,
    executions: AtomicU64,
}

impl MemoryCollection {
    /// A collection named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// A collection without a name of its own.
    #[must_use]
    pub fn unnamed() -> Self {
        Self::default()
    }

    /// Number of `find`/`find_one` executions served so far.
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Number of stored documents.
    pub fn len(&self) -> Result<usize, SourceError> {
        Ok(self.docs.read().map_err(|_| lock_err("docs"))?.len())
    }

    /// True when no documents are stored.
    pub fn is_empty(&self) -> Result<bool, SourceError> {
        Ok(self.len()? == 0)
    }

    /// Insert a new document. It must carry an `_id` not already present.
    pub fn insert(&self, doc: Document) -> Result<(), SourceError> {
        let id = require_id(&doc)?;
        {
            let mut docs = self.docs.write().map_err(|_| lock_err("docs"))?;
            if docs.contains_key(&id) {
                return Err(SourceError::DuplicateKey(id));
            }
            docs.insert(id, doc.clone());
        }
        self.notify(ChangeOp::Added, doc)
    }

    /// Replace an existing document with a new version.
    pub fn update(&self, doc: Document) -> Result<(), SourceError> {
        let id = require_id(&doc)?;
        {
            let mut docs = self.docs.write().map_err(|_| lock_err("docs"))?;
            let Some(slot) = docs.get_mut(&id) else {
                return Err(SourceError::NotFound(id));
            };
            *slot = doc.clone();
        }
        self.notify(ChangeOp::Changed, doc)
    }

    /// Remove a document by `_id`, returning it if it existed.
    pub fn remove(&self, id: &Value) -> Result<Option<Document>, SourceError> {
        let key = id.to_string();
        let removed = self.docs.write().map_err(|_| lock_err("docs"))?.remove(&key);
        if let Some(doc) = &removed {
            self.notify(ChangeOp::Removed, doc.clone())?;
        }
        Ok(removed)
    }

    fn notify(&self, op: ChangeOp, doc: Document) -> Result<(), SourceError> {
        let sinks = self.sinks.read().map_err(|_| lock_err("sinks"))?.clone();
        for sink in sinks {
            let sent = match op {
                ChangeOp::Added => sink.added(doc.clone()),
                ChangeOp::Changed => sink.changed(doc.clone()),
                ChangeOp::Removed => sink.removed(doc.clone()),
            };
            if let Err(err) = sent {
                debug!(source = %sink.source(), error = %err, "dropping change for closed sink");
            }
        }
        Ok(())
    }

    fn matching(&self, selector: &Value) -> Result<Vec<Document>, SourceError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let matcher = SelectorMatcher::compile(selector)?;
        let docs = self.docs.read().map_err(|_| lock_err("docs"))?;
        Ok(docs.values().filter(|d| matcher.matches(d)).cloned().collect())
    }
}

fn require_id(doc: &Document) -> Result<String, SourceError> {
    doc_id(doc).ok_or_else(|| SourceError::InvalidDocument("document has no _id".to_string()))
}

fn project(doc: Document, projection: Option<&Projection>) -> Document {
    match projection {
        Some(p) => p.apply(&doc),
        None => doc,
    }
}

impl DataSource for MemoryCollection {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn find(&self, selector: &Value, projection: Option<&Projection>) -> Result<Vec<Document>, SourceError> {
        Ok(self
            .matching(selector)?
            .into_iter()
            .map(|d| project(d, projection))
            .collect())
    }

    fn find_one(&self, selector: &Value, projection: Option<&Projection>) -> Result<Option<Document>, SourceError> {
        Ok(self
            .matching(selector)?
            .into_iter()
            .next()
            .map(|d| project(d, projection)))
    }

    fn observe(&self, sink: ChangeSink) -> Result<(), SourceError> {
        self.sinks.write().map_err(|_| lock_err("sinks"))?.push(sink);
        Ok(())
    }
}

struct PendingSubscription {
    name: String,
    args: Value,
    on_ready: Option<ReadyCallback>,
    active: Arc<AtomicBool>,
}

/// Subscription handle issued by [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryHandle {
    active: Arc<AtomicBool>,
    stops: Arc<AtomicU64>,
}

impl SubscriptionHandle for MemoryHandle {
    fn stop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A transport whose subscriptions become ready when the caller says so.
///
/// With [`MemoryTransport::immediate`] every subscription reports ready from
/// inside `subscribe`.
#[derive(Default)]
pub struct MemoryTransport {
    immediate: bool,
    pending: Mutex<Vec<PendingSubscription>>,
    subscribes: AtomicU64,
    stops: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// A transport that waits for [`MemoryTransport::set_ready`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose subscriptions are ready immediately.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::default()
        }
    }

    /// Number of `subscribe` calls served.
    #[must_use]
    pub fn subscribe_count(&self) -> u64 {
        self.subscribes.load(Ordering::Relaxed)
    }

    /// Number of handles stopped.
    #[must_use]
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    /// Arguments of every live subscription named `name`.
    pub fn active(&self, name: &str) -> Result<Vec<Value>, SourceError> {
        let pending = self.pending.lock().map_err(|_| lock_err("pending"))?;
        Ok(pending
            .iter()
            .filter(|p| p.name == name && p.active.load(Ordering::Acquire))
            .map(|p| p.args.clone())
            .collect())
    }

    /// Mark every live subscription named `name` ready, returning how many
    /// ready callbacks fired.
    pub fn set_ready(&self, name: &str) -> Result<usize, SourceError> {
        let callbacks: Vec<ReadyCallback> = {
            let mut pending = self.pending.lock().map_err(|_| lock_err("pending"))?;
            pending
                .iter_mut()
                .filter(|p| p.name == name && p.active.load(Ordering::Acquire))
                .filter_map(|p| p.on_ready.take())
                .collect()
        };

        let fired = callbacks.len();
        for callback in callbacks {
            callback();
        }
        Ok(fired)
    }
}

impl SubscriptionTransport for MemoryTransport {
    fn subscribe(
        &self,
        name: &str,
        args: &Value,
        on_ready: ReadyCallback,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError> {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        let on_ready = if self.immediate {
            on_ready();
            None
        } else {
            Some(on_ready)
        };

        self.pending
            .lock()
            .map_err(|_| lock_err("pending"))?
            .push(PendingSubscription {
                name: name.to_string(),
                args: args.clone(),
                on_ready,
                active: Arc::clone(&active),
            });

        Ok(Box::new(MemoryHandle {
            active,
            stops: Arc::clone(&self.stops),
        }))
    }
}
