//! Subscription registry.
//!
//! Same sharing model as queries: one transport subscription per canonical
//! key, however many variables ask for it. Readiness arrives asynchronously
//! from the transport as a [`SubReadyNotice`] on the engine's ready channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExecutionError, StardustResult};
use crate::source::{SubscriptionHandle, SubscriptionTransport};
use crate::value::Value;

use super::VarRef;

/// Named subscription with arguments.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDescriptor {
    pub name: String,
    pub args: Value,
}

impl SubscriptionDescriptor {
    /// Subscription `name` with `args`.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Canonical key. Arguments are positional so their JSON form is used as is.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{} | {}", self.name, self.args)
    }
}

/// A subscription reported ready.
///
/// `generation` identifies the registry entry that subscribed, so a notice
/// from a torn-down subscription never marks a newer one under the same key.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubReadyNotice {
    pub key: String,
    pub generation: u64,
    pub client: VarRef,
}

/// A live subscription shared by one or more clients.
pub struct SubscriptionEntry {
    descriptor: SubscriptionDescriptor,
    handle: Box<dyn SubscriptionHandle>,
    clients: Vec<VarRef>,
    generation: u64,
    ready: bool,
}

impl SubscriptionEntry {
    /// The descriptor that created this entry.
    #[must_use]
    pub fn descriptor(&self) -> &SubscriptionDescriptor {
        &self.descriptor
    }

    /// Variables observing this subscription.
    #[must_use]
    pub fn clients(&self) -> &[VarRef] {
        &self.clients
    }

    /// Whether the transport reported the subscription ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("descriptor", &self.descriptor)
            .field("clients", &self.clients)
            .field("generation", &self.generation)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

/// Reference-counted registry of live subscriptions.
pub struct SubscriptionRegistry {
    transport: Arc<dyn SubscriptionTransport>,
    ready_tx: Sender<SubReadyNotice>,
    entries: HashMap<String, SubscriptionEntry>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    /// An empty registry subscribing through `transport` and reporting
    /// readiness on `ready_tx`.
    #[must_use]
    pub fn new(transport: Arc<dyn SubscriptionTransport>, ready_tx: Sender<SubReadyNotice>) -> Self {
        Self {
            transport,
            ready_tx,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The live entry for `descriptor`.
    #[must_use]
    pub fn get(&self, descriptor: &SubscriptionDescriptor) -> Option<&SubscriptionEntry> {
        self.entries.get(&descriptor.key())
    }

    /// Whether the subscription for `descriptor` is live and ready.
    #[must_use]
    pub fn is_ready(&self, descriptor: &SubscriptionDescriptor) -> bool {
        self.get(descriptor).is_some_and(SubscriptionEntry::is_ready)
    }

    /// Add `client` to the subscription for `descriptor`, subscribing
    /// through the transport if it is not live yet. Returns the current
    /// readiness.
    pub fn register(&mut self, descriptor: &SubscriptionDescriptor, client: &VarRef) -> StardustResult<bool> {
        let key = descriptor.key();

        if let Some(entry) = self.entries.get_mut(&key) {
            if !entry.clients.contains(client) {
                entry.clients.push(client.clone());
            }
            return Ok(entry.ready);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let notice = SubReadyNotice {
            key: key.clone(),
            generation,
            client: client.clone(),
        };
        let tx = self.ready_tx.clone();
        let on_ready = Box::new(move || {
            if tx.send(notice).is_err() {
                debug!("engine gone before subscription became ready");
            }
        });

        let handle = self
            .transport
            .subscribe(&descriptor.name, &descriptor.args, on_ready)
            .map_err(|e| ExecutionError::Subscription { message: e.to_string() })?;
        debug!(subscription = %key, client = %client, "subscribed");

        self.entries.insert(
            key,
            SubscriptionEntry {
                descriptor: descriptor.clone(),
                handle,
                clients: vec![client.clone()],
                generation,
                ready: false,
            },
        );
        Ok(false)
    }

    /// Remove `client` from the subscription for `descriptor`. The last
    /// client stops the transport handle. Returns true when the entry was
    /// torn down.
    pub fn unregister(&mut self, descriptor: &SubscriptionDescriptor, client: &VarRef) -> bool {
        let key = descriptor.key();
        let Some(entry) = self.entries.get_mut(&key) else {
            debug!(subscription = %key, client = %client, "unregister of unknown subscription");
            return false;
        };

        entry.clients.retain(|c| c != client);
        if !entry.clients.is_empty() {
            return false;
        }

        if let Some(mut entry) = self.entries.remove(&key) {
            entry.handle.stop();
        }
        debug!(subscription = %key, "unsubscribed");
        true
    }

    /// Record a ready notice.
    ///
    /// Returns the clients to fan out to, an empty list when the entry was
    /// already ready, and `None` when the notice is stale.
    pub fn mark_ready(&mut self, notice: &SubReadyNotice) -> Option<Vec<VarRef>> {
        let entry = self
            .entries
            .get_mut(&notice.key)
            .filter(|e| e.generation == notice.generation)?;

        if entry.ready {
            return Some(Vec::new());
        }
        entry.ready = true;
        Some(entry.clients.clone())
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTransport;
    use crossbeam_channel::unbounded;
    use serde_json::json;

    fn setup() -> (Arc<MemoryTransport>, SubscriptionRegistry, crossbeam_channel::Receiver<SubReadyNotice>) {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, rx) = unbounded();
        let registry = SubscriptionRegistry::new(Arc::clone(&transport) as Arc<dyn SubscriptionTransport>, tx);
        (transport, registry, rx)
    }

    #[test]
    fn key_covers_name_and_args() {
        let a = SubscriptionDescriptor::new("feed", json!([1, "x"]));
        assert_eq!(a.key(), r#"feed | [1,"x"]"#);
        assert_ne!(a.key(), SubscriptionDescriptor::new("feed", json!([1])).key());
    }

    #[test]
    fn shared_subscription_is_created_and_stopped_once() {
        let (transport, mut registry, _rx) = setup();
        let d = SubscriptionDescriptor::new("feed", json!([]));
        let a = VarRef::new("a", "feed");
        let b = VarRef::new("b", "feed");

        assert!(!registry.register(&d, &a).unwrap());
        assert!(!registry.register(&d, &b).unwrap());
        assert_eq!(transport.subscribe_count(), 1);

        assert!(!registry.unregister(&d, &a));
        assert_eq!(transport.stop_count(), 0);
        assert!(registry.unregister(&d, &b));
        assert_eq!(transport.stop_count(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn ready_notice_marks_entry_and_fans_out() {
        let (transport, mut registry, rx) = setup();
        let d = SubscriptionDescriptor::new("feed", json!([]));
        registry.register(&d, &VarRef::new("a", "s")).unwrap();
        registry.register(&d, &VarRef::new("b", "s")).unwrap();

        transport.set_ready("feed").unwrap();
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.client, VarRef::new("a", "s"));

        let clients = registry.mark_ready(&notice).unwrap();
        assert_eq!(clients.len(), 2);
        assert!(registry.is_ready(&d));
        assert_eq!(registry.mark_ready(&notice), Some(Vec::new()));
        assert!(registry.register(&d, &VarRef::new("c", "s")).unwrap());
    }

    #[test]
    fn stale_notice_is_ignored() {
        let (transport, mut registry, rx) = setup();
        let d = SubscriptionDescriptor::new("feed", json!([]));
        let client = VarRef::new("a", "s");

        registry.register(&d, &client).unwrap();
        transport.set_ready("feed").unwrap();
        let old = rx.try_recv().unwrap();
        registry.unregister(&d, &client);
        assert_eq!(registry.mark_ready(&old), None);

        registry.register(&d, &client).unwrap();
        assert_eq!(registry.mark_ready(&old), None);
        assert!(!registry.is_ready(&d));
    }
}
