//! Rule evaluation engine.
//!
//! [`RuleEngine`] is the synchronous core: it owns the active rules and both
//! resource registries, and turns each input (a rule operation, a batch of
//! change events, a subscription-ready notice) into a fragment delta tagged
//! with its [`Reason`]. [`Stardust`] wraps it in a threaded runtime with an
//! event scheduler and the application-state merge stage.

mod eval;
mod runtime;
mod scheduler;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::error::{ExecutionError, StardustError, StardustResult, ValidationError};
use crate::fragment::FragmentDelta;
use crate::reason::{Reason, RuleOpKind};
use crate::registry::{QueryRegistry, SubReadyNotice, SubscriptionRegistry, VarRef};
use crate::rule::ActiveRule;
use crate::source::{ChangeEvent, DataSource, MatcherFactory, SubscriptionTransport};

use eval::{release_all, remove_fragments, update_active_rule, EvalContext};

pub use runtime::Stardust;
pub use scheduler::{EventBuffer, Input};

/// A rule operation, with rules already activated.
#[derive(Debug)]
pub enum RuleOp {
    /// Activate a new rule.
    Add(ActiveRule),
    /// Replace the rule called `name`.
    Change {
        /// Rule to replace.
        name: String,
        /// Its replacement, activated under `name`.
        rule: ActiveRule,
    },
    /// Remove the rule called `name`.
    Remove {
        /// Rule to remove.
        name: String,
    },
}

impl RuleOp {
    /// Kind recorded in the reason of the resulting commit.
    #[must_use]
    pub const fn kind(&self) -> RuleOpKind {
        match self {
            Self::Add(_) => RuleOpKind::Added,
            Self::Change { .. } => RuleOpKind::Changed,
            Self::Remove { .. } => RuleOpKind::Removed,
        }
    }

    /// Name of the rule the operation targets.
    #[must_use]
    pub fn rule_name(&self) -> &str {
        match self {
            Self::Add(rule) => rule.name(),
            Self::Change { name, .. } | Self::Remove { name } => name,
        }
    }
}

/// Result of processing one input.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Delta to merge into the application state.
    pub delta: FragmentDelta,
    /// Why the delta was produced.
    pub reason: Reason,
    /// Non-fatal per-variable failures met along the way.
    pub errors: Vec<StardustError>,
}

/// Synchronous rule evaluation engine.
pub struct RuleEngine {
    queries: QueryRegistry,
    subs: SubscriptionRegistry,
    rules: HashMap<String, ActiveRule>,
}

impl RuleEngine {
    /// An engine with no rules and no sources.
    ///
    /// Subscription-ready notices from `transport` arrive on `ready_tx`; the
    /// caller feeds them back through [`RuleEngine::process_sub_ready`].
    #[must_use]
    pub fn new(
        transport: Arc<dyn SubscriptionTransport>,
        matchers: Arc<dyn MatcherFactory>,
        ready_tx: Sender<SubReadyNotice>,
    ) -> Self {
        Self {
            queries: QueryRegistry::new(matchers),
            subs: SubscriptionRegistry::new(transport, ready_tx),
            rules: HashMap::new(),
        }
    }

    /// Make `source` queryable. See [`QueryRegistry::add_source`].
    pub fn register_source(&mut self, source: Arc<dyn DataSource>, name: Option<&str>) -> StardustResult<String> {
        let name = self.queries.add_source(source, name)?;
        debug!(source = %name, "source registered");
        Ok(name)
    }

    /// Stop answering queries against the source called `name`.
    pub fn unregister_source(&mut self, name: &str) -> bool {
        let removed = self.queries.remove_source(name).is_some();
        if removed {
            debug!(source = %name, "source unregistered");
        }
        removed
    }

    /// The active rule called `name`.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<&ActiveRule> {
        self.rules.get(name)
    }

    /// Names of every active rule.
    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Live queries.
    #[must_use]
    pub fn queries(&self) -> &QueryRegistry {
        &self.queries
    }

    /// Live subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subs
    }

    /// Apply a rule operation.
    ///
    /// Adding a rule whose name is taken fails with `DuplicateRule`; changing
    /// or removing an unknown rule fails with `UnknownRule`. Either way the
    /// engine is left untouched.
    pub fn process_rule(&mut self, op: RuleOp) -> StardustResult<Outcome> {
        let reason = Reason::rule(op.kind(), op.rule_name());
        debug!(op = ?op.kind(), rule = %op.rule_name(), reason = %reason.id, "processing rule operation");
        let mut errors = Vec::new();

        let delta = match op {
            RuleOp::Add(rule) => self.add(rule, &reason, &mut errors)?,
            RuleOp::Change { name, mut rule } => {
                if !self.rules.contains_key(&name) {
                    return Err(ExecutionError::UnknownRule { rule: name }.into());
                }
                let removal = self.remove(&name)?;
                rule.name = name;
                removal.merge(self.add(rule, &reason, &mut errors)?)
            }
            RuleOp::Remove { name } => self.remove(&name)?,
        };

        Ok(Outcome { delta, reason, errors })
    }

    fn add(&mut self, mut rule: ActiveRule, reason: &Reason, errors: &mut Vec<StardustError>) -> StardustResult<FragmentDelta> {
        if self.rules.contains_key(&rule.name) {
            return Err(ValidationError::DuplicateRule { rule: rule.name }.into());
        }

        let delta = match rule.until_mount.first().cloned() {
            Some(start) => {
                let mut ctx = EvalContext {
                    queries: &mut self.queries,
                    subs: &mut self.subs,
                    reason: reason.clone(),
                    errors,
                };
                update_active_rule(&mut rule, &start, &mut ctx)
            }
            None => FragmentDelta::new(),
        };

        self.rules.insert(rule.name.clone(), rule);
        Ok(delta)
    }

    fn remove(&mut self, name: &str) -> StardustResult<FragmentDelta> {
        let mut rule = self
            .rules
            .remove(name)
            .ok_or_else(|| ExecutionError::UnknownRule { rule: name.to_string() })?;

        release_all(&mut rule, &mut self.queries, &mut self.subs);
        Ok(remove_fragments(&rule))
    }

    /// Apply a batch of source change events.
    ///
    /// Every live query is patched; each rule with an affected variable is
    /// then re-evaluated once, from its earliest affected variable, under a
    /// reason carrying the events that touched it.
    pub fn process_transactions(&mut self, events: Vec<ChangeEvent>) -> Outcome {
        let mut errors = Vec::new();
        let mut affected: BTreeMap<String, (BTreeSet<String>, Vec<ChangeEvent>)> = BTreeMap::new();

        for event in &events {
            for VarRef { rule, var } in self.queries.apply_change(event, &mut errors) {
                let (vars, rule_events) = affected.entry(rule).or_default();
                vars.insert(var);
                if !rule_events.contains(event) {
                    rule_events.push(event.clone());
                }
            }
        }

        let mut unique: Vec<ChangeEvent> = Vec::with_capacity(events.len());
        for event in events {
            if !unique.contains(&event) {
                unique.push(event);
            }
        }
        let reason = Reason::transaction(unique);
        debug!(reason = %reason.id, rules = affected.len(), "processing transactions");

        let mut delta = FragmentDelta::new();
        for (name, (vars, rule_events)) in affected {
            let Some(rule) = self.rules.get_mut(&name) else {
                warn!(rule = %name, "transaction affects a rule that is no longer active");
                continue;
            };
            let Some(start) = rule.highest_ranking(&vars).cloned() else {
                continue;
            };

            let mut ctx = EvalContext {
                queries: &mut self.queries,
                subs: &mut self.subs,
                reason: Reason::transaction(rule_events),
                errors: &mut errors,
            };
            delta.merge_in(update_active_rule(rule, &start, &mut ctx));
        }

        Outcome { delta, reason, errors }
    }

    /// Apply a subscription-ready notice.
    ///
    /// The subscription is marked ready and every rule observing it is
    /// re-evaluated. A stale notice, for a subscription that has since been
    /// torn down, produces an empty outcome.
    pub fn process_sub_ready(&mut self, notice: SubReadyNotice) -> Outcome {
        let reason = Reason::sub_ready(notice.clone());
        let mut errors = Vec::new();
        let mut delta = FragmentDelta::new();

        let Some(clients) = self.subs.mark_ready(&notice) else {
            warn!(subscription = %notice.key, client = %notice.client, "ignoring stale ready notice");
            return Outcome { delta, reason, errors };
        };
        debug!(subscription = %notice.key, reason = %reason.id, clients = clients.len(), "processing sub ready");

        let mut affected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for VarRef { rule, var } in clients {
            affected.entry(rule).or_default().insert(var);
        }

        for (name, vars) in affected {
            let Some(rule) = self.rules.get_mut(&name) else { continue };
            let Some(start) = rule.highest_ranking(&vars).cloned() else { continue };

            let mut ctx = EvalContext {
                queries: &mut self.queries,
                subs: &mut self.subs,
                reason: reason.clone(),
                errors: &mut errors,
            };
            delta.merge_in(update_active_rule(rule, &start, &mut ctx));
        }

        Outcome { delta, reason, errors }
    }

    /// Remove every rule, releasing every query and subscription.
    pub fn shutdown(&mut self) -> FragmentDelta {
        let names: Vec<String> = self.rules.keys().cloned().collect();
        let mut delta = FragmentDelta::new();
        for name in names {
            if let Ok(removal) = self.remove(&name) {
                delta.merge_in(removal);
            }
        }
        delta
    }
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.len())
            .field("subscriptions", &self.subs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{activate, Declaration, Rule};
    use crate::source::{MemoryCollection, MemoryTransport, SelectorMatcherFactory};
    use crossbeam_channel::unbounded;
    use serde_json::{json, Value};

    fn engine() -> RuleEngine {
        let (tx, _rx) = unbounded();
        RuleEngine::new(
            Arc::new(MemoryTransport::immediate()),
            Arc::new(SelectorMatcherFactory),
            tx,
        )
    }

    fn add(engine: &mut RuleEngine, rule: Rule) -> Outcome {
        engine.process_rule(RuleOp::Add(activate(rule).unwrap())).unwrap()
    }

    #[test]
    fn failing_recompute_is_isolated() {
        let mut engine = engine();
        let rule = Rule::new()
            .named("r")
            .mount(Declaration::constant(true))
            .param("bad", Declaration::computed(Vec::<String>::new(), |_| {
                Err(crate::rule::ComputeError::new("nope"))
            }))
            .param("good", Declaration::constant(json!(1)))
            .fragment(Declaration::computed(["good"], |s| Ok(json!({"g": s.get("good")}))));

        let outcome = add(&mut engine, rule);
        assert_eq!(outcome.delta.set.get("g"), Some(&json!(1)));
        assert_eq!(outcome.errors.len(), 1);
        assert!(!outcome.errors[0].is_fatal());

        let rule = engine.rule("r").unwrap();
        assert_eq!(rule.var("bad").unwrap().value(), &Value::Null);
        assert_eq!(rule.var("bad").unwrap().last_error(), Some("nope"));
        assert!(rule.var("good").unwrap().last_error().is_none());
    }

    #[test]
    fn non_object_fragment_is_a_recompute_failure() {
        let mut engine = engine();
        let rule = Rule::new()
            .named("r")
            .mount(Declaration::constant(true))
            .fragment(Declaration::constant(json!([1, 2])));
        let outcome = add(&mut engine, rule);
        assert!(outcome.delta.is_empty());
        assert!(matches!(
            outcome.errors.as_slice(),
            [StardustError::Execution(ExecutionError::RecomputeFailed { .. })]
        ));
    }

    #[test]
    fn duplicate_and_unknown_rules_are_rejected() {
        let mut engine = engine();
        let make = || Rule::new().named("r").mount(Declaration::constant(true));
        add(&mut engine, make());

        let err = engine.process_rule(RuleOp::Add(activate(make()).unwrap())).unwrap_err();
        assert!(matches!(err, StardustError::Validation(ValidationError::DuplicateRule { .. })));

        let err = engine
            .process_rule(RuleOp::Remove { name: "ghost".to_string() })
            .unwrap_err();
        assert!(matches!(err, StardustError::Execution(ExecutionError::UnknownRule { .. })));
        assert!(err.is_fatal());
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut engine = engine();
        let users = Arc::new(MemoryCollection::new("users"));
        engine.register_source(users, None).unwrap();

        let rule = Rule::new()
            .named("r")
            .mount(Declaration::constant(true))
            .query(
                "all",
                Declaration::constant(Some(crate::registry::QueryDescriptor::find("users", json!({})))),
            )
            .fragment(Declaration::constant(json!({"x": 1})));
        add(&mut engine, rule);
        assert_eq!(engine.queries().len(), 1);

        let delta = engine.shutdown();
        assert!(delta.unset.contains("x"));
        assert!(engine.queries().is_empty());
        assert_eq!(engine.rule_names().count(), 0);
    }
}
