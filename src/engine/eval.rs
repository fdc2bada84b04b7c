//! Variable and rule re-evaluation.
//!
//! These functions mutate one [`ActiveRule`] and the shared registries, and
//! return the fragment delta the change produced. A recompute that fails
//! (returned error, panic, or a registry refusing the new descriptor) leaves
//! the variable exactly as it was and is reported through
//! [`EvalContext::errors`].

use tracing::{trace, warn};

use crate::error::{ExecutionError, StardustError};
use crate::fragment::{diff, flatten, FragmentDelta};
use crate::reason::{Reason, ReasonCategory};
use crate::registry::{QueryDescriptor, QueryRegistry, SubscriptionDescriptor, SubscriptionRegistry, VarRef};
use crate::rule::{ActiveRule, ComputeResult, Scope, VarKind, Variable};
use crate::value::Value;

/// Everything a re-evaluation needs besides the rule itself.
pub(crate) struct EvalContext<'a> {
    pub queries: &'a mut QueryRegistry,
    pub subs: &'a mut SubscriptionRegistry,
    pub reason: Reason,
    pub errors: &'a mut Vec<StardustError>,
}

enum Recomputed {
    Mount(bool),
    Query(Option<QueryDescriptor>),
    Param(Value),
    Sub(Option<SubscriptionDescriptor>),
    Fragment(Value),
}

fn recompute(rule: &ActiveRule, var: &Variable) -> ComputeResult<Recomputed> {
    let scope = Scope::over(&rule.vars);
    match &var.kind {
        VarKind::Mount { compute } => compute.call(&scope).map(Recomputed::Mount),
        VarKind::Query { compute, .. } => compute.call(&scope).map(Recomputed::Query),
        VarKind::Param { compute } => compute.call(&scope).map(Recomputed::Param),
        VarKind::Sub { compute, .. } => compute.call(&scope).map(Recomputed::Sub),
        VarKind::Fragment { compute } => compute.call(&scope).map(Recomputed::Fragment),
    }
}

fn fail(rule: &mut ActiveRule, name: &str, message: String, ctx: &mut EvalContext<'_>) {
    warn!(rule = %rule.name, var = %name, reason = %ctx.reason.id, error = %message, "recompute failed");
    if let Some(var) = rule.vars.get_mut(name) {
        var.last_error = Some(message.clone());
    }
    ctx.errors.push(
        ExecutionError::RecomputeFailed {
            rule: rule.name.clone(),
            var: name.to_string(),
            message,
        }
        .into(),
    );
}

/// Recompute one variable and return the fragment delta it produced.
pub(crate) fn update_var(rule: &mut ActiveRule, name: &str, ctx: &mut EvalContext<'_>) -> FragmentDelta {
    let Some(var) = rule.vars.get(name) else {
        warn!(rule = %rule.name, var = %name, "update of unknown variable");
        return FragmentDelta::new();
    };

    let recomputed = match recompute(rule, var) {
        Ok(r) => r,
        Err(err) => {
            fail(rule, name, err.0, ctx);
            return FragmentDelta::new();
        }
    };
    trace!(rule = %rule.name, var = %name, reason = %ctx.reason.id, "recomputed");

    let client = VarRef::new(rule.name.clone(), name);
    let ActiveRule { vars, fragment_cache, .. } = &mut *rule;
    let Some(var) = vars.get_mut(name) else {
        return FragmentDelta::new();
    };

    let mut delta = FragmentDelta::new();
    let outcome = match recomputed {
        Recomputed::Mount(mounted) => {
            assign_if_changed(var, Value::Bool(mounted), &ctx.reason);
            Ok(())
        }
        Recomputed::Param(value) => {
            assign_if_changed(var, value, &ctx.reason);
            Ok(())
        }
        Recomputed::Query(next) => update_query(var, &client, next, ctx),
        Recomputed::Sub(next) => update_sub(var, &client, next, ctx),
        Recomputed::Fragment(value) if !(value.is_object() || value.is_null()) => {
            Err(format!("fragment must evaluate to an object, got {value}"))
        }
        Recomputed::Fragment(value) => {
            if var.value != value {
                let new_flat = flatten(&value);
                let old_flat = fragment_cache.remove(name).unwrap_or_default();
                delta = diff(&new_flat, &old_flat);
                fragment_cache.insert(name.to_string(), new_flat);
                var.value = value;
                var.reason = Some(ctx.reason.clone());
            }
            Ok(())
        }
    };

    match outcome {
        Ok(()) => {
            var.last_error = None;
            delta
        }
        Err(message) => {
            fail(rule, name, message, ctx);
            FragmentDelta::new()
        }
    }
}

fn assign_if_changed(var: &mut Variable, value: Value, reason: &Reason) {
    if var.value != value {
        var.value = value;
        var.reason = Some(reason.clone());
    }
}

fn update_query(
    var: &mut Variable,
    client: &VarRef,
    next: Option<QueryDescriptor>,
    ctx: &mut EvalContext<'_>,
) -> Result<(), String> {
    let VarKind::Query { query, .. } = &mut var.kind else {
        return Ok(());
    };

    match (query.clone(), next) {
        (Some(current), Some(next)) if current.key() != next.key() => {
            let data = ctx.queries.register(&next, client).map_err(|e| e.to_string())?;
            ctx.queries.unregister(&current, client);
            *query = Some(next);
            var.value = data.to_value();
            var.reason = Some(ctx.reason.clone());
        }
        (Some(current), Some(next)) => {
            if ctx.reason.category() == ReasonCategory::Transaction {
                var.value = ctx
                    .queries
                    .get(&current)
                    .map_or(Value::Null, |entry| entry.data().to_value());
                var.reason = Some(ctx.reason.clone());
            }
            *query = Some(next);
        }
        (Some(current), None) => {
            ctx.queries.unregister(&current, client);
            *query = None;
            if !var.value.is_null() {
                var.value = Value::Null;
                var.reason = Some(ctx.reason.clone());
            }
        }
        (None, Some(next)) => {
            let data = ctx.queries.register(&next, client).map_err(|e| e.to_string())?;
            *query = Some(next);
            var.value = data.to_value();
            var.reason = Some(ctx.reason.clone());
        }
        (None, None) => {}
    }
    Ok(())
}

fn update_sub(
    var: &mut Variable,
    client: &VarRef,
    next: Option<SubscriptionDescriptor>,
    ctx: &mut EvalContext<'_>,
) -> Result<(), String> {
    let VarKind::Sub { sub, .. } = &mut var.kind else {
        return Ok(());
    };

    match (sub.clone(), next) {
        (Some(current), Some(next)) if current.key() != next.key() => {
            let ready = ctx.subs.register(&next, client).map_err(|e| e.to_string())?;
            ctx.subs.unregister(&current, client);
            *sub = Some(next);
            var.value = Value::Bool(ready);
            var.reason = Some(ctx.reason.clone());
        }
        (Some(current), Some(next)) => {
            if ctx.reason.category() == ReasonCategory::SubReady {
                var.value = Value::Bool(ctx.subs.is_ready(&current));
                var.reason = Some(ctx.reason.clone());
            }
            *sub = Some(next);
        }
        (Some(current), None) => {
            ctx.subs.unregister(&current, client);
            *sub = None;
            var.value = Value::Null;
            var.reason = Some(ctx.reason.clone());
        }
        (None, Some(next)) => {
            let ready = ctx.subs.register(&next, client).map_err(|e| e.to_string())?;
            *sub = Some(next);
            var.value = Value::Bool(ready);
            var.reason = Some(ctx.reason.clone());
        }
        (None, None) => {}
    }
    Ok(())
}

/// Re-evaluate `rule` starting at `start`.
///
/// From a variable the mount gate depends on, everything up to and including
/// `mount` is recomputed and the mount transition decides what follows:
/// opening or staying open re-evaluates every post-mount variable, closing
/// unmounts the rule. From a post-mount variable, it and every later
/// post-mount variable are recomputed and their deltas merged.
pub(crate) fn update_active_rule(rule: &mut ActiveRule, start: &str, ctx: &mut EvalContext<'_>) -> FragmentDelta {
    let Some(pos) = rule.until_mount.iter().position(|v| v == start) else {
        return update_after_mount(rule, start, ctx);
    };

    let mounted_before = rule.is_mounted();
    let chain = rule.until_mount[pos..].to_vec();
    for name in &chain {
        // Nothing here can emit fragments: no variable may depend on one.
        let _ = update_var(rule, name, ctx);
    }
    let mounted_after = rule.is_mounted();

    match (mounted_before, mounted_after) {
        (_, true) => match rule.after_mount.first().cloned() {
            Some(first) => update_after_mount(rule, &first, ctx),
            None => FragmentDelta::new(),
        },
        (true, false) => unmount(rule, ctx),
        (false, false) => FragmentDelta::new(),
    }
}

fn update_after_mount(rule: &mut ActiveRule, start: &str, ctx: &mut EvalContext<'_>) -> FragmentDelta {
    let Some(pos) = rule.after_mount.iter().position(|v| v == start) else {
        warn!(rule = %rule.name, var = %start, "variable is in neither evaluation order");
        return FragmentDelta::new();
    };

    let mut delta = FragmentDelta::new();
    for name in rule.after_mount[pos..].to_vec() {
        delta.merge_in(update_var(rule, &name, ctx));
    }
    delta
}

/// Close the mount gate: unset everything the rule's fragments set, release
/// post-mount resources, and reset post-mount variables to undefined.
pub(crate) fn unmount(rule: &mut ActiveRule, ctx: &mut EvalContext<'_>) -> FragmentDelta {
    let delta = remove_fragments(rule);

    let ActiveRule {
        name: rule_name,
        vars,
        fragment_cache,
        after_mount,
        ..
    } = rule;
    for name in after_mount.iter() {
        let Some(var) = vars.get_mut(name) else { continue };
        release(var, rule_name, ctx.queries, ctx.subs);
        fragment_cache.remove(name);
        var.value = Value::Null;
        var.reason = None;
    }
    delta
}

/// Unset every path the rule's fragments currently set.
pub(crate) fn remove_fragments(rule: &ActiveRule) -> FragmentDelta {
    rule.fragment_vars()
        .filter_map(|name| rule.fragment_cache.get(name))
        .fold(FragmentDelta::new(), |acc, flat| acc.merge(diff(&[], flat)))
}

/// Unregister every live query and subscription the rule holds.
pub(crate) fn release_all(rule: &mut ActiveRule, queries: &mut QueryRegistry, subs: &mut SubscriptionRegistry) {
    let ActiveRule { name, vars, .. } = rule;
    for var in vars.values_mut() {
        release(var, name, queries, subs);
    }
}

fn release(var: &mut Variable, rule: &str, queries: &mut QueryRegistry, subs: &mut SubscriptionRegistry) {
    match &mut var.kind {
        VarKind::Query { query, .. } => {
            if let Some(q) = query.take() {
                queries.unregister(&q, &VarRef::new(rule, var.name.as_str()));
            }
        }
        VarKind::Sub { sub, .. } => {
            if let Some(s) = sub.take() {
                subs.unregister(&s, &VarRef::new(rule, var.name.as_str()));
            }
        }
        _ => {}
    }
}
