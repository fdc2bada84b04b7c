//! Engine-owned state of an activated rule.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fragment::FlatFragment;
use crate::reason::Reason;
use crate::registry::{QueryDescriptor, SubscriptionDescriptor};
use crate::value::{truthy, Value};

use super::declaration::Computation;

/// Name of the mount gate variable.
pub const MOUNT: &str = "mount";

/// Variable category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarCategory {
    /// The boolean gate deciding whether fragments are emitted.
    Mount,
    /// Values are live query results.
    Queries,
    /// Plain derived values.
    Params,
    /// Values are subscription readiness.
    Subs,
    /// Objects merged into the application state.
    Fragments,
}

impl fmt::Display for VarCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mount => "mount",
            Self::Queries => "queries",
            Self::Params => "params",
            Self::Subs => "subs",
            Self::Fragments => "fragments",
        })
    }
}

/// Category-specific part of a variable.
#[derive(Debug, Clone)]
pub(crate) enum VarKind {
    Mount {
        compute: Computation<bool>,
    },
    Query {
        compute: Computation<Option<QueryDescriptor>>,
        query: Option<QueryDescriptor>,
    },
    Param {
        compute: Computation<Value>,
    },
    Sub {
        compute: Computation<Option<SubscriptionDescriptor>>,
        sub: Option<SubscriptionDescriptor>,
    },
    Fragment {
        compute: Computation<Value>,
    },
}

impl VarKind {
    pub(crate) const fn category(&self) -> VarCategory {
        match self {
            Self::Mount { .. } => VarCategory::Mount,
            Self::Query { .. } => VarCategory::Queries,
            Self::Param { .. } => VarCategory::Params,
            Self::Sub { .. } => VarCategory::Subs,
            Self::Fragment { .. } => VarCategory::Fragments,
        }
    }
}

/// One variable of an active rule.
#[derive(Debug, Clone)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) kind: VarKind,
    pub(crate) deps: Vec<String>,
    pub(crate) value: Value,
    pub(crate) reason: Option<Reason>,
    pub(crate) last_error: Option<String>,
}

impl Variable {
    pub(crate) fn new(name: String, kind: VarKind, deps: Vec<String>) -> Self {
        Self {
            name,
            kind,
            deps,
            value: Value::Null,
            reason: None,
            last_error: None,
        }
    }

    /// Variable name, unique within its rule.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Category the variable was declared in.
    #[must_use]
    pub fn category(&self) -> VarCategory {
        self.kind.category()
    }

    /// Declared or inferred dependencies.
    #[must_use]
    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    /// Current value; `null` when undefined.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Why the value last changed.
    #[must_use]
    pub fn reason(&self) -> Option<&Reason> {
        self.reason.as_ref()
    }

    /// Message of the last failed recompute, cleared by the next success.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Registered query descriptor, for query variables.
    #[must_use]
    pub fn query(&self) -> Option<&QueryDescriptor> {
        match &self.kind {
            VarKind::Query { query, .. } => query.as_ref(),
            _ => None,
        }
    }

    /// Registered subscription descriptor, for subscription variables.
    #[must_use]
    pub fn sub(&self) -> Option<&SubscriptionDescriptor> {
        match &self.kind {
            VarKind::Sub { sub, .. } => sub.as_ref(),
            _ => None,
        }
    }
}

/// A validated rule with its dependency graph and evaluation orders.
///
/// `until_mount` holds the mount gate and everything it transitively depends
/// on, dependencies before dependents, so `mount` is its last entry.
/// `after_mount` holds every other variable, evaluated only while mounted.
#[derive(Debug, Clone)]
pub struct ActiveRule {
    pub(crate) name: String,
    pub(crate) vars: BTreeMap<String, Variable>,
    pub(crate) fragment_cache: HashMap<String, FlatFragment>,
    pub(crate) until_mount: Vec<String>,
    pub(crate) after_mount: Vec<String>,
}

impl ActiveRule {
    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The variable called `name`.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Every variable, by name.
    pub fn vars(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    /// Value of `name`, if the variable exists.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).map(Variable::value)
    }

    /// Variables evaluated while deciding the mount gate, mount included.
    #[must_use]
    pub fn until_mount(&self) -> &[String] {
        &self.until_mount
    }

    /// Variables evaluated only while mounted, in dependency order.
    #[must_use]
    pub fn after_mount(&self) -> &[String] {
        &self.after_mount
    }

    /// Whether the mount gate is currently open.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.value(MOUNT).is_some_and(truthy)
    }

    /// Position of `name` in `until_mount ++ after_mount`.
    #[must_use]
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.until_mount
            .iter()
            .chain(&self.after_mount)
            .position(|v| v == name)
    }

    /// The earliest-evaluated of `names`.
    pub(crate) fn highest_ranking<'n>(&self, names: impl IntoIterator<Item = &'n String>) -> Option<&'n String> {
        names
            .into_iter()
            .filter_map(|n| self.rank(n).map(|r| (r, n)))
            .min_by_key(|(r, _)| *r)
            .map(|(_, n)| n)
    }

    pub(crate) fn fragment_vars(&self) -> impl Iterator<Item = &String> {
        self.vars
            .values()
            .filter(|v| v.category() == VarCategory::Fragments)
            .map(|v| &v.name)
    }
}
