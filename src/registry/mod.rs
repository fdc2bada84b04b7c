//! Shared registries for queries and subscriptions.
//!
//! Both registries are reference counted by client: a [`VarRef`] naming the
//! rule variable that asked for the resource.

mod query;
mod subscription;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use query::{QueryData, QueryDescriptor, QueryEntry, QueryOp, QueryRegistry};
pub use subscription::{SubReadyNotice, SubscriptionDescriptor, SubscriptionEntry, SubscriptionRegistry};

/// A rule variable, by rule name and variable name.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarRef {
    pub rule: String,
    pub var: String,
}

impl VarRef {
    /// Reference variable `var` of rule `rule`.
    #[must_use]
    pub fn new(rule: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            var: var.into(),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.rule, self.var)
    }
}
