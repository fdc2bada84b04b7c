//! Provenance records.
//!
//! Every delta the engine produces, and every variable change, carries a
//! [`Reason`] saying why it happened.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::SubReadyNotice;
use crate::source::ChangeEvent;

/// Unique identifier for a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReasonId(Uuid);

impl ReasonId {
    /// Create a new random reason id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReasonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReasonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Coarse category of a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasonCategory {
    /// A rule was added, changed or removed.
    Rule,
    /// A batch of collection changes.
    Transaction,
    /// A subscription became ready.
    SubReady,
}

/// Rule operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOpKind {
    /// `add_rule`.
    Added,
    /// `change_rule`.
    Changed,
    /// `remove_rule`.
    Removed,
}

/// What caused a change.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum Cause {
    /// A rule was added, changed or removed.
    Rule { op: RuleOpKind, rule: String },
    /// A batch of source change events.
    Transaction { events: Vec<ChangeEvent> },
    /// A subscription became ready.
    SubReady { notice: SubReadyNotice },
}

/// Provenance of a delta or variable change.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    pub id: ReasonId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub cause: Cause,
}

impl Reason {
    /// Wrap a cause in a fresh reason.
    #[must_use]
    pub fn new(cause: Cause) -> Self {
        Self {
            id: ReasonId::new(),
            at: Utc::now(),
            cause,
        }
    }

    /// Reason for a rule operation.
    #[must_use]
    pub fn rule(op: RuleOpKind, rule: impl Into<String>) -> Self {
        Self::new(Cause::Rule { op, rule: rule.into() })
    }

    /// Reason for a batch of change events.
    #[must_use]
    pub fn transaction(events: Vec<ChangeEvent>) -> Self {
        Self::new(Cause::Transaction { events })
    }

    /// Reason for a subscription-ready notice.
    #[must_use]
    pub fn sub_ready(notice: SubReadyNotice) -> Self {
        Self::new(Cause::SubReady { notice })
    }

    /// The coarse category of this reason.
    #[must_use]
    pub const fn category(&self) -> ReasonCategory {
        match self.cause {
            Cause::Rule { .. } => ReasonCategory::Rule,
            Cause::Transaction { .. } => ReasonCategory::Transaction,
            Cause::SubReady { .. } => ReasonCategory::SubReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_get_unique_ids() {
        let a = Reason::rule(RuleOpKind::Added, "r");
        let b = Reason::rule(RuleOpKind::Added, "r");
        assert_ne!(a.id, b.id);
        assert_eq!(a.category(), ReasonCategory::Rule);
    }

    #[test]
    fn reason_serializes_with_category_tag() {
        let json = serde_json::to_value(Reason::transaction(Vec::new())).unwrap();
        assert_eq!(json["category"], "transaction");
        assert!(json["events"].as_array().unwrap().is_empty());
    }
}
