//! Source change events.

use std::fmt;
use std::str::FromStr;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, StardustError, StardustResult};
use crate::value::Document;

/// Kind of change a source reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// A document was inserted.
    Added,
    /// A document was replaced; the event carries the new version.
    Changed,
    /// A document was deleted; the event carries its last version.
    Removed,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
        })
    }
}

impl FromStr for ChangeOp {
    type Err = StardustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(Self::Added),
            "changed" => Ok(Self::Changed),
            "removed" => Ok(Self::Removed),
            other => Err(ExecutionError::IllegalOperation {
                context: "change event".to_string(),
                op: other.to_string(),
            }
            .into()),
        }
    }
}

/// One change reported by a source.
///
/// For `removed`, `doc` is the document as it was before removal.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source: String,
    pub op: ChangeOp,
    pub doc: Document,
}

impl ChangeEvent {
    /// A document was added.
    #[must_use]
    pub fn added(source: impl Into<String>, doc: Document) -> Self {
        Self { source: source.into(), op: ChangeOp::Added, doc }
    }

    /// A document changed; `doc` is its new version.
    #[must_use]
    pub fn changed(source: impl Into<String>, doc: Document) -> Self {
        Self { source: source.into(), op: ChangeOp::Changed, doc }
    }

    /// A document was removed; `doc` is its last version.
    #[must_use]
    pub fn removed(source: impl Into<String>, doc: Document) -> Self {
        Self { source: source.into(), op: ChangeOp::Removed, doc }
    }
}

/// Where a source delivers its change notifications.
///
/// Sends block when the engine's event queue is full.
#[derive(Debug, Clone)]
pub struct ChangeSink {
    source: String,
    tx: Sender<ChangeEvent>,
}

impl ChangeSink {
    /// A sink tagging every event with `source`.
    #[must_use]
    pub fn new(source: impl Into<String>, tx: Sender<ChangeEvent>) -> Self {
        Self { source: source.into(), tx }
    }

    /// The source name events are tagged with.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Report an added document.
    pub fn added(&self, doc: Document) -> StardustResult<()> {
        self.send(ChangeOp::Added, doc)
    }

    /// Report a changed document.
    pub fn changed(&self, doc: Document) -> StardustResult<()> {
        self.send(ChangeOp::Changed, doc)
    }

    /// Report a removed document.
    pub fn removed(&self, doc: Document) -> StardustResult<()> {
        self.send(ChangeOp::Removed, doc)
    }

    /// Report a change given by its textual op tag.
    ///
    /// An unknown tag is an `IllegalOperation` and nothing is sent.
    pub fn emit(&self, op: &str, doc: Document) -> StardustResult<()> {
        let op = op.parse::<ChangeOp>()?;
        self.send(op, doc)
    }

    fn send(&self, op: ChangeOp, doc: Document) -> StardustResult<()> {
        self.tx
            .send(ChangeEvent {
                source: self.source.clone(),
                op,
                doc,
            })
            .map_err(|_| {
                ExecutionError::Disconnected {
                    path: "change_events".to_string(),
                }
                .into()
            })
    }
}
