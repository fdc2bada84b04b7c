//! Collaborator contracts.
//!
//! The engine never talks to a concrete database or transport. It consumes
//! these traits instead:
//! - [`DataSource`]: a named reactive collection that can run `find`/`findOne`
//!   and reports its changes to a [`ChangeSink`]
//! - [`MatcherFactory`]/[`DocumentMatcher`]: selector evaluation, built once per
//!   distinct selector
//! - [`SubscriptionTransport`]: starts named subscriptions and reports readiness

use thiserror::Error;

use crate::error::{ExecutionError, StardustError};
use crate::value::{Document, Value};

use super::event::ChangeSink;
use super::projection::Projection;

/// Errors raised by collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// Selector could not be compiled.
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// Document is missing or malformed.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Key not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend error.
    #[error("Source backend error: {0}")]
    BackendError(String),
}

impl From<SourceError> for StardustError {
    fn from(err: SourceError) -> Self {
        Self::Execution(ExecutionError::Source {
            message: err.to_string(),
        })
    }
}

/// A named reactive collection of documents.
///
/// Implementations must report a change to their observers only after the
/// change is visible to `find`/`find_one`.
pub trait DataSource: Send + Sync {
    /// The source's own name, if it has one.
    fn name(&self) -> Option<String>;

    /// All documents matching `selector`, with `projection` applied.
    fn find(&self, selector: &Value, projection: Option<&Projection>) -> Result<Vec<Document>, SourceError>;

    /// The first document matching `selector`, with `projection` applied.
    fn find_one(&self, selector: &Value, projection: Option<&Projection>) -> Result<Option<Document>, SourceError>;

    /// Start reporting `added`/`changed`/`removed` notifications to `sink`.
    fn observe(&self, sink: ChangeSink) -> Result<(), SourceError>;
}

/// A compiled selector.
pub trait DocumentMatcher: Send + Sync {
    /// True when `doc` satisfies the selector.
    fn matches(&self, doc: &Document) -> bool;
}

/// Builds a [`DocumentMatcher`] for a selector.
pub trait MatcherFactory: Send + Sync {
    /// Compile `selector`.
    fn build(&self, selector: &Value) -> Result<Box<dyn DocumentMatcher>, SourceError>;
}

/// Invoked once when a subscription becomes ready.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// A live subscription.
pub trait SubscriptionHandle: Send {
    /// Stop the subscription. Called exactly once, when its last client leaves.
    fn stop(&mut self);
}

/// Starts named subscriptions.
pub trait SubscriptionTransport: Send + Sync {
    /// Start subscription `name` with `args`; call `on_ready` once its
    /// initial data has arrived. `on_ready` may be called from any thread,
    /// including synchronously from inside `subscribe`.
    fn subscribe(
        &self,
        name: &str,
        args: &Value,
        on_ready: ReadyCallback,
    ) -> Result<Box<dyn SubscriptionHandle>, SourceError>;
}
