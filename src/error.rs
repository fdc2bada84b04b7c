//! Error types for Stardust.
//!
//! All errors in Stardust are strongly typed using thiserror.
//! Validation errors reject a submission before anything is activated;
//! execution errors are raised while the engine processes an input.

use thiserror::Error;

/// Validation errors that occur before a rule or source is accepted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Rule '{rule}' has no mount declaration")]
    MissingMount {
        rule: String,
    },

    #[error("Rule '{rule}' declares variable '{var}' more than once")]
    DuplicateVariable {
        rule: String,
        var: String,
    },

    #[error("Rule '{rule}': variable '{var}' depends on unknown variable '{dependency}'")]
    DanglingDependency {
        rule: String,
        var: String,
        dependency: String,
    },

    #[error("Rule '{rule}': variable '{var}' depends on fragments variable '{dependency}'")]
    FragmentDependency {
        rule: String,
        var: String,
        dependency: String,
    },

    #[error("Rule '{rule}' has a dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency {
        rule: String,
        cycle: Vec<String>,
    },

    #[error("Rule '{rule}' is already active")]
    DuplicateRule {
        rule: String,
    },

    #[error("Source '{name}' is already registered")]
    DuplicateSource {
        name: String,
    },

    #[error("Source has no name; pass one when registering it")]
    UnnamedSource,

    #[error("Invalid projection: {reason}")]
    InvalidProjection {
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while the engine processes an input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Unknown rule: {rule}")]
    UnknownRule {
        rule: String,
    },

    #[error("Unknown source: {name}")]
    UnknownSource {
        name: String,
    },

    #[error("Illegal operation '{op}' in {context}")]
    IllegalOperation {
        context: String,
        op: String,
    },

    #[error("Recompute of '{rule}.{var}' failed: {message}")]
    RecomputeFailed {
        rule: String,
        var: String,
        message: String,
    },

    #[error("Source error: {message}")]
    Source {
        message: String,
    },

    #[error("Subscription error: {message}")]
    Subscription {
        message: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Queue full on {path} (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for Stardust.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StardustError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl StardustError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the error aborted the input that raised it.
    ///
    /// A failed recompute is reported per variable and never aborts the
    /// surrounding step; everything else does.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Execution(ExecutionError::RecomputeFailed { .. }))
    }
}

/// Result type alias for Stardust operations.
pub type StardustResult<T> = Result<T, StardustError>;
