//! Variable declarations and the scope recompute functions read from.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::value::{truthy, Value};

use super::active::Variable;

/// Failure raised by a recompute function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ComputeError(pub String);

impl ComputeError {
    /// Error with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self(format!("panicked: {message}"))
    }
}

/// Result of a recompute function.
pub type ComputeResult<T> = Result<T, ComputeError>;

type ComputeFn<T> = dyn Fn(&Scope<'_>) -> ComputeResult<T> + Send + Sync;

/// A shareable recompute function.
pub struct Computation<T>(Arc<ComputeFn<T>>);

impl<T> Computation<T> {
    /// Wrap `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Scope<'_>) -> ComputeResult<T> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Evaluate against `scope`. Panics inside the function are caught and
    /// returned as errors.
    pub fn call(&self, scope: &Scope<'_>) -> ComputeResult<T> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(scope))).unwrap_or_else(|payload| Err(ComputeError::from_panic(&*payload)))
    }
}

impl<T: Clone + Send + Sync + 'static> Computation<T> {
    /// A function always returning `value`.
    pub fn constant(value: T) -> Self {
        Self::new(move |_| Ok(value.clone()))
    }
}

impl<T> Clone for Computation<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Computation(..)")
    }
}

/// How a variable gets its value.
#[derive(Debug, Clone)]
pub enum Declaration<T> {
    /// A fixed value with no dependencies.
    Constant(T),
    /// A function of other variables.
    ///
    /// `deps: None` asks for the dependencies to be inferred at activation
    /// by probing the function once with every variable undefined.
    Computed {
        deps: Option<Vec<String>>,
        compute: Computation<T>,
    },
}

impl<T> Declaration<T> {
    /// A constant.
    pub fn constant(value: T) -> Self {
        Self::Constant(value)
    }

    /// A function of the named variables.
    pub fn computed<I, S, F>(deps: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Scope<'_>) -> ComputeResult<T> + Send + Sync + 'static,
    {
        Self::Computed {
            deps: Some(deps.into_iter().map(Into::into).collect()),
            compute: Computation::new(f),
        }
    }

    /// A function whose dependencies are inferred from the names it reads.
    ///
    /// Inference only sees the reads made while every variable is
    /// undefined; prefer [`Declaration::computed`] for functions that branch.
    pub fn inferred<F>(f: F) -> Self
    where
        F: Fn(&Scope<'_>) -> ComputeResult<T> + Send + Sync + 'static,
    {
        Self::Computed {
            deps: None,
            compute: Computation::new(f),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Declaration<T> {
    /// The recompute function and its resolved dependency list.
    pub(crate) fn lower(self) -> (Computation<T>, Vec<String>) {
        match self {
            Self::Constant(value) => (Computation::constant(value), Vec::new()),
            Self::Computed { deps: Some(deps), compute } => {
                let mut seen = BTreeSet::new();
                let deps = deps.into_iter().filter(|d| seen.insert(d.clone())).collect();
                (compute, deps)
            }
            Self::Computed { deps: None, compute } => {
                let probe = Scope::recording();
                // Only the reads matter; the probe's result is discarded.
                let _ = compute.call(&probe);
                (compute, probe.into_reads())
            }
        }
    }
}

static UNDEFINED: Value = Value::Null;

/// Read-only view of a rule's variable values during a recompute.
pub struct Scope<'a> {
    vars: Option<&'a BTreeMap<String, Variable>>,
    reads: Option<RefCell<BTreeSet<String>>>,
}

impl<'a> Scope<'a> {
    pub(crate) fn over(vars: &'a BTreeMap<String, Variable>) -> Self {
        Self { vars: Some(vars), reads: None }
    }

    fn recording() -> Self {
        Self {
            vars: None,
            reads: Some(RefCell::new(BTreeSet::new())),
        }
    }

    fn into_reads(self) -> Vec<String> {
        self.reads.map(|r| r.into_inner().into_iter().collect()).unwrap_or_default()
    }

    /// Current value of `name`; undefined (`null`) when it has none.
    #[must_use]
    pub fn get(&self, name: &str) -> &Value {
        if let Some(reads) = &self.reads {
            reads.borrow_mut().insert(name.to_string());
        }
        self.vars
            .and_then(|vars| vars.get(name))
            .map_or(&UNDEFINED, Variable::value)
    }

    /// Truthiness of `name`.
    #[must_use]
    pub fn truthy(&self, name: &str) -> bool {
        truthy(self.get(name))
    }

    /// `name` as a string, if it is one.
    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).as_str()
    }

    /// True when `name` is undefined.
    #[must_use]
    pub fn is_undefined(&self, name: &str) -> bool {
        self.get(name).is_null()
    }
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("recording", &self.reads.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constants_have_no_deps() {
        let (compute, deps) = Declaration::constant(json!(3)).lower();
        assert!(deps.is_empty());
        assert_eq!(compute.call(&Scope::recording()).unwrap(), json!(3));
    }

    #[test]
    fn explicit_deps_are_deduplicated() {
        let (_, deps) = Declaration::computed(["a", "b", "a"], |_| Ok(Value::Null)).lower();
        assert_eq!(deps, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn inferred_deps_come_from_reads() {
        let decl = Declaration::inferred(|s| Ok(json!({"who": s.get("user"), "on": s.truthy("flag")})));
        let (_, deps) = decl.lower();
        assert_eq!(deps, vec!["flag".to_string(), "user".to_string()]);
    }

    #[test]
    fn panics_become_errors() {
        let compute: Computation<bool> = Computation::new(|_| panic!("boom"));
        let err = compute.call(&Scope::recording()).unwrap_err();
        assert!(err.0.contains("boom"));
    }
}
