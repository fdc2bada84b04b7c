//! Rules: declarations, activation and the engine-owned active form.
//!
//! # Example
//! ```rust,ignore
//! let rule = Rule::new()
//!     .named("login")
//!     .query("user", Declaration::constant(Some(QueryDescriptor::find_one("users", json!({})))))
//!     .mount(Declaration::computed(["user"], |s| Ok(s.is_undefined("user"))))
//!     .fragment(Declaration::constant(json!({"page": "login"})));
//! ```

mod active;
mod compiler;
mod declaration;

pub use active::{ActiveRule, VarCategory, Variable, MOUNT};
pub use compiler::activate;
pub use declaration::{Computation, ComputeError, ComputeResult, Declaration, Scope};

pub(crate) use active::VarKind;

use crate::registry::{QueryDescriptor, SubscriptionDescriptor};
use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) enum VarDecl {
    Mount(Declaration<bool>),
    Query(Declaration<Option<QueryDescriptor>>),
    Param(Declaration<Value>),
    Sub(Declaration<Option<SubscriptionDescriptor>>),
    Fragment(Declaration<Value>),
}

/// Declarative rule as submitted by a caller.
///
/// Nothing is checked until the rule is activated; declaring the same name
/// twice, or omitting the mount gate, is reported then.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub(crate) name: Option<String>,
    pub(crate) decls: Vec<(String, VarDecl)>,
    fragments: usize,
}

impl Rule {
    /// An empty, unnamed rule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rule name. Unnamed rules get a generated one.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The name, if one was given.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Declare the mount gate (required, exactly once).
    #[must_use]
    pub fn mount(mut self, decl: Declaration<bool>) -> Self {
        self.decls.push((MOUNT.to_string(), VarDecl::Mount(decl)));
        self
    }

    /// Declare a query variable. `None` means no query.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, decl: Declaration<Option<QueryDescriptor>>) -> Self {
        self.decls.push((name.into(), VarDecl::Query(decl)));
        self
    }

    /// Declare a parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, decl: Declaration<Value>) -> Self {
        self.decls.push((name.into(), VarDecl::Param(decl)));
        self
    }

    /// Declare a subscription variable. `None` means no subscription.
    #[must_use]
    pub fn sub(mut self, name: impl Into<String>, decl: Declaration<Option<SubscriptionDescriptor>>) -> Self {
        self.decls.push((name.into(), VarDecl::Sub(decl)));
        self
    }

    /// Append a state fragment. Fragments are named `fragments.<index>`
    /// and must evaluate to an object or undefined.
    #[must_use]
    pub fn fragment(mut self, decl: Declaration<Value>) -> Self {
        let name = format!("fragments.{}", self.fragments);
        self.fragments += 1;
        self.decls.push((name, VarDecl::Fragment(decl)));
        self
    }
}
