//! # Stardust - reactive rules over live data
//!
//! Stardust keeps an application-state snapshot in sync with declarative
//! rules. A rule reads live queries, parameters and subscriptions, and
//! contributes state fragments while its mount gate is open. Whenever a data
//! source changes, only the affected variables are recomputed, and the
//! resulting set/unset delta is merged into a new immutable snapshot.
//!
//! ## Core Concepts
//!
//! - **Rule**: mount gate, queries, params, subscriptions and fragments
//! - **Fragment**: a piece of derived state, expressed as dotted-path deltas
//! - **Reason**: provenance attached to every delta
//! - **AppState**: a persistent snapshot of the merged state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use stardust::{Declaration, MemoryTransport, QueryDescriptor, Rule, Stardust, StardustConfig};
//!
//! let stardust = Stardust::new(StardustConfig::default(), Arc::new(MemoryTransport::new()))?;
//! stardust.on_app_state_change(|state| println!("{}", state.to_json()))?;
//!
//! stardust.add_rule(
//!     Rule::new()
//!         .named("login")
//!         .query("user", Declaration::constant(Some(QueryDescriptor::find_one("users", json!({})))))
//!         .mount(Declaration::computed(["user"], |s| Ok(s.is_undefined("user"))))
//!         .fragment(Declaration::constant(json!({"page": "login"}))),
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod logging;
pub mod reason;
pub mod registry;
pub mod rule;
pub mod source;
pub mod state;
pub mod value;

// Re-export primary types at crate root for convenience
pub use config::StardustConfig;
pub use engine::{EventBuffer, Input, Outcome, RuleEngine, RuleOp, Stardust};
pub use error::{ExecutionError, StardustError, StardustResult, ValidationError};
pub use fragment::{FlatFragment, FragmentDelta};
pub use reason::{Cause, Reason, ReasonCategory, ReasonId, RuleOpKind};
pub use registry::{QueryDescriptor, QueryOp, SubReadyNotice, SubscriptionDescriptor, VarRef};
pub use rule::{activate, ActiveRule, ComputeError, ComputeResult, Declaration, Rule, Scope, VarCategory, Variable};
pub use source::{
    ChangeEvent, ChangeOp, ChangeSink, DataSource, MatcherFactory, MemoryCollection, MemoryTransport, Projection,
    SourceError, SubscriptionTransport,
};
pub use state::AppState;
pub use value::{Document, Value};
