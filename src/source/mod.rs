//! External reactive collaborators.
//!
//! Traits for data sources, selector matchers and subscription transports,
//! the change events sources report, and in-memory implementations.

mod event;
mod matcher;
mod memory;
mod projection;
mod traits;

pub use event::{ChangeEvent, ChangeOp, ChangeSink};
pub use matcher::{SelectorMatcher, SelectorMatcherFactory};
pub use memory::{MemoryCollection, MemoryHandle, MemoryTransport};
pub use projection::Projection;
pub use traits::{
    DataSource, DocumentMatcher, MatcherFactory, ReadyCallback, SourceError, SubscriptionHandle,
    SubscriptionTransport,
};
