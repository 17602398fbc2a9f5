//! Dataflow operators.
//!
//! Every operator implements [`Operator`](crate::graph::Operator): it drains
//! the delta messages waiting on its reader(s), applies its transformation,
//! and writes output deltas. Stateless operators (`map`, `filter`, `tap`)
//! forward message-by-message; stateful ones (`join`, `reduce`, the ordered
//! window) keep hybrid indexes or counters across runs.

pub mod consolidate;
pub mod join;
pub mod linear;
pub mod output;
pub mod reduce;
pub mod topk;

pub use join::JoinKind;
pub use output::OutputEvent;
pub use topk::{OrderByOptions, WindowSizeProbe};
