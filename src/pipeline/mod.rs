//! Promise pipelining: stubs queue operations on unresolved values and
//! flush them as single call graphs.

mod graph;
mod stub;

pub(crate) use graph::GraphBuilder;
pub(crate) use stub::{shared_steps, QueuedOp, Settled};
pub use stub::{Param, PendingResult, Resolved, StubReference};
