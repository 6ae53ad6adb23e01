//! Capability-reference RPC with promise pipelining and callback
//! capture/replay.
//!
//! A caller holds [`CapabilityRef`]s to remote objects and chains
//! operations on them through [`StubReference`]s without waiting for
//! intermediate results; `resolve()` sends the whole chain as one call
//! graph. Functions cross the boundary through [`capture`]: they run once
//! locally against recording stand-ins, and the resulting
//! [`OperationRecord`] is replayed remotely against the real objects.

pub mod capture;
pub mod config;
pub mod demo;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod rowset;
pub mod session;
pub mod target;
pub mod util;
pub mod value;

pub use capture::{capture, Captures};
pub use config::{ConfigError, SessionConfig};
pub use error::{CaptureError, RemoteError, RemoteErrorKind, ReplayError, RpcError};
pub use pipeline::{Param, PendingResult, Resolved, StubReference};
pub use record::{
    CallbackReplayEngine, Captured, Expr, Operand, Operation, OperationRecord, OperationRecorder,
    PlaceholderId,
};
pub use rowset::{QueryService, RowSet};
pub use session::{
    CapabilityId, CapabilityRef, FrameTap, LineTransport, MemoryTransport, TransportError,
    TransportSession,
};
pub use target::{Live, TargetObject};
pub use value::Value;
