//! Transport sessions: wire messages, duplex transports, and capability
//! lifecycles.

mod capability;
pub mod messages;
mod peer;
pub mod transport;

pub use capability::CapabilityRef;
pub use messages::{CallGraph, CallId, CallResult, CapabilityId, CaptureBinding, Outcome, WireMessage};
pub use peer::TransportSession;
pub use transport::{
    FrameSink, FrameStream, FrameTap, LineTransport, MemoryTransport, Transport, TransportError,
};

pub(crate) use capability::CapHandle;
pub(crate) use peer::PendingCall;
