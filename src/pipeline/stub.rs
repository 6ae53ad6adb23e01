//! Client-side proxies for unresolved remote values.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{CaptureError, ReplayError, RpcError};
use crate::record::{
    Arg, CallbackRecord, CallbackReplayEngine, Env, Expr, IntoCaptured, Operation,
    OperationRecord, OperationRecorder, PlaceholderId,
};
use crate::session::{CapHandle, CapabilityId, CapabilityRef, PendingCall, TransportSession};
use crate::target::Live;
use crate::value::Value;

use super::graph::GraphBuilder;

/// What a stub resolves to
#[derive(Clone, Debug)]
pub enum Resolved {
    Value(Value),
    Capability(CapabilityRef),
}

impl Resolved {
    pub fn into_value(self) -> Result<Value, RpcError> {
        match self {
            Resolved::Value(value) => Ok(value),
            Resolved::Capability(cap) => Err(RpcError::Decode(format!(
                "expected a value, got capability {} ({})",
                cap.id(),
                cap.type_tag()
            ))),
        }
    }

    pub fn into_capability(self) -> Result<CapabilityRef, RpcError> {
        match self {
            Resolved::Capability(cap) => Ok(cap),
            Resolved::Value(value) => Err(RpcError::Decode(format!(
                "expected a capability, got {}",
                value.kind()
            ))),
        }
    }
}

/// Argument to a queued call
#[derive(Clone, Debug)]
pub enum Param {
    Value(Value),
    /// Another stub; embedded in the same graph when its base is live
    Stub(StubReference),
    /// A callback recorded ahead of time
    Callback(CallbackRecord),
}

impl Param {
    /// Record `callback` now; shape errors surface here, before any I/O
    pub fn callback<F, R>(callback: F) -> Result<Param, CaptureError>
    where
        F: FnOnce(Expr) -> R,
        R: IntoCaptured,
    {
        OperationRecorder::record(callback).map(Param::Callback)
    }

    fn to_local_arg(&self) -> Result<Arg, RpcError> {
        match self {
            Param::Value(value) => Ok(Arg::Value(value.clone())),
            Param::Callback(record) => Ok(Arg::Callback(Box::new(record.clone()))),
            Param::Stub(_) => Err(RpcError::Local(ReplayError::mismatch(
                "a stub cannot be an argument to a plain value",
            ))),
        }
    }
}

macro_rules! param_from_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Param {
                fn from(value: $ty) -> Self {
                    Param::Value(Value::from(value))
                }
            }
        )*
    };
}

param_from_value!(Value, bool, i32, i64, f64, &str, String);

impl From<StubReference> for Param {
    fn from(stub: StubReference) -> Self {
        Param::Stub(stub)
    }
}

impl From<&StubReference> for Param {
    fn from(stub: &StubReference) -> Self {
        Param::Stub(stub.clone())
    }
}

impl From<CapabilityRef> for Param {
    fn from(cap: CapabilityRef) -> Self {
        Param::Stub(StubReference::from(cap))
    }
}

/// Shares the reference's handle rather than duplicating it
impl From<&CapabilityRef> for Param {
    fn from(cap: &CapabilityRef) -> Self {
        Param::Stub(cap.stub())
    }
}

impl From<CallbackRecord> for Param {
    fn from(record: CallbackRecord) -> Self {
        Param::Callback(record)
    }
}

#[derive(Clone, Debug)]
pub(crate) enum PendingOp {
    Get(String),
    Call(String, Vec<Param>),
}

enum StubNode {
    Capability(Arc<CapHandle>),
    InFlight(PendingCall),
    Step { target: StubReference, op: PendingOp },
}

fn node_key(node: &Arc<StubNode>) -> usize {
    Arc::as_ptr(node) as usize
}

/// A queued operation and the stub node holding its result
#[derive(Clone)]
pub(crate) struct QueuedOp {
    pub(crate) op: PendingOp,
    node: Arc<StubNode>,
}

impl QueuedOp {
    /// Identity of the step, shared by every stub forked from it
    pub(crate) fn key(&self) -> usize {
        node_key(&self.node)
    }
}

pub(crate) enum Base {
    Capability(Arc<CapHandle>),
    InFlight(PendingCall),
}

/// A stub whose base is known: a live capability with queued operations, or
/// a plain value already computed.
pub(crate) enum Settled {
    Capability(Arc<CapHandle>, Vec<QueuedOp>),
    Value(Value),
}

/// Steps reached more than once from `roots`, along chains or through stub
/// arguments. Each must run once per graph however many uses it has.
pub(crate) fn shared_steps<'a>(roots: impl IntoIterator<Item = &'a StubReference>) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut shared = HashSet::new();
    let mut stack: Vec<&Arc<StubNode>> = roots.into_iter().map(|stub| &stub.node).collect();
    while let Some(node) = stack.pop() {
        let StubNode::Step { target, op } = node.as_ref() else {
            continue;
        };
        if !seen.insert(node_key(node)) {
            shared.insert(node_key(node));
            continue;
        }
        stack.push(&target.node);
        if let PendingOp::Call(_, params) = op {
            stack.extend(params.iter().filter_map(|param| match param {
                Param::Stub(stub) => Some(&stub.node),
                _ => None,
            }));
        }
    }
    shared
}

/// Proxy for a remote value that may not exist yet.
///
/// `get` and `call` queue operations without sending anything; `resolve`
/// sends the whole chain as one call graph. Stubs are immutable, so a chain
/// can fork: `a.get("x")` and `a.get("y")` share the queued prefix of `a`.
#[derive(Clone)]
pub struct StubReference {
    node: Arc<StubNode>,
}

/// Result of a `capture`; resolves like any other stub
pub type PendingResult = StubReference;

impl StubReference {
    pub(crate) fn capability(handle: Arc<CapHandle>) -> Self {
        Self {
            node: Arc::new(StubNode::Capability(handle)),
        }
    }

    pub(crate) fn in_flight(call: PendingCall) -> Self {
        Self {
            node: Arc::new(StubNode::InFlight(call)),
        }
    }

    fn step(&self, op: PendingOp) -> Self {
        Self {
            node: Arc::new(StubNode::Step {
                target: self.clone(),
                op,
            }),
        }
    }

    /// Queue a property read
    pub fn get(&self, name: &str) -> StubReference {
        self.step(PendingOp::Get(name.to_string()))
    }

    /// Queue a method call
    pub fn call(&self, name: &str, params: Vec<Param>) -> StubReference {
        self.step(PendingOp::Call(name.to_string(), params))
    }

    /// Queue a method call taking a single recorded callback
    pub fn call_with<F, R>(&self, name: &str, callback: F) -> Result<StubReference, CaptureError>
    where
        F: FnOnce(Expr) -> R,
        R: IntoCaptured,
    {
        Ok(self.call(name, vec![Param::callback(callback)?]))
    }

    /// Operations queued since the base capability or in-flight call
    pub fn queued(&self) -> usize {
        self.unwind().1.len()
    }

    /// True when the chain starts at a call that has not settled yet
    pub fn is_in_flight(&self) -> bool {
        matches!(self.unwind().0, Base::InFlight(_))
    }

    pub fn session(&self) -> TransportSession {
        match self.unwind().0 {
            Base::Capability(handle) => handle.session().clone(),
            Base::InFlight(call) => call.session().clone(),
        }
    }

    pub(crate) fn unwind(&self) -> (Base, Vec<QueuedOp>) {
        let mut ops = Vec::new();
        let mut node = &self.node;
        let base = loop {
            match node.as_ref() {
                StubNode::Capability(handle) => break Base::Capability(handle.clone()),
                StubNode::InFlight(call) => break Base::InFlight(call.clone()),
                StubNode::Step { target, op } => {
                    ops.push(QueuedOp {
                        op: op.clone(),
                        node: node.clone(),
                    });
                    node = &target.node;
                }
            }
        };
        ops.reverse();
        (base, ops)
    }

    /// Wait for an in-flight base; a plain-value result has the queued
    /// operations applied locally.
    pub(crate) async fn settle(&self) -> Result<Settled, RpcError> {
        let (base, ops) = self.unwind();
        match base {
            Base::Capability(handle) => Ok(Settled::Capability(handle, ops)),
            Base::InFlight(call) => match call.wait().await? {
                Resolved::Capability(cap) => Ok(Settled::Capability(cap.into_handle(), ops)),
                Resolved::Value(value) => {
                    apply_local(value, ops.iter().map(|queued| &queued.op)).map(Settled::Value)
                }
            },
        }
    }

    /// Send the queued chain as one call graph and wait for its result
    pub async fn resolve(&self) -> Result<Resolved, RpcError> {
        match self.session().config().resolve_timeout {
            Some(limit) => tokio::time::timeout(limit, self.resolve_chain())
                .await
                .map_err(|_| RpcError::Timeout(limit.as_millis() as u64))?,
            None => self.resolve_chain().await,
        }
    }

    /// Resolve and expect a plain value
    pub async fn resolve_value(&self) -> Result<Value, RpcError> {
        self.resolve().await?.into_value()
    }

    /// Resolve and expect a capability
    pub async fn resolve_capability(&self) -> Result<CapabilityRef, RpcError> {
        self.resolve().await?.into_capability()
    }

    /// Resolve and deserialize the value into `T`
    pub async fn resolve_as<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let value = self.resolve_value().await?;
        serde_json::from_value(value.to_json()).map_err(|err| RpcError::Decode(err.to_string()))
    }

    async fn resolve_chain(&self) -> Result<Resolved, RpcError> {
        let (handle, ops) = match self.settle().await? {
            Settled::Value(value) => return Ok(Resolved::Value(value)),
            Settled::Capability(handle, ops) => (handle, ops),
        };
        if handle.is_disposed() {
            return Err(RpcError::ReferenceDisposed(handle.id()));
        }
        if ops.is_empty() {
            return Ok(Resolved::Capability(CapabilityRef::from_handle(
                handle.duplicate(),
            )));
        }

        let session = handle.session().clone();
        let root = handle.id();
        let mut builder = GraphBuilder::new(session.clone(), PlaceholderId(1))
            .sharing(shared_steps([self]));
        let (anchor, operations) = builder.chain(handle, ops).await?;
        let (bindings, keep_alive) = builder.finish();
        let call = session.dispatch(
            root,
            OperationRecord::new(anchor.subject(), operations),
            bindings,
            keep_alive,
        )?;
        call.wait().await
    }

    /// Capability at the base of the chain, if it is not an in-flight call
    pub fn base_capability(&self) -> Option<CapabilityId> {
        match self.unwind().0 {
            Base::Capability(handle) => Some(handle.id()),
            Base::InFlight(_) => None,
        }
    }
}

impl From<CapabilityRef> for StubReference {
    fn from(cap: CapabilityRef) -> Self {
        StubReference::capability(cap.into_handle())
    }
}

impl fmt::Debug for StubReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, ops) = self.unwind();
        let mut out = f.debug_struct("StubReference");
        match &base {
            Base::Capability(handle) => out.field("capability", &handle.id()),
            Base::InFlight(call) => out.field("in_flight", call),
        };
        let names: Vec<String> = ops
            .iter()
            .map(|queued| match &queued.op {
                PendingOp::Get(name) => name.clone(),
                PendingOp::Call(name, _) => format!("{name}()"),
            })
            .collect();
        out.field("queued", &names).finish()
    }
}

/// Apply queued operations to a value that already arrived
fn apply_local<'a>(
    value: Value,
    ops: impl IntoIterator<Item = &'a PendingOp>,
) -> Result<Value, RpcError> {
    let env = Env::new();
    let mut working = Live::Value(value);
    for op in ops {
        let op = match op {
            PendingOp::Get(name) => Operation::Get(name.clone()),
            PendingOp::Call(name, params) => Operation::Call(
                name.clone(),
                params
                    .iter()
                    .map(Param::to_local_arg)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        working = CallbackReplayEngine::apply(working, &op, &env)?;
    }
    Ok(working.into_value()?)
}
