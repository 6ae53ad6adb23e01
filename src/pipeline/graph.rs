//! Lowers queued stub operations into a call graph.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::error::{CaptureError, RpcError};
use crate::record::{Arg, CallbackRecord, Operation, PlaceholderId};
use crate::session::{CapHandle, CapabilityId, CaptureBinding, TransportSession};

use super::stub::{Param, PendingOp, QueuedOp, Settled, StubReference};

/// Where a lowered chain starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Anchor {
    /// The capability at the base of the chain
    Capability,
    /// A shared step already bound earlier in the graph
    Placeholder(PlaceholderId),
}

impl Anchor {
    fn base(self) -> Option<PlaceholderId> {
        match self {
            Anchor::Capability => None,
            Anchor::Placeholder(placeholder) => Some(placeholder),
        }
    }

    /// Subject of a root record starting here
    pub(crate) fn subject(self) -> PlaceholderId {
        self.base().unwrap_or(PlaceholderId::ROOT)
    }
}

/// Accumulates bindings while queued operations are lowered.
///
/// Placeholders from `first_free` upward belong to the builder; stubs
/// embedded as arguments become bindings whose path carries their queued
/// operations, appended after any bindings they depend on. Steps listed as
/// shared get a binding of their own the first time they are lowered; later
/// uses start from that placeholder.
pub(crate) struct GraphBuilder {
    session: TransportSession,
    next: u32,
    bindings: Vec<CaptureBinding>,
    keep_alive: Vec<Arc<CapHandle>>,
    shared: HashSet<usize>,
    bound: HashMap<usize, PlaceholderId>,
}

impl GraphBuilder {
    pub(crate) fn new(session: TransportSession, first_free: PlaceholderId) -> Self {
        Self {
            session,
            next: first_free.0.max(1),
            bindings: Vec::new(),
            keep_alive: Vec::new(),
            shared: HashSet::new(),
            bound: HashMap::new(),
        }
    }

    pub(crate) fn sharing(mut self, shared: HashSet<usize>) -> Self {
        self.shared = shared;
        self
    }

    /// Check `handle` may be used in this graph and hold it until dispatch
    pub(crate) fn require(&mut self, handle: &Arc<CapHandle>) -> Result<(), RpcError> {
        if !handle.session().same_session(&self.session) {
            return Err(CaptureError::MixedSessions.into());
        }
        if handle.is_disposed() {
            return Err(RpcError::ReferenceDisposed(handle.id()));
        }
        self.keep_alive.push(handle.clone());
        Ok(())
    }

    fn fresh(&mut self) -> PlaceholderId {
        let id = PlaceholderId(self.next);
        self.next += 1;
        id
    }

    /// Bind `placeholder` to `handle` reached through `ops`
    pub(crate) fn bind(
        &mut self,
        placeholder: PlaceholderId,
        handle: Arc<CapHandle>,
        ops: Vec<QueuedOp>,
    ) -> BoxFuture<'_, Result<(), RpcError>> {
        async move {
            let capability_id = handle.id();
            let (anchor, path) = self.chain(handle, ops).await?;
            self.push_binding(placeholder, capability_id, anchor, path);
            Ok(())
        }
        .boxed()
    }

    /// Lower the chain `handle` + `ops`, resuming after its deepest step
    /// already bound. Returns where the remaining path starts.
    pub(crate) fn chain(
        &mut self,
        handle: Arc<CapHandle>,
        ops: Vec<QueuedOp>,
    ) -> BoxFuture<'_, Result<(Anchor, Vec<Operation>), RpcError>> {
        async move {
            self.require(&handle)?;
            let resume = ops.iter().enumerate().rev().find_map(|(idx, queued)| {
                self.bound.get(&queued.key()).map(|placeholder| (idx, *placeholder))
            });
            let (mut anchor, skip) = match resume {
                Some((idx, placeholder)) => (Anchor::Placeholder(placeholder), idx + 1),
                None => (Anchor::Capability, 0),
            };

            let mut path = Vec::new();
            for queued in ops.into_iter().skip(skip) {
                let key = queued.key();
                path.push(self.lower_op(queued.op).await?);
                if self.shared.contains(&key) {
                    let placeholder = self.fresh();
                    tracing::trace!(%placeholder, "binding shared step");
                    self.push_binding(
                        placeholder,
                        handle.id(),
                        anchor,
                        std::mem::take(&mut path),
                    );
                    self.bound.insert(key, placeholder);
                    anchor = Anchor::Placeholder(placeholder);
                }
            }
            Ok((anchor, path))
        }
        .boxed()
    }

    fn push_binding(
        &mut self,
        placeholder: PlaceholderId,
        capability_id: CapabilityId,
        anchor: Anchor,
        path: Vec<Operation>,
    ) {
        self.bindings.push(CaptureBinding {
            placeholder_id: placeholder,
            capability_id,
            base_placeholder_id: anchor.base(),
            path,
        });
    }

    async fn lower_op(&mut self, op: PendingOp) -> Result<Operation, RpcError> {
        Ok(match op {
            PendingOp::Get(name) => Operation::Get(name),
            PendingOp::Call(name, params) => {
                let mut args = Vec::with_capacity(params.len());
                for param in params {
                    args.push(self.lower_param(param).await?);
                }
                Operation::Call(name, args)
            }
        })
    }

    async fn lower_param(&mut self, param: Param) -> Result<Arg, RpcError> {
        match param {
            Param::Value(value) => Ok(Arg::Value(value)),
            Param::Callback(record) => Ok(self.adopt_callback(record)),
            Param::Stub(stub) => self.embed(stub).await,
        }
    }

    /// An argument stub: embedded when its base is live, awaited otherwise
    fn embed(&mut self, stub: StubReference) -> BoxFuture<'_, Result<Arg, RpcError>> {
        async move {
            match stub.settle().await? {
                Settled::Value(value) => Ok(Arg::Value(value)),
                Settled::Capability(handle, ops) => {
                    let capability_id = handle.id();
                    match self.chain(handle, ops).await? {
                        (Anchor::Placeholder(placeholder), path) if path.is_empty() => {
                            Ok(Arg::placeholder(placeholder))
                        }
                        (anchor, path) => {
                            let placeholder = self.fresh();
                            self.push_binding(placeholder, capability_id, anchor, path);
                            Ok(Arg::placeholder(placeholder))
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Move a separately recorded callback into this graph's placeholder range
    fn adopt_callback(&mut self, mut record: CallbackRecord) -> Arg {
        let used = record.max_placeholder();
        record.offset_placeholders(self.next - 1);
        self.next += used;
        Arg::Callback(Box::new(record))
    }

    pub(crate) fn finish(self) -> (Vec<CaptureBinding>, Vec<Arc<CapHandle>>) {
        (self.bindings, self.keep_alive)
    }
}
