//! One session per duplex channel.
//!
//! A session is symmetric: either side may export a bootstrap object and
//! import the peer's. Outbound messages are serialized FIFO by a writer
//! task; a reader task routes inbound call graphs to spawned serve tasks,
//! results to the pending table, and disposals to the export table.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{RemoteError, RemoteErrorKind, RpcError};
use crate::pipeline::Resolved;
use crate::record::{CallbackReplayEngine, Env, OperationRecord, PlaceholderId};
use crate::target::{Live, TargetObject};

use super::capability::{CapHandle, CapabilityRef};
use super::messages::{
    CallGraph, CallId, CallResult, CapabilityId, CaptureBinding, Outcome, WireMessage,
};
use super::transport::{FrameSink, FrameStream, Transport};

type CallOutcome = Result<Resolved, RpcError>;

/// Type tag given to the peer's bootstrap object before it is known
const BOOTSTRAP_TAG: &str = "Bootstrap";

struct PendingEntry {
    root: CapabilityId,
    deps: Vec<CapabilityId>,
    /// Keys of the handles the graph was built from
    held: Vec<usize>,
    tx: oneshot::Sender<CallOutcome>,
}

struct State {
    closed: Option<String>,
    next_call_id: u64,
    pending: HashMap<CallId, PendingEntry>,
    /// Local handle counts per imported id
    imports: HashMap<CapabilityId, usize>,
    exports: HashMap<CapabilityId, Arc<dyn TargetObject>>,
}

struct Inner {
    id: Uuid,
    config: SessionConfig,
    has_bootstrap: bool,
    next_export_id: AtomicU64,
    state: Mutex<State>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

/// A dispatched call graph awaiting its result
#[derive(Clone)]
pub(crate) struct PendingCall {
    call_id: CallId,
    session: TransportSession,
    result: Shared<BoxFuture<'static, CallOutcome>>,
}

impl PendingCall {
    pub(crate) fn session(&self) -> &TransportSession {
        &self.session
    }

    pub(crate) async fn wait(&self) -> CallOutcome {
        self.result.clone().await
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("call_id", &self.call_id)
            .finish()
    }
}

impl TransportSession {
    /// Start a session over `transport`, exporting `bootstrap` as capability 0.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<T: Transport>(
        transport: T,
        bootstrap: Option<Arc<dyn TargetObject>>,
        config: SessionConfig,
    ) -> Self {
        let (sink, stream) = transport.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut exports: HashMap<CapabilityId, Arc<dyn TargetObject>> = HashMap::new();
        if let Some(object) = &bootstrap {
            exports.insert(CapabilityId::BOOTSTRAP, object.clone());
        }

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            config,
            has_bootstrap: bootstrap.is_some(),
            next_export_id: AtomicU64::new(1),
            state: Mutex::new(State {
                closed: None,
                next_call_id: 1,
                pending: HashMap::new(),
                imports: HashMap::new(),
                exports,
            }),
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(None),
        });
        let session = TransportSession { inner };

        tracing::debug!(
            session = %session.inner.id,
            bootstrap = session.inner.has_bootstrap,
            "Session started"
        );

        tokio::spawn(write_loop(Arc::downgrade(&session.inner), rx, sink));
        let reader = tokio::spawn(session.clone().read_loop(stream));
        *session.inner.reader.lock() = Some(reader);

        session
    }

    /// Start a session that exports `object` as its bootstrap capability
    pub fn serve<O: TargetObject + 'static>(
        transport: impl Transport,
        object: O,
        config: SessionConfig,
    ) -> Self {
        Self::new(transport, Some(Arc::new(object)), config)
    }

    /// Start a session that exports nothing
    pub fn connect(transport: impl Transport, config: SessionConfig) -> Self {
        Self::new(transport, None, config)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Import the peer's bootstrap object (capability 0)
    pub fn bootstrap(&self) -> CapabilityRef {
        self.import(CapabilityId::BOOTSTRAP, BOOTSTRAP_TAG.to_string())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed.is_some()
    }

    /// Calls dispatched and not yet settled
    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Imported ids with at least one live local handle
    pub fn import_count(&self) -> usize {
        self.inner.state.lock().imports.len()
    }

    /// Objects currently exported to the peer, bootstrap included
    pub fn export_count(&self) -> usize {
        self.inner.state.lock().exports.len()
    }

    pub(crate) fn same_session(&self, other: &TransportSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tear the session down. Pending calls reject with `ConnectionLost`;
    /// queued outbound messages are still flushed.
    pub fn shutdown(&self) {
        self.close("session shut down".to_string());
        self.inner.outbound.lock().take();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
    }

    fn send(&self, message: WireMessage) -> Result<(), RpcError> {
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| RpcError::ConnectionLost("writer stopped".to_string())),
            None => Err(RpcError::ConnectionLost("session shut down".to_string())),
        }
    }

    fn import(&self, id: CapabilityId, type_tag: String) -> CapabilityRef {
        let counted = {
            let mut state = self.inner.state.lock();
            if state.closed.is_some() {
                false
            } else {
                *state.imports.entry(id).or_insert(0) += 1;
                true
            }
        };
        let handle = if counted {
            CapHandle::new(id, type_tag, self.clone())
        } else {
            CapHandle::detached(id, type_tag, self.clone())
        };
        CapabilityRef::from_handle(Arc::new(handle))
    }

    /// Count one more local handle for `id`; false once `id` was released
    pub(crate) fn retain(&self, id: CapabilityId) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        match state.imports.get_mut(&id) {
            Some(count) if state.closed.is_none() => {
                *count += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop the local handle `holder` for `id`. Calls built from that handle
    /// are rejected even while other handles keep `id` alive. The last handle
    /// releases the id: the peer is told to dispose it and every call
    /// depending on it is rejected.
    pub(crate) fn release(&self, id: CapabilityId, holder: usize) {
        let (last, rejected) = {
            let mut state = self.inner.state.lock();
            let Some(count) = state.imports.get_mut(&id) else {
                return;
            };
            *count = count.saturating_sub(1);
            let last = *count == 0;
            if last {
                state.imports.remove(&id);
            }
            let calls: Vec<CallId> = state
                .pending
                .iter()
                .filter(|(_, entry)| {
                    entry.held.contains(&holder) || (last && entry.deps.contains(&id))
                })
                .map(|(call_id, _)| *call_id)
                .collect();
            let rejected: Vec<PendingEntry> = calls
                .iter()
                .filter_map(|call_id| state.pending.remove(call_id))
                .collect();
            (last, rejected)
        };
        if !last && rejected.is_empty() {
            return;
        }

        tracing::debug!(
            session = %self.inner.id,
            capability_id = %id,
            released = last,
            rejected = rejected.len(),
            "Capability handle released"
        );
        if last {
            if let Err(err) = self.send(WireMessage::Dispose { capability_id: id }) {
                tracing::debug!(capability_id = %id, error = %err, "Dispose not sent");
            }
        }
        for entry in rejected {
            let _ = entry.tx.send(Err(RpcError::ReferenceDisposed(id)));
        }
    }

    /// Send one call graph. `keep_alive` holds the handles the graph refers
    /// to until its result arrives.
    pub(crate) fn dispatch(
        &self,
        root: CapabilityId,
        operations: OperationRecord,
        bindings: Vec<CaptureBinding>,
        keep_alive: Vec<Arc<CapHandle>>,
    ) -> Result<PendingCall, RpcError> {
        let (tx, rx) = oneshot::channel();
        let call_id = {
            let mut state = self.inner.state.lock();
            if let Some(reason) = &state.closed {
                return Err(RpcError::ConnectionLost(reason.clone()));
            }

            let mut deps = vec![root];
            for binding in &bindings {
                if !deps.contains(&binding.capability_id) {
                    deps.push(binding.capability_id);
                }
            }
            if let Some(gone) = deps.iter().find(|id| !state.imports.contains_key(id)) {
                return Err(RpcError::ReferenceDisposed(*gone));
            }

            let call_id = CallId(state.next_call_id);
            state.next_call_id += 1;
            let graph = CallGraph {
                call_id,
                root_capability_id: root,
                operations,
                imported_references: bindings,
            };
            tracing::debug!(
                session = %self.inner.id,
                call_id = %call_id,
                capability_id = %root,
                bindings = graph.imported_references.len(),
                "Dispatching call graph"
            );
            // Sent under the state lock so call ids reach the wire in order.
            self.send(WireMessage::CallGraph(graph))?;
            let held = keep_alive.iter().map(|handle| handle.key()).collect();
            state.pending.insert(
                call_id,
                PendingEntry {
                    root,
                    deps,
                    held,
                    tx,
                },
            );
            call_id
        };

        let result = async move {
            let _keep_alive = keep_alive;
            rx.await.unwrap_or_else(|_| {
                Err(RpcError::ConnectionLost(
                    "session dropped the call".to_string(),
                ))
            })
        }
        .boxed()
        .shared();

        Ok(PendingCall {
            call_id,
            session: self.clone(),
            result,
        })
    }

    async fn read_loop(self, mut stream: Box<dyn FrameStream>) {
        let reason = loop {
            match stream.recv().await {
                Some(Ok(frame)) => self.handle_frame(&frame),
                Some(Err(err)) => break format!("transport failed: {err}"),
                None => break "peer closed the channel".to_string(),
            }
        };
        self.close(reason);
    }

    fn handle_frame(&self, frame: &str) {
        let message = match WireMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(session = %self.inner.id, error = %err, "Skipping malformed frame");
                return;
            }
        };
        tracing::trace!(session = %self.inner.id, kind = message.kind(), "Frame received");

        match message {
            WireMessage::CallGraph(graph) => {
                let session = self.clone();
                tokio::spawn(async move {
                    let result = session.serve_graph(graph);
                    if let Err(err) = session.send(WireMessage::Result(result)) {
                        tracing::debug!(error = %err, "Result not sent");
                    }
                });
            }
            WireMessage::Result(result) => self.deliver(result),
            WireMessage::Dispose { capability_id } => {
                let removed = self.inner.state.lock().exports.remove(&capability_id);
                tracing::debug!(
                    session = %self.inner.id,
                    capability_id = %capability_id,
                    found = removed.is_some(),
                    "Export disposed by peer"
                );
            }
        }
    }

    fn deliver(&self, result: CallResult) {
        let entry = self.inner.state.lock().pending.remove(&result.call_id);
        let Some(entry) = entry else {
            tracing::debug!(
                session = %self.inner.id,
                call_id = %result.call_id,
                "Discarding result for unknown or cancelled call"
            );
            if let Outcome::Capability { id, .. } = result.outcome {
                if let Err(err) = self.send(WireMessage::Dispose { capability_id: id }) {
                    tracing::debug!(capability_id = %id, error = %err, "Dispose not sent");
                }
            }
            return;
        };

        tracing::debug!(session = %self.inner.id, call_id = %result.call_id, "Result delivered");
        let outcome = match result.outcome {
            Outcome::Value(value) => Ok(Resolved::Value(value)),
            Outcome::Capability { id, type_tag } => {
                Ok(Resolved::Capability(self.import(id, type_tag)))
            }
            Outcome::Error(err) => Err(RpcError::from_remote(err, entry.root)),
        };
        if entry.tx.send(outcome).is_err() {
            tracing::debug!(call_id = %result.call_id, "Caller stopped waiting");
        }
    }

    fn close(&self, reason: String) {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.imports.clear();
            std::mem::take(&mut state.pending)
        };
        tracing::debug!(
            session = %self.inner.id,
            reason = %reason,
            rejected = pending.len(),
            "Session closed"
        );
        for (_, entry) in pending {
            let _ = entry
                .tx
                .send(Err(RpcError::ConnectionLost(reason.clone())));
        }
    }

    fn serve_graph(&self, graph: CallGraph) -> CallResult {
        let call_id = graph.call_id;
        let outcome = match self.evaluate(&graph) {
            Ok(Live::Value(value)) => Outcome::Value(value),
            Ok(Live::Object(object)) => {
                let type_tag = object.type_tag().to_string();
                let id = self.export(object);
                Outcome::Capability { id, type_tag }
            }
            Ok(Live::Callback(_)) => Outcome::Error(RemoteError::new(
                RemoteErrorKind::TypeMismatch,
                "a callback cannot be returned to the caller",
            )),
            Err(err) => {
                tracing::debug!(session = %self.inner.id, call_id = %call_id, error = %err, "Call failed");
                Outcome::Error(err)
            }
        };
        CallResult { call_id, outcome }
    }

    fn evaluate(&self, graph: &CallGraph) -> Result<Live, RemoteError> {
        graph
            .validate(self.inner.config.max_graph_depth)
            .map_err(RemoteError::protocol)?;

        let mut env = Env::new().with(
            PlaceholderId::ROOT,
            self.exported(graph.root_capability_id)?,
        );
        for binding in &graph.imported_references {
            let base = match binding.base_placeholder_id {
                Some(placeholder) => env.lookup(placeholder)?,
                None => self.exported(binding.capability_id)?,
            };
            let value = CallbackReplayEngine::apply_all(base, &binding.path, &env)?;
            env.bind(binding.placeholder_id, value);
        }
        Ok(CallbackReplayEngine::replay_in(&graph.operations, &env)?)
    }

    fn exported(&self, id: CapabilityId) -> Result<Live, RemoteError> {
        if let Some(object) = self.inner.state.lock().exports.get(&id) {
            return Ok(Live::Object(object.clone()));
        }
        let issued = if id == CapabilityId::BOOTSTRAP {
            self.inner.has_bootstrap
        } else {
            id.0 < self.inner.next_export_id.load(Ordering::Acquire)
        };
        if issued {
            Err(RemoteError::new(
                RemoteErrorKind::ReferenceDisposed,
                format!("{id} was disposed"),
            ))
        } else {
            Err(RemoteError::protocol(format!("unknown capability {id}")))
        }
    }

    fn export(&self, object: Arc<dyn TargetObject>) -> CapabilityId {
        let id = CapabilityId(self.inner.next_export_id.fetch_add(1, Ordering::AcqRel));
        self.inner.state.lock().exports.insert(id, object);
        id
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.inner.id)
            .finish()
    }
}

async fn write_loop(
    session: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
    mut sink: Box<dyn FrameSink>,
) {
    while let Some(message) = rx.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, kind = message.kind(), "Failed to encode message");
                continue;
            }
        };
        if let Err(err) = sink.send(frame).await {
            tracing::warn!(error = %err, "Transport write failed");
            if let Some(inner) = session.upgrade() {
                TransportSession { inner }.close(format!("transport failed: {err}"));
            }
            return;
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(error = %err, "Transport close failed");
    }
}
