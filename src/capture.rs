//! Capture a function over capabilities and send it as one request.
//!
//! ```ignore
//! let adults = capture(vec![Param::from(&rows), Param::from(30)], |c| -> Result<Expr, CaptureError> {
//!     let rows = c.expr(0)?;
//!     let min = c.operand(1)?;
//!     Ok(rows.call_with("where", move |row| row.get("age").call(">=", vec![min]))
//!         .call("orderBy", vec!["age".into()]))
//! })
//! .await?;
//! ```

use std::sync::Arc;

use crate::error::{CaptureError, RpcError};
use crate::pipeline::{
    shared_steps, GraphBuilder, Param, PendingResult, QueuedOp, Settled, StubReference,
};
use crate::record::{Expr, IntoCaptured, Operand, OperationRecord, OperationRecorder, PlaceholderId};
use crate::session::CapHandle;
use crate::value::Value;

enum Captive {
    Expr(Expr),
    Value(Value),
}

/// Stand-ins handed to a capture function, one per list entry
pub struct Captures {
    entries: Vec<Captive>,
}

impl Captures {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recording stand-in for capability entry `index`
    pub fn expr(&self, index: usize) -> Result<Expr, CaptureError> {
        match self.entries.get(index) {
            Some(Captive::Expr(expr)) => Ok(expr.clone()),
            _ => Err(CaptureError::Argument {
                index,
                expected: "a capability",
            }),
        }
    }

    /// Plain value entry `index`
    pub fn value(&self, index: usize) -> Result<Value, CaptureError> {
        match self.entries.get(index) {
            Some(Captive::Value(value)) => Ok(value.clone()),
            _ => Err(CaptureError::Argument {
                index,
                expected: "a plain value",
            }),
        }
    }

    /// Entry `index` as a call argument, whichever kind it is
    pub fn operand(&self, index: usize) -> Result<Operand<'static>, CaptureError> {
        match self.entries.get(index) {
            Some(Captive::Expr(expr)) => Ok(Operand::Expr(expr.clone())),
            Some(Captive::Value(value)) => Ok(Operand::Literal(value.clone())),
            None => Err(CaptureError::Argument {
                index,
                expected: "present",
            }),
        }
    }
}

enum Slot {
    Value(Value),
    Live(Arc<CapHandle>, Vec<QueuedOp>),
}

/// Run `callback` locally against recording stand-ins for the capability
/// entries of `captures`, then send the record and its bindings as one call
/// graph.
///
/// Plain values pass through unchanged. Stub entries built on a live
/// capability are embedded with their queued operations, and a step several
/// entries share is evaluated once.
///
/// Whether an entry is a capability or a value is only known once it
/// settles, so every entry built on an in-flight call is awaited before
/// `callback` runs. With such entries a recording error is reported after
/// those calls return; with none, it is reported before any I/O. Either way
/// nothing for this capture is sent when recording fails.
pub async fn capture<F, R>(captures: Vec<Param>, callback: F) -> Result<PendingResult, RpcError>
where
    F: FnOnce(Captures) -> R,
    R: IntoCaptured,
{
    if let Some(index) = captures
        .iter()
        .position(|param| matches!(param, Param::Callback(_)))
    {
        return Err(CaptureError::Argument {
            index,
            expected: "a capability, stub, or value",
        }
        .into());
    }
    let shared = shared_steps(captures.iter().filter_map(|param| match param {
        Param::Stub(stub) => Some(stub),
        _ => None,
    }));

    let mut slots = Vec::with_capacity(captures.len());
    for param in captures {
        slots.push(match param {
            Param::Value(value) => Slot::Value(value),
            Param::Stub(stub) => match stub.settle().await? {
                Settled::Value(value) => Slot::Value(value),
                Settled::Capability(handle, ops) => Slot::Live(handle, ops),
            },
            // rejected above
            Param::Callback(_) => continue,
        });
    }

    let mut live = slots.iter().filter_map(|slot| match slot {
        Slot::Live(handle, _) => Some(handle),
        Slot::Value(_) => None,
    });
    let first = live.next().ok_or(CaptureError::NoCapabilities)?;
    let session = first.session().clone();
    let root = first.id();
    if live.any(|handle| !handle.session().same_session(&session)) {
        return Err(CaptureError::MixedSessions.into());
    }

    let (record, placeholders, used) = record_captures(&slots, callback)?;

    let mut builder = GraphBuilder::new(session.clone(), PlaceholderId(used + 1)).sharing(shared);
    for (slot, placeholder) in slots.into_iter().zip(placeholders) {
        if let (Slot::Live(handle, ops), Some(placeholder)) = (slot, placeholder) {
            builder.bind(placeholder, handle, ops).await?;
        }
    }
    let (bindings, keep_alive) = builder.finish();
    tracing::debug!(
        session = %session.id(),
        capability_id = %root,
        bindings = bindings.len(),
        "Dispatching captured callback"
    );
    let call = session.dispatch(root, record, bindings, keep_alive)?;
    Ok(StubReference::in_flight(call))
}

/// Placeholders are handed out in list order, so the first capability entry
/// is placeholder 1.
fn record_captures<F, R>(
    slots: &[Slot],
    callback: F,
) -> Result<(OperationRecord, Vec<Option<PlaceholderId>>, u32), CaptureError>
where
    F: FnOnce(Captures) -> R,
    R: IntoCaptured,
{
    let recorder = OperationRecorder::new();
    let mut entries = Vec::with_capacity(slots.len());
    let mut placeholders = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Slot::Value(value) => {
                entries.push(Captive::Value(value.clone()));
                placeholders.push(None);
            }
            Slot::Live(..) => {
                let (id, expr) = recorder.placeholder();
                entries.push(Captive::Expr(expr));
                placeholders.push(Some(id));
            }
        }
    }
    let returned = callback(Captures { entries }).into_captured();
    let used = recorder.placeholder_count();
    let record = recorder.finish(returned)?;
    Ok((record, placeholders, used))
}
