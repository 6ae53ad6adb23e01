//! Local handles to imported capabilities.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::pipeline::{Param, StubReference};

use super::messages::CapabilityId;
use super::peer::TransportSession;

/// One counted reference to an imported capability. Releases its count on
/// drop unless it was disposed explicitly.
pub(crate) struct CapHandle {
    id: CapabilityId,
    type_tag: String,
    session: TransportSession,
    disposed: AtomicBool,
}

impl CapHandle {
    pub(crate) fn new(id: CapabilityId, type_tag: String, session: TransportSession) -> Self {
        Self {
            id,
            type_tag,
            session,
            disposed: AtomicBool::new(false),
        }
    }

    /// A handle that was never counted, e.g. imported after teardown
    pub(crate) fn detached(id: CapabilityId, type_tag: String, session: TransportSession) -> Self {
        let handle = Self::new(id, type_tag, session);
        handle.disposed.store(true, Ordering::Release);
        handle
    }

    pub(crate) fn id(&self) -> CapabilityId {
        self.id
    }

    pub(crate) fn session(&self) -> &TransportSession {
        &self.session
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// A second counted handle to the same id
    pub(crate) fn duplicate(&self) -> Arc<CapHandle> {
        let (id, type_tag, session) = (self.id, self.type_tag.clone(), self.session.clone());
        if self.is_disposed() || !self.session.retain(self.id) {
            Arc::new(CapHandle::detached(id, type_tag, session))
        } else {
            Arc::new(CapHandle::new(id, type_tag, session))
        }
    }

    /// Identity of this handle among the session's handles for `id`
    pub(crate) fn key(&self) -> usize {
        self as *const CapHandle as usize
    }

    fn release(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.session.release(self.id, self.key());
        }
    }
}

impl Drop for CapHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reference to a remote object.
///
/// Cloning yields an independent handle that keeps the remote object alive
/// on its own; the object is released once every handle is dropped or
/// disposed. Stubs built from a reference share its handle, so
/// [`CapabilityRef::dispose`] also invalidates them.
pub struct CapabilityRef {
    handle: Arc<CapHandle>,
}

impl CapabilityRef {
    pub(crate) fn from_handle(handle: Arc<CapHandle>) -> Self {
        Self { handle }
    }

    pub(crate) fn handle(&self) -> &Arc<CapHandle> {
        &self.handle
    }

    pub(crate) fn into_handle(self) -> Arc<CapHandle> {
        self.handle
    }

    pub fn id(&self) -> CapabilityId {
        self.handle.id
    }

    pub fn type_tag(&self) -> &str {
        &self.handle.type_tag
    }

    pub fn session(&self) -> &TransportSession {
        &self.handle.session
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_disposed()
    }

    /// Release this handle now. Idempotent.
    pub fn dispose(&self) {
        tracing::debug!(capability_id = %self.id(), "dispose");
        self.handle.release();
    }

    /// A stub with no queued operations
    pub fn stub(&self) -> StubReference {
        StubReference::capability(self.handle.clone())
    }

    pub fn get(&self, name: &str) -> StubReference {
        self.stub().get(name)
    }

    pub fn call(&self, name: &str, params: Vec<Param>) -> StubReference {
        self.stub().call(name, params)
    }
}

impl Clone for CapabilityRef {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.duplicate(),
        }
    }
}

impl fmt::Debug for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRef")
            .field("id", &self.id())
            .field("type_tag", &self.type_tag())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
