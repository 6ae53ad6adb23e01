//! Error taxonomy shared by recording, replay, and sessions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::CapabilityId;

/// Errors raised while recording a callback. These surface before any
/// message is sent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Unsupported callback shape: {0}")]
    UnsupportedCallbackShape(String),
    #[error("Capture argument {index} is not {expected}")]
    Argument { index: usize, expected: &'static str },
    #[error("Capture needs at least one capability or stub")]
    NoCapabilities,
    #[error("Captured capabilities belong to different sessions")]
    MixedSessions,
}

/// Errors raised while replaying a record against a live target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("{type_tag} has no method `{name}`")]
    MethodMissing { type_tag: String, name: String },
    #[error("{type_tag} has no property `{name}`")]
    PropertyMissing { type_tag: String, name: String },
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Placeholder {0} is not bound")]
    UnboundPlaceholder(u32),
    #[error("Target failed: {0}")]
    Target(String),
}

impl ReplayError {
    pub fn mismatch(message: impl Into<String>) -> Self {
        ReplayError::TypeMismatch(message.into())
    }
}

/// Category of an error carried in a `Result` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NoSuchMethod,
    NoSuchProperty,
    TypeMismatch,
    ProtocolViolation,
    ReferenceDisposed,
    Failed,
}

/// Error produced by the remote side for one call.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::ProtocolViolation, message)
    }
}

impl From<ReplayError> for RemoteError {
    fn from(err: ReplayError) -> Self {
        let kind = match &err {
            ReplayError::MethodMissing { .. } => RemoteErrorKind::NoSuchMethod,
            ReplayError::PropertyMissing { .. } => RemoteErrorKind::NoSuchProperty,
            ReplayError::TypeMismatch(_) => RemoteErrorKind::TypeMismatch,
            ReplayError::UnboundPlaceholder(_) => RemoteErrorKind::ProtocolViolation,
            ReplayError::Target(_) => RemoteErrorKind::Failed,
        };
        RemoteError::new(kind, err.to_string())
    }
}

/// Errors surfaced to callers resolving stubs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Remote dispatch failed: {0}")]
    RemoteDispatch(RemoteError),

    #[error("Capability {0} was disposed")]
    ReferenceDisposed(CapabilityId),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Local evaluation failed: {0}")]
    Local(#[from] ReplayError),

    #[error("Resolution timed out after {0} ms")]
    Timeout(u64),

    #[error("Failed to decode result: {0}")]
    Decode(String),
}

impl RpcError {
    /// True when the remote target lacked the called method
    pub fn is_no_such_method(&self) -> bool {
        matches!(
            self,
            RpcError::RemoteDispatch(RemoteError {
                kind: RemoteErrorKind::NoSuchMethod,
                ..
            })
        )
    }

    pub(crate) fn from_remote(err: RemoteError, capability_id: CapabilityId) -> Self {
        match err.kind {
            RemoteErrorKind::ProtocolViolation => RpcError::ProtocolViolation(err.message),
            RemoteErrorKind::ReferenceDisposed => RpcError::ReferenceDisposed(capability_id),
            _ => RpcError::RemoteDispatch(err),
        }
    }
}
