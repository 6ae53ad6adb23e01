//! Wire messages exchanged over a session.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::record::{Operation, OperationRecord, PlaceholderId};
use crate::value::Value;

/// Capability id, allocated by the exporting side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(pub u64);

impl CapabilityId {
    /// The object a session exports on connect
    pub const BOOTSTRAP: CapabilityId = CapabilityId(0);
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Call id, allocated by the calling side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Binds a placeholder to a capability, optionally through queued operations
/// evaluated once before the record is replayed.
///
/// With `base_placeholder_id` set the path starts from that earlier binding
/// instead of the capability, so a step several chains share runs once.
/// `capability_id` still names the capability at the base of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureBinding {
    pub placeholder_id: PlaceholderId,
    pub capability_id: CapabilityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_placeholder_id: Option<PlaceholderId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Operation>,
}

/// One request: a record replayed against the root capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallGraph {
    pub call_id: CallId,
    pub root_capability_id: CapabilityId,
    pub operations: OperationRecord,
    #[serde(default)]
    pub imported_references: Vec<CaptureBinding>,
}

impl CallGraph {
    /// Every capability the graph depends on
    pub fn capability_ids(&self) -> Vec<CapabilityId> {
        let mut ids = vec![self.root_capability_id];
        for binding in &self.imported_references {
            if !ids.contains(&binding.capability_id) {
                ids.push(binding.capability_id);
            }
        }
        ids
    }

    /// Structural checks run before replay
    pub fn validate(&self, max_depth: usize) -> Result<(), String> {
        let mut bound = HashSet::from([PlaceholderId::ROOT]);
        for binding in &self.imported_references {
            if let Some(base) = binding.base_placeholder_id {
                if base == PlaceholderId::ROOT || !bound.contains(&base) {
                    return Err(format!(
                        "binding for {} starts from {base}, which is not bound before it",
                        binding.placeholder_id
                    ));
                }
            }
            if !bound.insert(binding.placeholder_id) {
                return Err(format!(
                    "placeholder {} is bound more than once",
                    binding.placeholder_id
                ));
            }
            let depth = binding
                .path
                .iter()
                .map(|op| OperationRecord::new(PlaceholderId::ROOT, vec![op.clone()]).depth())
                .max()
                .unwrap_or(1);
            if depth > max_depth {
                return Err(format!(
                    "binding for {} nests {depth} levels, limit is {max_depth}",
                    binding.placeholder_id
                ));
            }
        }
        if !bound.contains(&self.operations.subject) {
            return Err(format!(
                "record subject {} is not bound",
                self.operations.subject
            ));
        }
        let depth = self.operations.depth();
        if depth > max_depth {
            return Err(format!("graph nests {depth} levels, limit is {max_depth}"));
        }
        Ok(())
    }
}

/// What a call produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(Value),
    Capability { id: CapabilityId, type_tag: String },
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub call_id: CallId,
    pub outcome: Outcome,
}

/// Frame payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    CallGraph(CallGraph),
    Result(CallResult),
    Dispose { capability_id: CapabilityId },
}

impl WireMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::CallGraph(_) => "call_graph",
            WireMessage::Result(_) => "result",
            WireMessage::Dispose { .. } => "dispose",
        }
    }
}
