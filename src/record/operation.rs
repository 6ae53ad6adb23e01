use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifies a recording placeholder inside an operation record or graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceholderId(pub u32);

impl PlaceholderId {
    /// Placeholder bound to the root capability of a call graph
    pub const ROOT: PlaceholderId = PlaceholderId(0);

    fn offset(self, by: u32) -> Self {
        if self == Self::ROOT {
            self
        } else {
            PlaceholderId(self.0 + by)
        }
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// A single recorded step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get(String),
    Call(String, Vec<Arg>),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Get(name) | Operation::Call(name, _) => name,
        }
    }

    pub fn args(&self) -> &[Arg] {
        match self {
            Operation::Get(_) => &[],
            Operation::Call(_, args) => args,
        }
    }
}

/// Operation argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    /// Plain value supplied as-is
    Value(Value),
    /// Nested record replayed against the value bound to its subject
    Derived(Box<OperationRecord>),
    /// Nested capture, replayed each time the target invokes it
    Callback(Box<CallbackRecord>),
}

impl Arg {
    /// Argument standing for the placeholder itself
    pub fn placeholder(id: PlaceholderId) -> Self {
        Arg::Derived(Box::new(OperationRecord::identity(id)))
    }
}

macro_rules! arg_from_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}

arg_from_value!(Value, bool, i32, i64, f64, &str, String);

/// How a record produces its final value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordResult {
    /// The working value after the last operation
    Derived,
    /// A literal unrelated to the placeholder
    Literal(Value),
    /// A map assembled from one sub-record per field, in recorded order
    Map(Vec<(String, OperationRecord)>),
    /// A list assembled from one sub-record per element
    List(Vec<OperationRecord>),
}

impl RecordResult {
    /// Sub-records of a composite result
    pub fn parts(&self) -> Vec<&OperationRecord> {
        match self {
            RecordResult::Derived | RecordResult::Literal(_) => Vec::new(),
            RecordResult::Map(fields) => fields.iter().map(|(_, record)| record).collect(),
            RecordResult::List(items) => items.iter().collect(),
        }
    }

    fn parts_mut(&mut self) -> Vec<&mut OperationRecord> {
        match self {
            RecordResult::Derived | RecordResult::Literal(_) => Vec::new(),
            RecordResult::Map(fields) => fields.iter_mut().map(|(_, record)| record).collect(),
            RecordResult::List(items) => items.iter_mut().collect(),
        }
    }
}

/// Ordered operations applied to the value bound to `subject`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub subject: PlaceholderId,
    pub operations: Vec<Operation>,
    pub result: RecordResult,
}

impl OperationRecord {
    pub fn new(subject: PlaceholderId, operations: Vec<Operation>) -> Self {
        Self {
            subject,
            operations,
            result: RecordResult::Derived,
        }
    }

    pub fn identity(subject: PlaceholderId) -> Self {
        Self::new(subject, Vec::new())
    }

    pub fn literal(subject: PlaceholderId, operations: Vec<Operation>, value: Value) -> Self {
        Self {
            subject,
            operations,
            result: RecordResult::Literal(value),
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.result, RecordResult::Derived)
    }

    /// Nesting depth through derived and callback arguments and composite
    /// results
    pub fn depth(&self) -> usize {
        let args = self
            .operations
            .iter()
            .flat_map(Operation::args)
            .map(|arg| match arg {
                Arg::Value(_) => 0,
                Arg::Derived(record) => record.depth(),
                Arg::Callback(callback) => callback.body.depth(),
            });
        let parts = self.result.parts().into_iter().map(OperationRecord::depth);
        1 + args.chain(parts).max().unwrap_or(0)
    }

    /// Every placeholder referenced, including nested records
    pub fn placeholders(&self) -> Vec<PlaceholderId> {
        let mut out = vec![self.subject];
        for arg in self.operations.iter().flat_map(Operation::args) {
            match arg {
                Arg::Value(_) => {}
                Arg::Derived(record) => out.extend(record.placeholders()),
                Arg::Callback(callback) => {
                    out.push(callback.param);
                    out.extend(callback.body.placeholders());
                }
            }
        }
        for part in self.result.parts() {
            out.extend(part.placeholders());
        }
        out
    }

    /// Shift every non-root placeholder by `by`
    pub(crate) fn offset_placeholders(&mut self, by: u32) {
        self.subject = self.subject.offset(by);
        for op in &mut self.operations {
            if let Operation::Call(_, args) = op {
                for arg in args {
                    match arg {
                        Arg::Value(_) => {}
                        Arg::Derived(record) => record.offset_placeholders(by),
                        Arg::Callback(callback) => callback.offset_placeholders(by),
                    }
                }
            }
        }
        for part in self.result.parts_mut() {
            part.offset_placeholders(by);
        }
    }
}

/// A captured callback: its parameter placeholder and the recorded body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub param: PlaceholderId,
    pub body: OperationRecord,
}

impl CallbackRecord {
    pub(crate) fn offset_placeholders(&mut self, by: u32) {
        self.param = self.param.offset(by);
        self.body.offset_placeholders(by);
    }

    /// Highest placeholder number in use
    pub(crate) fn max_placeholder(&self) -> u32 {
        self.body
            .placeholders()
            .into_iter()
            .chain(std::iter::once(self.param))
            .map(|p| p.0)
            .max()
            .unwrap_or(0)
    }
}
