//! The object model replay dispatches against.

use std::fmt;
use std::sync::Arc;

use crate::error::ReplayError;
use crate::record::ReplayCallback;
use crate::value::Value;

/// A real object exposed to remote callers through named properties and
/// methods.
///
/// Implementations must tolerate speculative calls: replay executes exactly
/// the recorded operations, in order, but a method may be reached with
/// arguments the object rejects.
pub trait TargetObject: Send + Sync + fmt::Debug {
    /// Type tag reported alongside exported capability ids
    fn type_tag(&self) -> &str;

    /// Read a property
    fn get(&self, name: &str) -> Result<Live, ReplayError> {
        Err(ReplayError::PropertyMissing {
            type_tag: self.type_tag().to_string(),
            name: name.to_string(),
        })
    }

    /// Invoke a method
    fn call(&self, name: &str, args: Vec<Live>) -> Result<Live, ReplayError>;

    /// Error for methods the object does not have
    fn missing(&self, name: &str) -> ReplayError {
        ReplayError::MethodMissing {
            type_tag: self.type_tag().to_string(),
            name: name.to_string(),
        }
    }
}

/// A value flowing through replay
#[derive(Clone, Debug)]
pub enum Live {
    Value(Value),
    Object(Arc<dyn TargetObject>),
    Callback(ReplayCallback),
}

impl Live {
    pub fn object<T: TargetObject + 'static>(object: T) -> Self {
        Live::Object(Arc::new(object))
    }

    pub fn kind(&self) -> &str {
        match self {
            Live::Value(value) => value.kind(),
            Live::Object(object) => object.type_tag(),
            Live::Callback(_) => "callback",
        }
    }

    pub fn into_value(self) -> Result<Value, ReplayError> {
        match self {
            Live::Value(value) => Ok(value),
            other => Err(ReplayError::mismatch(format!(
                "expected a plain value, found {}",
                other.kind()
            ))),
        }
    }

    pub fn as_callback(&self) -> Result<&ReplayCallback, ReplayError> {
        match self {
            Live::Callback(callback) => Ok(callback),
            other => Err(ReplayError::mismatch(format!(
                "expected a callback, found {}",
                other.kind()
            ))),
        }
    }
}

impl From<Value> for Live {
    fn from(value: Value) -> Self {
        Live::Value(value)
    }
}

impl From<Arc<dyn TargetObject>> for Live {
    fn from(object: Arc<dyn TargetObject>) -> Self {
        Live::Object(object)
    }
}

/// Fetch argument `index` as a plain value
pub fn value_arg(args: &[Live], index: usize, method: &str) -> Result<Value, ReplayError> {
    match args.get(index) {
        Some(Live::Value(value)) => Ok(value.clone()),
        Some(other) => Err(ReplayError::mismatch(format!(
            "argument {index} of `{method}` must be a plain value, found {}",
            other.kind()
        ))),
        None => Err(ReplayError::mismatch(format!(
            "`{method}` expects at least {} argument(s)",
            index + 1
        ))),
    }
}

/// Fetch argument `index` as a callback
pub fn callback_arg<'a>(
    args: &'a [Live],
    index: usize,
    method: &str,
) -> Result<&'a ReplayCallback, ReplayError> {
    args.get(index)
        .ok_or_else(|| ReplayError::mismatch(format!("`{method}` expects a callback argument")))?
        .as_callback()
}
