//! Replays operation records against live targets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::ReplayError;
use crate::target::Live;
use crate::value::Value;

use super::builtins;
use super::operation::{Arg, CallbackRecord, Operation, OperationRecord, PlaceholderId, RecordResult};

/// Placeholder bindings visible to a replay
#[derive(Clone, Default)]
pub struct Env {
    bindings: HashMap<PlaceholderId, Live>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, placeholder: PlaceholderId, value: Live) {
        self.bindings.insert(placeholder, value);
    }

    pub fn with(mut self, placeholder: PlaceholderId, value: Live) -> Self {
        self.bind(placeholder, value);
        self
    }

    pub fn is_bound(&self, placeholder: PlaceholderId) -> bool {
        self.bindings.contains_key(&placeholder)
    }

    pub fn lookup(&self, placeholder: PlaceholderId) -> Result<Live, ReplayError> {
        self.bindings
            .get(&placeholder)
            .cloned()
            .ok_or(ReplayError::UnboundPlaceholder(placeholder.0))
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<_> = self.bindings.keys().collect();
        bound.sort();
        f.debug_struct("Env").field("bound", &bound).finish()
    }
}

/// A captured callback made invocable on the replaying side.
///
/// Targets receive these as arguments (e.g. a `where` predicate) and call
/// [`ReplayCallback::invoke`] once per element.
#[derive(Clone, Debug)]
pub struct ReplayCallback {
    param: PlaceholderId,
    body: Arc<OperationRecord>,
    env: Env,
}

impl ReplayCallback {
    pub fn new(record: CallbackRecord, env: Env) -> Self {
        Self {
            param: record.param,
            body: Arc::new(record.body),
            env,
        }
    }

    pub fn invoke(&self, arg: Live) -> Result<Live, ReplayError> {
        let env = self.env.clone().with(self.param, arg);
        CallbackReplayEngine::replay_in(&self.body, &env)
    }
}

/// Two-phase interpreter: records built by the recorder are evaluated here
/// against concrete targets.
pub struct CallbackReplayEngine;

impl CallbackReplayEngine {
    /// Replay `record` with its subject bound to `target`
    pub fn replay(record: &OperationRecord, target: Live) -> Result<Live, ReplayError> {
        let env = Env::new().with(record.subject, target);
        Self::replay_in(record, &env)
    }

    /// Replay `record` against an environment of bound placeholders
    pub fn replay_in(record: &OperationRecord, env: &Env) -> Result<Live, ReplayError> {
        let start = env.lookup(record.subject)?;
        let working = Self::apply_all(start, &record.operations, env)?;
        match &record.result {
            RecordResult::Derived => Ok(working),
            RecordResult::Literal(value) => Ok(Live::Value(value.clone())),
            RecordResult::Map(fields) => {
                let mut out = BTreeMap::new();
                for (name, field) in fields {
                    out.insert(name.clone(), Self::replay_in(field, env)?.into_value()?);
                }
                Ok(Live::Value(Value::Map(out)))
            }
            RecordResult::List(items) => items
                .iter()
                .map(|item| Self::replay_in(item, env)?.into_value())
                .collect::<Result<Vec<_>, _>>()
                .map(|items| Live::Value(Value::List(items))),
        }
    }

    /// Apply `operations` in order, starting from `start`
    pub fn apply_all(
        start: Live,
        operations: &[Operation],
        env: &Env,
    ) -> Result<Live, ReplayError> {
        operations
            .iter()
            .try_fold(start, |working, op| Self::apply(working, op, env))
    }

    /// Apply one operation to the working value
    pub fn apply(working: Live, op: &Operation, env: &Env) -> Result<Live, ReplayError> {
        tracing::trace!(op = op.name(), on = working.kind(), "replay step");
        match op {
            Operation::Get(name) => match &working {
                Live::Value(value) => builtins::get(value, name).map(Live::Value),
                Live::Object(object) => object.get(name),
                Live::Callback(_) => Err(ReplayError::mismatch(format!(
                    "cannot read `{name}` from a callback"
                ))),
            },
            Operation::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| Self::resolve_arg(arg, env))
                    .collect::<Result<Vec<_>, _>>()?;
                match &working {
                    Live::Value(value) => {
                        let values = args
                            .into_iter()
                            .map(Live::into_value)
                            .collect::<Result<Vec<_>, _>>()?;
                        builtins::call(value, name, &values).map(Live::Value)
                    }
                    Live::Object(object) => object.call(name, args),
                    Live::Callback(_) => Err(ReplayError::mismatch(format!(
                        "cannot call `{name}` on a callback"
                    ))),
                }
            }
        }
    }

    fn resolve_arg(arg: &Arg, env: &Env) -> Result<Live, ReplayError> {
        match arg {
            Arg::Value(value) => Ok(Live::Value(value.clone())),
            Arg::Derived(record) => Self::replay_in(record, env),
            Arg::Callback(callback) => Ok(Live::Callback(ReplayCallback::new(
                (**callback).clone(),
                env.clone(),
            ))),
        }
    }
}
