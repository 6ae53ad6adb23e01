//! Recording stand-ins for callback arguments.
//!
//! A callback is invoked once with [`Expr`] handles in place of its real
//! arguments. Each `get`/`call` on a handle appends a node to a shared tape
//! and returns a new handle; nothing is evaluated. When the callback returns,
//! the tape is folded into an [`OperationRecord`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::CaptureError;
use crate::value::Value;

use super::operation::{
    Arg, CallbackRecord, Operation, OperationRecord, PlaceholderId, RecordResult,
};

enum Origin {
    Placeholder(PlaceholderId),
    Step { parent: usize, op: Operation },
}

struct Node {
    origin: Origin,
    /// Callback scope the node was recorded in; 0 is the outermost
    scope: usize,
    consumed: bool,
}

/// A step result feeds exactly one consumer, inside its own scope.
#[derive(Default)]
struct Tape {
    next_placeholder: u32,
    nodes: Vec<Node>,
    /// Open nested callback scopes, innermost last
    scopes: Vec<usize>,
    next_scope: usize,
    poisoned: Option<String>,
}

impl Tape {
    fn scope(&self) -> usize {
        self.scopes.last().copied().unwrap_or(0)
    }

    fn is_open(&self, scope: usize) -> bool {
        scope == 0 || self.scopes.contains(&scope)
    }

    fn enter(&mut self) {
        self.next_scope += 1;
        self.scopes.push(self.next_scope);
    }

    fn leave(&mut self) {
        self.scopes.pop();
    }

    fn placeholder(&mut self) -> (PlaceholderId, usize) {
        self.next_placeholder += 1;
        let id = PlaceholderId(self.next_placeholder);
        self.nodes.push(Node {
            origin: Origin::Placeholder(id),
            scope: self.scope(),
            consumed: false,
        });
        (id, self.nodes.len() - 1)
    }

    fn push_step(&mut self, parent: usize, op: Operation) -> usize {
        self.consume(parent);
        self.nodes.push(Node {
            origin: Origin::Step { parent, op },
            scope: self.scope(),
            consumed: false,
        });
        self.nodes.len() - 1
    }

    /// Mark `node` as feeding a consumer in the current scope.
    fn consume(&mut self, node: usize) {
        let entry = &self.nodes[node];
        let refused = match entry.origin {
            Origin::Placeholder(id) if !self.is_open(entry.scope) => Some(format!(
                "placeholder {id} is used after the callback that declared it returned"
            )),
            Origin::Placeholder(_) => None,
            Origin::Step { .. } if entry.scope != self.scope() => Some(format!(
                "result of {} is used outside the callback that produced it; \
                 it would be recomputed on every replay",
                self.describe(node)
            )),
            Origin::Step { .. } if entry.consumed => Some(format!(
                "result of {} is used more than once; each recorded operation may feed one consumer",
                self.describe(node)
            )),
            Origin::Step { .. } => None,
        };
        match refused {
            Some(reason) => self.poison(reason),
            None => self.nodes[node].consumed = true,
        }
    }

    fn poison(&mut self, reason: String) {
        tracing::debug!(%reason, "recording poisoned");
        self.poisoned.get_or_insert(reason);
    }

    /// Placeholder at the root of `node` and the operations leading to it
    fn path(&self, mut node: usize) -> (PlaceholderId, Vec<Operation>) {
        let mut ops = Vec::new();
        loop {
            match &self.nodes[node].origin {
                Origin::Placeholder(id) => {
                    ops.reverse();
                    return (*id, ops);
                }
                Origin::Step { parent, op } => {
                    ops.push(op.clone());
                    node = *parent;
                }
            }
        }
    }

    fn describe(&self, node: usize) -> String {
        let (root, ops) = self.path(node);
        let mut out = root.to_string();
        for op in ops {
            match op {
                Operation::Get(name) => out.push_str(&format!(".{name}")),
                Operation::Call(name, _) => out.push_str(&format!(".{name}(..)")),
            }
        }
        out
    }

    fn lower_captured(
        &mut self,
        captured: Captured,
        default_subject: PlaceholderId,
    ) -> OperationRecord {
        match captured {
            Captured::Expr(expr) => {
                self.consume(expr.node);
                let (subject, operations) = self.path(expr.node);
                OperationRecord::new(subject, operations)
            }
            Captured::Literal(value) => {
                OperationRecord::literal(default_subject, Vec::new(), value)
            }
            Captured::Map(fields) => OperationRecord {
                subject: default_subject,
                operations: Vec::new(),
                result: RecordResult::Map(
                    fields
                        .into_iter()
                        .map(|(name, field)| (name, self.lower_captured(field, default_subject)))
                        .collect(),
                ),
            },
            Captured::List(items) => OperationRecord {
                subject: default_subject,
                operations: Vec::new(),
                result: RecordResult::List(
                    items
                        .into_iter()
                        .map(|item| self.lower_captured(item, default_subject))
                        .collect(),
                ),
            },
        }
    }

    /// Steps created since `start` whose results nobody used
    fn dangling(&self, start: usize) -> Vec<usize> {
        (start..self.nodes.len())
            .filter(|&idx| {
                let node = &self.nodes[idx];
                !node.consumed && matches!(node.origin, Origin::Step { .. })
            })
            .collect()
    }
}

type SharedTape = Rc<RefCell<Tape>>;

/// Recording stand-in for a callback argument or a value derived from one.
#[derive(Clone)]
pub struct Expr {
    tape: SharedTape,
    node: usize,
}

impl Expr {
    /// Record a property read
    pub fn get(&self, name: &str) -> Expr {
        let node = self
            .tape
            .borrow_mut()
            .push_step(self.node, Operation::Get(name.to_string()));
        self.derive(node)
    }

    /// Record a method call
    pub fn call(&self, name: &str, args: Vec<Operand<'_>>) -> Expr {
        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(lower_operand(&self.tape, arg));
        }
        let node = self
            .tape
            .borrow_mut()
            .push_step(self.node, Operation::Call(name.to_string(), lowered));
        self.derive(node)
    }

    /// Record a method call whose only argument is a callback
    pub fn call_with<F, R>(&self, name: &str, callback: F) -> Expr
    where
        F: FnOnce(Expr) -> R,
        R: IntoCaptured,
    {
        self.call(name, vec![Operand::callback(callback)])
    }

    /// Branching on the recorded value is not expressible as a record.
    pub fn to_bool(&self) -> Result<bool, CaptureError> {
        Err(self.refuse_branch("bool"))
    }

    pub fn to_i64(&self) -> Result<i64, CaptureError> {
        Err(self.refuse_branch("integer"))
    }

    pub fn to_text(&self) -> Result<String, CaptureError> {
        Err(self.refuse_branch("string"))
    }

    fn refuse_branch(&self, wanted: &str) -> CaptureError {
        let mut tape = self.tape.borrow_mut();
        let reason = format!(
            "callback inspects {} as a {wanted}; only chained get/call operations can be recorded",
            tape.describe(self.node)
        );
        tape.poison(reason.clone());
        CaptureError::UnsupportedCallbackShape(reason)
    }

    fn derive(&self, node: usize) -> Expr {
        Expr {
            tape: self.tape.clone(),
            node,
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tape.try_borrow() {
            Ok(tape) => write!(f, "Expr({})", tape.describe(self.node)),
            Err(_) => write!(f, "Expr(#{})", self.node),
        }
    }
}

/// What a recorded callback returned
#[derive(Debug)]
pub enum Captured {
    Expr(Expr),
    Literal(Value),
    /// Object assembled from recorded fields
    Map(Vec<(String, Captured)>),
    List(Vec<Captured>),
}

impl Captured {
    pub fn map<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Captured)>,
    {
        Captured::Map(
            fields
                .into_iter()
                .map(|(name, field)| (name.into(), field))
                .collect(),
        )
    }

    pub fn list<I: IntoIterator<Item = Captured>>(items: I) -> Self {
        Captured::List(items.into_iter().collect())
    }

    fn is_foreign(&self, tape: &SharedTape) -> bool {
        match self {
            Captured::Expr(expr) => !Rc::ptr_eq(&expr.tape, tape),
            Captured::Literal(_) => false,
            Captured::Map(fields) => fields.iter().any(|(_, field)| field.is_foreign(tape)),
            Captured::List(items) => items.iter().any(|item| item.is_foreign(tape)),
        }
    }
}

impl From<Expr> for Captured {
    fn from(expr: Expr) -> Self {
        Captured::Expr(expr)
    }
}

impl From<&Expr> for Captured {
    fn from(expr: &Expr) -> Self {
        Captured::Expr(expr.clone())
    }
}

/// Values a recorded callback may return.
pub trait IntoCaptured {
    fn into_captured(self) -> Result<Captured, CaptureError>;
}

impl IntoCaptured for Captured {
    fn into_captured(self) -> Result<Captured, CaptureError> {
        Ok(self)
    }
}

impl IntoCaptured for Expr {
    fn into_captured(self) -> Result<Captured, CaptureError> {
        Ok(Captured::Expr(self))
    }
}

impl IntoCaptured for () {
    fn into_captured(self) -> Result<Captured, CaptureError> {
        Ok(Captured::Literal(Value::Null))
    }
}

impl<T: IntoCaptured> IntoCaptured for Result<T, CaptureError> {
    fn into_captured(self) -> Result<Captured, CaptureError> {
        self?.into_captured()
    }
}

macro_rules! literal_captures {
    ($($ty:ty),*) => {
        $(
            impl IntoCaptured for $ty {
                fn into_captured(self) -> Result<Captured, CaptureError> {
                    Ok(Captured::Literal(self.into()))
                }
            }

            impl From<$ty> for Captured {
                fn from(value: $ty) -> Self {
                    Captured::Literal(value.into())
                }
            }

            impl From<$ty> for Operand<'_> {
                fn from(value: $ty) -> Self {
                    Operand::Literal(value.into())
                }
            }
        )*
    };
}

literal_captures!(Value, bool, i32, i64, f64, &str, String);

type DeferredCallback<'a> = Box<dyn FnOnce(Expr) -> Result<Captured, CaptureError> + 'a>;

/// Argument to a recorded call
pub enum Operand<'a> {
    Literal(Value),
    Expr(Expr),
    /// Nested callback, recorded on the enclosing tape when lowered
    Callback(DeferredCallback<'a>),
}

impl<'a> Operand<'a> {
    pub fn callback<F, R>(callback: F) -> Self
    where
        F: FnOnce(Expr) -> R + 'a,
        R: IntoCaptured,
    {
        Operand::Callback(Box::new(move |expr| callback(expr).into_captured()))
    }
}

impl fmt::Debug for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Operand::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Operand::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<Expr> for Operand<'_> {
    fn from(expr: Expr) -> Self {
        Operand::Expr(expr)
    }
}

impl From<&Expr> for Operand<'_> {
    fn from(expr: &Expr) -> Self {
        Operand::Expr(expr.clone())
    }
}

fn lower_operand(tape: &SharedTape, operand: Operand<'_>) -> Arg {
    match operand {
        Operand::Literal(value) => Arg::Value(value),
        Operand::Expr(expr) => {
            if !Rc::ptr_eq(tape, &expr.tape) {
                tape.borrow_mut()
                    .poison("expression from another recording used as an argument".into());
                return Arg::Value(Value::Null);
            }
            let mut tape = tape.borrow_mut();
            tape.consume(expr.node);
            let (subject, operations) = tape.path(expr.node);
            Arg::Derived(Box::new(OperationRecord::new(subject, operations)))
        }
        Operand::Callback(callback) => {
            let (param, node, start) = {
                let mut tape = tape.borrow_mut();
                let start = tape.nodes.len();
                tape.enter();
                let (param, node) = tape.placeholder();
                (param, node, start)
            };
            let expr = Expr {
                tape: tape.clone(),
                node,
            };
            let returned = callback(expr);
            let closed = close_scope(tape, start, param, returned);
            tape.borrow_mut().leave();
            match closed {
                Ok(body) => Arg::Callback(Box::new(CallbackRecord { param, body })),
                Err(err) => {
                    tape.borrow_mut().poison(err.to_string());
                    Arg::Value(Value::Null)
                }
            }
        }
    }
}

/// Fold the nodes created since `start` into a record.
fn close_scope(
    shared: &SharedTape,
    start: usize,
    default_subject: PlaceholderId,
    returned: Result<Captured, CaptureError>,
) -> Result<OperationRecord, CaptureError> {
    let returned = returned?;
    if returned.is_foreign(shared) {
        return Err(CaptureError::UnsupportedCallbackShape(
            "callback returned an expression from another recording".into(),
        ));
    }

    let mut tape = shared.borrow_mut();
    match returned {
        Captured::Literal(value) => {
            if let Some(reason) = &tape.poisoned {
                return Err(CaptureError::UnsupportedCallbackShape(reason.clone()));
            }
            let dangling = tape.dangling(start);
            match dangling.as_slice() {
                [] => Ok(OperationRecord::literal(default_subject, Vec::new(), value)),
                [leaf] => {
                    let leaf = *leaf;
                    tape.nodes[leaf].consumed = true;
                    let (subject, operations) = tape.path(leaf);
                    Ok(OperationRecord::literal(subject, operations, value))
                }
                [_, second, ..] => Err(discarded(&tape, *second)),
            }
        }
        returned => {
            let record = tape.lower_captured(returned, default_subject);
            if let Some(reason) = &tape.poisoned {
                return Err(CaptureError::UnsupportedCallbackShape(reason.clone()));
            }
            if let Some(&idx) = tape.dangling(start).first() {
                return Err(discarded(&tape, idx));
            }
            Ok(record)
        }
    }
}

fn discarded(tape: &Tape, node: usize) -> CaptureError {
    CaptureError::UnsupportedCallbackShape(format!(
        "result of {} is discarded; every recorded operation must feed the returned value",
        tape.describe(node)
    ))
}

/// Records callbacks against placeholders.
///
/// Placeholders handed out by one recorder share a tape, so a callback may
/// combine several of them (see `capture`).
pub struct OperationRecorder {
    tape: SharedTape,
}

impl OperationRecorder {
    pub fn new() -> Self {
        Self {
            tape: Rc::new(RefCell::new(Tape::default())),
        }
    }

    /// Fresh placeholder bound to the next placeholder id
    pub fn placeholder(&self) -> (PlaceholderId, Expr) {
        let (id, node) = self.tape.borrow_mut().placeholder();
        (
            id,
            Expr {
                tape: self.tape.clone(),
                node,
            },
        )
    }

    /// Number of placeholder ids handed out so far
    pub fn placeholder_count(&self) -> u32 {
        self.tape.borrow().next_placeholder
    }

    /// Fold everything recorded so far into a record
    pub fn finish<R: IntoCaptured>(self, returned: R) -> Result<OperationRecord, CaptureError> {
        let default_subject = if self.placeholder_count() == 0 {
            PlaceholderId::ROOT
        } else {
            PlaceholderId(1)
        };
        let record = close_scope(&self.tape, 0, default_subject, returned.into_captured())?;
        tracing::trace!(
            subject = %record.subject,
            operations = record.operations.len(),
            derived = record.is_derived(),
            "recorded callback"
        );
        Ok(record)
    }

    /// Invoke `callback` once against a fresh placeholder
    pub fn record<F, R>(callback: F) -> Result<CallbackRecord, CaptureError>
    where
        F: FnOnce(Expr) -> R,
        R: IntoCaptured,
    {
        let recorder = Self::new();
        let (param, expr) = recorder.placeholder();
        let returned = callback(expr).into_captured();
        let body = recorder.finish(returned)?;
        Ok(CallbackRecord { param, body })
    }
}

impl Default for OperationRecorder {
    fn default() -> Self {
        Self::new()
    }
}
