//! Operation records: capture on the calling side, replay on the target side.

mod builtins;
pub mod operation;
pub mod recorder;
pub mod replay;

pub use operation::{Arg, CallbackRecord, Operation, OperationRecord, PlaceholderId, RecordResult};
pub use recorder::{Captured, Expr, IntoCaptured, Operand, OperationRecorder};
pub use replay::{CallbackReplayEngine, Env, ReplayCallback};
