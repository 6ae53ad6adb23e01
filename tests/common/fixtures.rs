//! Target objects for session tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use capwire::target::value_arg;
use capwire::{Live, ReplayError, TargetObject, Value};

/// `next()` returns a counter one deeper; `depth` reads the depth.
#[derive(Debug, Default, Clone)]
pub struct Counter {
    pub depth: i64,
}

impl TargetObject for Counter {
    fn type_tag(&self) -> &str {
        "Counter"
    }

    fn get(&self, name: &str) -> Result<Live, ReplayError> {
        match name {
            "depth" => Ok(Live::Value(Value::Int(self.depth))),
            _ => Err(ReplayError::PropertyMissing {
                type_tag: self.type_tag().to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn call(&self, name: &str, args: Vec<Live>) -> Result<Live, ReplayError> {
        match name {
            "next" => Ok(Live::object(Counter {
                depth: self.depth + 1,
            })),
            "add" => {
                let n = value_arg(&args, 0, "add")?
                    .as_i64()
                    .ok_or_else(|| ReplayError::mismatch("add expects an integer"))?;
                Ok(Live::Value(Value::Int(self.depth + n)))
            }
            "info" => Ok(Live::Value(Value::map([
                ("depth", Value::Int(self.depth)),
                ("kind", Value::from("counter")),
            ]))),
            _ => Err(self.missing(name)),
        }
    }
}

/// Counts how often `me()` runs. `me()` returns the same tally; `pair(..)`
/// returns how many of its arguments are objects.
#[derive(Debug, Default, Clone)]
pub struct Tally {
    touches: Arc<AtomicUsize>,
}

impl Tally {
    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }
}

impl TargetObject for Tally {
    fn type_tag(&self) -> &str {
        "Tally"
    }

    fn get(&self, name: &str) -> Result<Live, ReplayError> {
        match name {
            "touches" => Ok(Live::Value(Value::Int(self.touches() as i64))),
            _ => Err(ReplayError::PropertyMissing {
                type_tag: self.type_tag().to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn call(&self, name: &str, args: Vec<Live>) -> Result<Live, ReplayError> {
        match name {
            "me" => {
                self.touches.fetch_add(1, Ordering::SeqCst);
                Ok(Live::object(self.clone()))
            }
            "pair" => {
                let objects = args
                    .iter()
                    .filter(|arg| matches!(arg, Live::Object(_)))
                    .count();
                Ok(Live::Value(Value::Int(objects as i64)))
            }
            _ => Err(self.missing(name)),
        }
    }
}
