//! In-memory query builder used by the demo and the integration tests.
//!
//! A [`RowSet`] is immutable; every builder method returns a new set, so a
//! remote caller can keep refining a query it holds a capability to.

use std::cmp::Ordering;

use crate::error::ReplayError;
use crate::target::{callback_arg, value_arg, Live, TargetObject};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct RowSet {
    rows: Vec<Value>,
}

impl RowSet {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    fn filter(&self, args: &[Live]) -> Result<RowSet, ReplayError> {
        let predicate = callback_arg(args, 0, "where")?;
        let mut kept = Vec::new();
        for row in &self.rows {
            match predicate.invoke(Live::Value(row.clone()))?.into_value()? {
                Value::Bool(true) => kept.push(row.clone()),
                Value::Bool(false) => {}
                other => {
                    return Err(ReplayError::mismatch(format!(
                        "`where` predicate returned {}, expected bool",
                        other.kind()
                    )))
                }
            }
        }
        Ok(RowSet::new(kept))
    }

    fn order_by(&self, args: &[Live]) -> Result<RowSet, ReplayError> {
        let descending = match args.get(1) {
            None => false,
            Some(_) => match value_arg(args, 1, "orderBy")?.as_str() {
                Some("asc") => false,
                Some("desc") => true,
                _ => return Err(ReplayError::mismatch("`orderBy` direction must be asc or desc")),
            },
        };

        let mut keyed = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            keyed.push((self.key(args, row)?, row.clone()));
        }
        let mut incomparable = None;
        keyed.sort_by(|(a, _), (b, _)| {
            a.compare(b).unwrap_or_else(|| {
                incomparable.get_or_insert((a.kind(), b.kind()));
                Ordering::Equal
            })
        });
        if let Some((a, b)) = incomparable {
            return Err(ReplayError::mismatch(format!(
                "`orderBy` cannot compare {a} with {b}"
            )));
        }
        if descending {
            keyed.reverse();
        }
        Ok(RowSet::new(keyed.into_iter().map(|(_, row)| row).collect()))
    }

    /// Sort key: a column name or a callback over the row
    fn key(&self, args: &[Live], row: &Value) -> Result<Value, ReplayError> {
        match args.first() {
            Some(Live::Callback(callback)) => callback.invoke(Live::Value(row.clone()))?.into_value(),
            _ => {
                let column = value_arg(args, 0, "orderBy")?;
                let column = column
                    .as_str()
                    .ok_or_else(|| ReplayError::mismatch("`orderBy` expects a column name"))?;
                Ok(row.field(column).cloned().unwrap_or(Value::Null))
            }
        }
    }

    fn project(&self, args: &[Live]) -> Result<RowSet, ReplayError> {
        if let Some(Live::Callback(mapper)) = args.first() {
            let rows = self
                .rows
                .iter()
                .map(|row| mapper.invoke(Live::Value(row.clone()))?.into_value())
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(RowSet::new(rows));
        }

        // alias -> column
        let columns: Vec<(String, String)> = match value_arg(args, 0, "select")? {
            Value::String(column) => vec![(column.clone(), column)],
            Value::List(names) => names
                .iter()
                .map(|name| {
                    name.as_str()
                        .map(|n| (n.to_string(), n.to_string()))
                        .ok_or_else(|| ReplayError::mismatch("`select` column names must be strings"))
                })
                .collect::<Result<_, _>>()?,
            Value::Map(aliases) => aliases
                .into_iter()
                .map(|(alias, column)| match column {
                    Value::String(column) => Ok((alias, column)),
                    other => Err(ReplayError::mismatch(format!(
                        "`select` alias {alias} must name a column, found {}",
                        other.kind()
                    ))),
                })
                .collect::<Result<_, _>>()?,
            other => {
                return Err(ReplayError::mismatch(format!(
                    "`select` expects column names or a callback, found {}",
                    other.kind()
                )))
            }
        };

        let rows = self
            .rows
            .iter()
            .map(|row| {
                Value::map(columns.iter().map(|(alias, column)| {
                    (alias.clone(), row.field(column).cloned().unwrap_or(Value::Null))
                }))
            })
            .collect();
        Ok(RowSet::new(rows))
    }

    fn window(&self, args: &[Live], method: &str) -> Result<RowSet, ReplayError> {
        let n = value_arg(args, 0, method)?
            .as_i64()
            .filter(|n| *n >= 0)
            .ok_or_else(|| ReplayError::mismatch(format!("`{method}` expects a non-negative integer")))?
            as usize;
        let rows = match method {
            "limit" => self.rows.iter().take(n).cloned().collect(),
            _ => self.rows.iter().skip(n).cloned().collect(),
        };
        Ok(RowSet::new(rows))
    }
}

impl TargetObject for RowSet {
    fn type_tag(&self) -> &str {
        "RowSet"
    }

    fn get(&self, name: &str) -> Result<Live, ReplayError> {
        match name {
            "length" => Ok(Live::Value(Value::Int(self.rows.len() as i64))),
            _ => Err(ReplayError::PropertyMissing {
                type_tag: self.type_tag().to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn call(&self, name: &str, args: Vec<Live>) -> Result<Live, ReplayError> {
        let next = match name {
            "where" => self.filter(&args)?,
            "orderBy" => self.order_by(&args)?,
            "select" => self.project(&args)?,
            "limit" | "offset" => self.window(&args, name)?,
            "rows" | "execute" => return Ok(Live::Value(Value::List(self.rows.clone()))),
            "count" => return Ok(Live::Value(Value::Int(self.rows.len() as i64))),
            "first" => {
                return Ok(Live::Value(
                    self.rows.first().cloned().unwrap_or(Value::Null),
                ))
            }
            _ => return Err(self.missing(name)),
        };
        Ok(Live::object(next))
    }
}

/// Bootstrap object of the demo: hands out row sets
#[derive(Debug, Clone)]
pub struct QueryService {
    people: Vec<Value>,
}

impl QueryService {
    pub fn new(people: Vec<Value>) -> Self {
        Self { people }
    }

    fn person(id: i64, name: &str, age: i64) -> Value {
        Value::map([
            ("id", Value::Int(id)),
            ("name", Value::from(name)),
            ("age", Value::Int(age)),
        ])
    }
}

impl Default for QueryService {
    fn default() -> Self {
        Self::new(vec![
            Self::person(1, "Alice", 30),
            Self::person(2, "Bob", 31),
            Self::person(3, "Charlie", 32),
        ])
    }
}

impl TargetObject for QueryService {
    fn type_tag(&self) -> &str {
        "QueryService"
    }

    fn call(&self, name: &str, _args: Vec<Live>) -> Result<Live, ReplayError> {
        match name {
            "values" => Ok(Live::object(RowSet::new(self.people.clone()))),
            "getQuery" => Ok(Live::object(RowSet::new(
                self.people.iter().take(1).cloned().collect(),
            ))),
            "test" => Ok(Live::Value(Value::map([("foo", "bar")]))),
            _ => Err(self.missing(name)),
        }
    }
}
