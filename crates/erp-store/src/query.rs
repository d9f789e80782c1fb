//! Row filters: `select … where … eq / in / gte / lte`.

use std::cmp::Ordering;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::table::{Row, RowId};

/// One predicate over a named column.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
}

impl Filter {
    /// Whether `row` satisfies this predicate. A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, expected) => row
                .get(column)
                .is_some_and(|actual| values_equal(actual, expected)),
            Self::In(column, candidates) => row.get(column).is_some_and(|actual| {
                candidates
                    .iter()
                    .any(|candidate| values_equal(actual, candidate))
            }),
            Self::Gte(column, bound) => row.get(column).is_some_and(|actual| {
                matches!(
                    compare_values(actual, bound),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Self::Lte(column, bound) => row.get(column).is_some_and(|actual| {
                matches!(
                    compare_values(actual, bound),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }),
        }
    }
}

/// A conjunction of filters plus result ordering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    filters: Vec<Filter>,
    newest_first: bool,
    limit: Option<usize>,
}

impl Query {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match the row with this primary key.
    pub fn by_id(id: RowId) -> Self {
        Self::all().eq("id", id)
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(column.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lte(column.to_string(), value.into()));
        self
    }

    /// Return rows in descending id order.
    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_newest_first(&self) -> bool {
        self.newest_first
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.limit
    }

    /// Whether `row` satisfies every filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

/// Order two column values. Integers compare exactly, decimal strings compare
/// numerically, other strings lexically (ISO dates sort correctly).
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => {
            match (Decimal::from_str(x), Decimal::from_str(y)) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Number(x), Value::String(y)) | (Value::String(y), Value::Number(x)) => {
            let flipped = matches!(a, Value::String(_));
            let x = Decimal::from_str(&x.to_string()).ok()?;
            let y = Decimal::from_str(y).ok()?;
            let ord = x.cmp(&y);
            Some(if flipped { ord.reverse() } else { ord })
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
