//! Compensation journal: a store decorator that remembers how to undo every
//! write it forwards.
//!
//! The underlying store offers no multi-statement transactions. A document
//! operation runs against a [`Journal`] instead; on success the journal is
//! committed and forgotten, on failure its inverses are replayed newest
//! first. Inverses that themselves fail are collected and surfaced as
//! [`LedgerError::CompensationFailed`].
//!
//! Updates are not undone by restoring a row snapshot. Other operations may
//! have committed to the same aggregate since, so accumulating columns
//! (balances, stock, credit, paid amounts) are undone by subtracting this
//! journal's own delta under the aggregate lock, and every other column is
//! restored only while it still holds the value this journal wrote.

use std::str::FromStr;
use std::sync::Mutex;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use erp_store::{row_id, LedgerStore, Query, Row, RowId, StoreError, StoreResult, Table};

use crate::context::LedgerContext;
use crate::error::{LedgerError, LedgerResult};
use crate::locks::AggregateKey;
use crate::partners::derive_status;

/// Columns whose value is a running sum of movements.
fn is_accumulating(table: Table, column: &str) -> bool {
    matches!(
        (table, column),
        (Table::Accounts, "balance")
            | (Table::Products, "stock")
            | (Table::Customers, "store_credit")
            | (Table::PartnerAccounts, "amount" | "received_paid")
            | (Table::IchibanKujiPrizes, "remaining")
    )
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Decimal::from(i)),
            None => Decimal::from_str(&n.to_string()).ok(),
        },
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

/// One changed column: what it held before and what this journal wrote.
#[derive(Debug)]
struct ColumnUndo {
    column: String,
    previous: Value,
    written: Value,
}

impl ColumnUndo {
    /// `now` minus this journal's delta, in the same JSON shape as `now`.
    fn subtract_delta(&self, now: &Value) -> Option<Value> {
        let delta = decimal_of(&self.written)? - decimal_of(&self.previous)?;
        let restored = decimal_of(now)? - delta;
        match now {
            Value::Number(_) => restored.to_i64().map(Value::from),
            _ => Some(Value::String(restored.to_string())),
        }
    }
}

#[derive(Debug)]
enum Inverse {
    Delete { table: Table, id: RowId },
    Revert {
        table: Table,
        id: RowId,
        columns: Vec<ColumnUndo>,
    },
    Reinsert { table: Table, rows: Vec<Row> },
}

impl Inverse {
    fn apply<S: LedgerStore + ?Sized>(&self, store: &S, ctx: &LedgerContext) -> LedgerResult<()> {
        match self {
            Self::Delete { table, id } => {
                store.delete(*table, &Query::by_id(*id))?;
            }
            Self::Revert { table, id, columns } => {
                let _guard = match AggregateKey::for_row(*table, *id) {
                    Some(key) => Some(ctx.locks.acquire_one(key)?),
                    None => None,
                };
                let current = store
                    .select(*table, &Query::by_id(*id))?
                    .into_iter()
                    .next()
                    .ok_or(StoreError::NotFound {
                        table: *table,
                        id: *id,
                    })?;
                let patch = revert_patch(*table, &current, columns, ctx.epsilon());
                if !patch.is_empty() {
                    store.update(*table, *id, patch)?;
                }
            }
            Self::Reinsert { table, rows } => {
                for row in rows {
                    store.insert(*table, row.clone())?;
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self {
            Self::Delete { table, id } => format!("delete {table} {id}"),
            Self::Revert { table, id, .. } => format!("revert {table} {id}"),
            Self::Reinsert { table, rows } => format!("re-insert {} {table} row(s)", rows.len()),
        }
    }
}

fn revert_patch(table: Table, current: &Row, columns: &[ColumnUndo], epsilon: Decimal) -> Row {
    let mut patch = Row::new();
    for undo in columns {
        let now = current.get(&undo.column).unwrap_or(&Value::Null);
        if is_accumulating(table, &undo.column) {
            if let Some(value) = undo.subtract_delta(now) {
                patch.insert(undo.column.clone(), value);
                continue;
            }
        }
        if *now == undo.written {
            patch.insert(undo.column.clone(), undo.previous.clone());
        } else {
            debug!(%table, column = %undo.column, "column rewritten since, kept");
        }
    }
    if table == Table::PartnerAccounts {
        refresh_line(current, &mut patch, epsilon);
    }
    patch
}

/// Keep a partner line's balance and status in step with its amounts.
fn refresh_line(current: &Row, patch: &mut Row, epsilon: Decimal) {
    let read = |column: &str| {
        patch
            .get(column)
            .or_else(|| current.get(column))
            .and_then(decimal_of)
    };
    if let (Some(amount), Some(paid)) = (read("amount"), read("received_paid")) {
        let status = derive_status(amount, paid, epsilon);
        patch.insert("balance".into(), json!(amount - paid));
        patch.insert("status".into(), json!(status.as_str()));
    }
}

/// Write-recording wrapper around a [`LedgerStore`].
pub struct Journal<'s, S: LedgerStore + ?Sized> {
    store: &'s S,
    ctx: &'s LedgerContext,
    operation: &'static str,
    id: Uuid,
    inverses: Mutex<Vec<Inverse>>,
}

impl<'s, S: LedgerStore + ?Sized> Journal<'s, S> {
    pub fn begin(store: &'s S, ctx: &'s LedgerContext, operation: &'static str) -> Self {
        let id = Uuid::now_v7();
        debug!(%id, operation, "journal opened");
        Self {
            store,
            ctx,
            operation,
            id,
            inverses: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Number of writes that would be undone by a rollback.
    pub fn pending(&self) -> usize {
        self.inverses.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Keep every write.
    pub fn commit(self) {
        debug!(id = %self.id, operation = self.operation, writes = self.pending(), "journal committed");
    }

    /// Undo every write newest first and return the error to report.
    ///
    /// Returns `cause` unchanged when every inverse applied cleanly.
    pub fn rollback(self, cause: LedgerError) -> LedgerError {
        let inverses = match self.inverses.into_inner() {
            Ok(inverses) => inverses,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inverses.is_empty() {
            debug!(id = %self.id, operation = self.operation, %cause, "failed before any write");
            return cause;
        }
        warn!(
            id = %self.id,
            operation = self.operation,
            writes = inverses.len(),
            %cause,
            "rolling back"
        );
        let mut failures = Vec::new();
        for inverse in inverses.iter().rev() {
            if let Err(e) = inverse.apply(self.store, self.ctx) {
                error!(id = %self.id, step = %inverse.describe(), error = %e, "compensation step failed");
                failures.push(format!("{}: {e}", inverse.describe()));
            }
        }
        if failures.is_empty() {
            cause
        } else {
            error!(
                id = %self.id,
                operation = self.operation,
                failed = failures.len(),
                "store left inconsistent, manual reconciliation required"
            );
            LedgerError::CompensationFailed {
                operation: self.operation.to_string(),
                cause: Box::new(cause),
                failures,
            }
        }
    }

    fn record(&self, inverse: Inverse) -> StoreResult<()> {
        self.inverses
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(inverse);
        Ok(())
    }
}

impl<S: LedgerStore + ?Sized> LedgerStore for Journal<'_, S> {
    fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>> {
        self.store.select(table, query)
    }

    fn insert(&self, table: Table, row: Row) -> StoreResult<Row> {
        let stored = self.store.insert(table, row)?;
        if let Some(id) = row_id(&stored) {
            self.record(Inverse::Delete { table, id })?;
        }
        Ok(stored)
    }

    fn update(&self, table: Table, id: RowId, patch: Row) -> StoreResult<Row> {
        let previous = self.store.update(table, id, patch.clone())?;
        let columns: Vec<ColumnUndo> = patch
            .into_iter()
            .filter(|(column, _)| column != "id")
            .filter_map(|(column, written)| {
                let before = previous.get(&column).cloned().unwrap_or(Value::Null);
                (before != written).then_some(ColumnUndo {
                    column,
                    previous: before,
                    written,
                })
            })
            .collect();
        if !columns.is_empty() {
            self.record(Inverse::Revert { table, id, columns })?;
        }
        Ok(previous)
    }

    fn delete(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>> {
        let rows = self.store.delete(table, query)?;
        if !rows.is_empty() {
            self.record(Inverse::Reinsert {
                table,
                rows: rows.clone(),
            })?;
        }
        Ok(rows)
    }
}
