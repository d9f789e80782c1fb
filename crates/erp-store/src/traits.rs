use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::records::Record;
use crate::table::{Row, RowId, Table};

/// Relational store reachable through filtered reads and single-row writes.
///
/// Implementations make no atomicity promise across calls: every call is its
/// own statement. Callers that need all-or-nothing behavior wrap the store in
/// a compensation journal.
pub trait LedgerStore: Send + Sync {
    /// Rows of `table` matching `query`, ascending by id unless the query
    /// asks for newest first.
    fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>>;

    /// Insert a row and return it as stored.
    ///
    /// A missing or zero `id` is assigned by the store. An explicit `id` is
    /// kept and fails with [`StoreError::DuplicateId`] if taken.
    fn insert(&self, table: Table, row: Row) -> StoreResult<Row>;

    /// Merge `patch` into the row with this id and return the previous row.
    ///
    /// Fails with [`StoreError::NotFound`] if the row does not exist. The
    /// `id` column cannot be changed.
    fn update(&self, table: Table, id: RowId, patch: Row) -> StoreResult<Row>;

    /// Delete every row matching `query` and return the removed rows.
    fn delete(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>>;
}

/// Typed access on top of [`LedgerStore`]. Implemented for every store.
pub trait RecordStore: LedgerStore {
    fn fetch<R: Record>(&self, query: &Query) -> StoreResult<Vec<R>> {
        self.select(R::TABLE, query)?
            .into_iter()
            .map(R::from_row)
            .collect()
    }

    fn find<R: Record>(&self, id: RowId) -> StoreResult<Option<R>> {
        Ok(self.fetch::<R>(&Query::by_id(id))?.into_iter().next())
    }

    /// Like [`RecordStore::find`] but a missing row is an error.
    fn get<R: Record>(&self, id: RowId) -> StoreResult<R> {
        self.find(id)?.ok_or(StoreError::NotFound {
            table: R::TABLE,
            id,
        })
    }

    fn exists<R: Record>(&self, query: &Query) -> StoreResult<bool> {
        Ok(!self.select(R::TABLE, &query.clone().limit(1))?.is_empty())
    }

    /// Insert a new record and return it with its assigned id.
    fn create<R: Record>(&self, record: &R) -> StoreResult<R> {
        let row = self.insert(R::TABLE, record.to_row()?)?;
        R::from_row(row)
    }

    /// Overwrite every column of an existing record.
    fn save<R: Record>(&self, record: &R) -> StoreResult<()> {
        let mut row = record.to_row()?;
        row.remove("id");
        self.update(R::TABLE, record.id(), row)?;
        Ok(())
    }

    /// Patch selected columns of an existing record.
    fn patch<R: Record>(&self, id: RowId, columns: &[(&str, Value)]) -> StoreResult<()> {
        let patch: Row = columns
            .iter()
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect();
        self.update(R::TABLE, id, patch)?;
        Ok(())
    }

    /// Delete one record by id. Returns `true` if it existed.
    fn remove<R: Record>(&self, id: RowId) -> StoreResult<bool> {
        Ok(!self.delete(R::TABLE, &Query::by_id(id))?.is_empty())
    }

    fn remove_where<R: Record>(&self, query: &Query) -> StoreResult<Vec<R>> {
        self.delete(R::TABLE, query)?
            .into_iter()
            .map(R::from_row)
            .collect()
    }
}

impl<S: LedgerStore + ?Sized> RecordStore for S {}
