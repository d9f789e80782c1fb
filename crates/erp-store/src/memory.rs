use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::table::{row_id, Row, RowId, Table};
use crate::traits::LedgerStore;

/// In-memory, `BTreeMap`-per-table ledger store.
///
/// Intended for tests and embedding. Each call takes the lock once, so a
/// single statement is atomic but a sequence of statements is not.
pub struct InMemoryStore {
    inner: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<Table, BTreeMap<RowId, Row>>,
    next_ids: HashMap<Table, RowId>,
}

impl StoreState {
    fn allocate_id(&mut self, table: Table) -> RowId {
        let next = self.next_ids.entry(table).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn observe_id(&mut self, table: Table, id: RowId) {
        let next = self.next_ids.entry(table).or_insert(1);
        if id >= *next {
            *next = id + 1;
        }
    }
}

/// Serializable image of every table, keyed by table name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tables: BTreeMap<Table, Vec<Row>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreState::default()),
        }
    }

    /// Number of rows currently held in `table`.
    pub fn row_count(&self, table: Table) -> StoreResult<usize> {
        let state = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.tables.get(&table).map_or(0, BTreeMap::len))
    }

    /// Copy every table into a [`Snapshot`].
    pub fn snapshot(&self) -> StoreResult<Snapshot> {
        let state = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let tables = state
            .tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, rows)| (*table, rows.values().cloned().collect()))
            .collect();
        Ok(Snapshot { tables })
    }

    /// Build a store holding exactly the rows of `snapshot`.
    pub fn from_snapshot(snapshot: Snapshot) -> StoreResult<Self> {
        let store = Self::new();
        for (table, rows) in snapshot.tables {
            for row in rows {
                if row_id(&row).is_none() {
                    return Err(StoreError::MalformedRow {
                        table,
                        reason: "snapshot row without id".into(),
                    });
                }
                store.insert(table, row)?;
            }
        }
        Ok(store)
    }

    /// Load a JSON snapshot file.
    pub fn load_snapshot(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let snapshot: Snapshot =
            serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::from_snapshot(snapshot)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for InMemoryStore {
    fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>> {
        let state = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let Some(rows) = state.tables.get(&table) else {
            return Ok(Vec::new());
        };
        let matching = rows.values().filter(|row| query.matches(row)).cloned();
        let limit = query.max_rows().unwrap_or(usize::MAX);
        let result = if query.is_newest_first() {
            let mut all: Vec<Row> = matching.collect();
            all.reverse();
            all.into_iter().take(limit).collect()
        } else {
            matching.take(limit).collect()
        };
        Ok(result)
    }

    fn insert(&self, table: Table, mut row: Row) -> StoreResult<Row> {
        let mut state = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let id = match row_id(&row) {
            Some(id) => {
                let taken = state
                    .tables
                    .get(&table)
                    .is_some_and(|rows| rows.contains_key(&id));
                if taken {
                    return Err(StoreError::DuplicateId { table, id });
                }
                state.observe_id(table, id);
                id
            }
            None => state.allocate_id(table),
        };
        row.insert("id".into(), Value::from(id));
        state.tables.entry(table).or_default().insert(id, row.clone());
        tracing::trace!(%table, id, "row inserted");
        Ok(row)
    }

    fn update(&self, table: Table, id: RowId, patch: Row) -> StoreResult<Row> {
        let mut state = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let row = state
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(StoreError::NotFound { table, id })?;
        let previous = row.clone();
        for (column, value) in patch {
            if column != "id" {
                row.insert(column, value);
            }
        }
        tracing::trace!(%table, id, "row updated");
        Ok(previous)
    }

    fn delete(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>> {
        let mut state = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let Some(rows) = state.tables.get_mut(&table) else {
            return Ok(Vec::new());
        };
        let ids: Vec<RowId> = rows
            .iter()
            .filter(|(_, row)| query.matches(row))
            .map(|(id, _)| *id)
            .take(query.max_rows().unwrap_or(usize::MAX))
            .collect();
        let removed: Vec<Row> = ids.iter().filter_map(|id| rows.remove(id)).collect();
        tracing::trace!(%table, count = removed.len(), "rows deleted");
        Ok(removed)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows: usize = self
            .inner
            .read()
            .map(|state| state.tables.values().map(BTreeMap::len).sum())
            .unwrap_or(0);
        f.debug_struct("InMemoryStore").field("row_count", &rows).finish()
    }
}
