//! Per-aggregate mutual exclusion around read-modify-write sequences.
//!
//! A caller names every aggregate it is about to rewrite and receives a
//! guard once all of them are free. Keys are totally ordered and a set is
//! taken in one step, so two callers can never hold halves of each other's
//! sets. Callers must not acquire again while holding a guard.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use erp_store::{RowId, StoreError, Table};

use crate::error::LedgerResult;

/// An aggregate whose derived value is rewritten in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateKey {
    Product(RowId),
    PartnerAccount(RowId),
    Customer(RowId),
    Account(RowId),
}

impl AggregateKey {
    /// The lock guarding a row's derived values, if its table has one.
    pub fn for_row(table: Table, id: RowId) -> Option<Self> {
        match table {
            Table::Products => Some(Self::Product(id)),
            Table::PartnerAccounts => Some(Self::PartnerAccount(id)),
            Table::Customers => Some(Self::Customer(id)),
            Table::Accounts => Some(Self::Account(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct AggregateLocks {
    held: Mutex<BTreeSet<AggregateKey>>,
    released: Condvar,
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key is free, then hold them all.
    pub fn acquire(
        &self,
        keys: impl IntoIterator<Item = AggregateKey>,
    ) -> LedgerResult<AggregateGuard<'_>> {
        let keys: BTreeSet<AggregateKey> = keys.into_iter().collect();
        let mut held = self.held.lock().map_err(|_| StoreError::Poisoned)?;
        while keys.iter().any(|key| held.contains(key)) {
            held = self
                .released
                .wait(held)
                .map_err(|_| StoreError::Poisoned)?;
        }
        held.extend(keys.iter().copied());
        tracing::trace!(?keys, "aggregates locked");
        Ok(AggregateGuard { locks: self, keys })
    }

    /// Shorthand for a single key.
    pub fn acquire_one(&self, key: AggregateKey) -> LedgerResult<AggregateGuard<'_>> {
        self.acquire([key])
    }

    pub fn is_held(&self, key: AggregateKey) -> bool {
        self.held.lock().map(|held| held.contains(&key)).unwrap_or(false)
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct AggregateGuard<'a> {
    locks: &'a AggregateLocks,
    keys: BTreeSet<AggregateKey>,
}

impl AggregateGuard<'_> {
    pub fn keys(&self) -> impl Iterator<Item = &AggregateKey> {
        self.keys.iter()
    }
}

impl Drop for AggregateGuard<'_> {
    fn drop(&mut self) {
        // A poisoned set can only come from a panic while holding the mutex
        // itself, never while holding a guard; recover the data either way.
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            held.remove(key);
        }
        self.locks.released.notify_all();
    }
}
