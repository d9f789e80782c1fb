//! Shared fixtures for engine tests: a fault-injecting store and seeders.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

use erp_store::{
    Account, Customer, Delivery, DeliveryItem, IchibanKujiPrize, InMemoryStore, LedgerStore,
    Product, Purchase, PurchaseItem, Query, RecordStore, Row, RowId, Sale, SaleItem, StoreError,
    StoreResult, Table,
};
use erp_types::{
    clock::offset_from_hours, DeliveryStatus, FixedClock, FulfillmentStatus, PaymentMethod,
    PurchaseStatus, SaleStatus,
};

use crate::config::LedgerConfig;
use crate::context::LedgerContext;
use crate::ledger::Ledger;

/// 2024-05-01 10:00 at UTC+8.
pub fn clock() -> FixedClock {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
    FixedClock::new(at, offset_from_hours(8).unwrap())
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

pub fn context() -> LedgerContext {
    LedgerContext::new(LedgerConfig::default(), Arc::new(clock()))
}

pub fn ledger() -> Ledger<InMemoryStore> {
    Ledger::new(InMemoryStore::new(), LedgerConfig::default(), Arc::new(clock()))
}

pub fn faulty_ledger() -> Ledger<FaultyStore> {
    Ledger::new(FaultyStore::new(), LedgerConfig::default(), Arc::new(clock()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Op {
    Insert,
    Update,
    Delete,
}

/// In-memory store that fails chosen write kinds on chosen tables.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: InMemoryStore,
    failing: Mutex<HashSet<(Op, Table)>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, table: Table) {
        self.failing.lock().unwrap().insert((Op::Insert, table));
    }

    pub fn fail_updates(&self, table: Table) {
        self.failing.lock().unwrap().insert((Op::Update, table));
    }

    pub fn fail_deletes(&self, table: Table) {
        self.failing.lock().unwrap().insert((Op::Delete, table));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.inner.row_count(table).unwrap()
    }

    fn check(&self, op: Op, table: Table) -> StoreResult<()> {
        if self.failing.lock().unwrap().contains(&(op, table)) {
            Err(StoreError::Unavailable(format!("injected {op:?} failure on {table}")))
        } else {
            Ok(())
        }
    }
}

impl LedgerStore for FaultyStore {
    fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>> {
        self.inner.select(table, query)
    }

    fn insert(&self, table: Table, row: Row) -> StoreResult<Row> {
        self.check(Op::Insert, table)?;
        self.inner.insert(table, row)
    }

    fn update(&self, table: Table, id: RowId, patch: Row) -> StoreResult<Row> {
        self.check(Op::Update, table)?;
        self.inner.update(table, id, patch)
    }

    fn delete(&self, table: Table, query: &Query) -> StoreResult<Vec<Row>> {
        self.check(Op::Delete, table)?;
        self.inner.delete(table, query)
    }
}

// ---------------------------------------------------------------------------
// Seeders
// ---------------------------------------------------------------------------

pub fn product<S: LedgerStore + ?Sized>(store: &S, stock: i64, avg_cost: Decimal) -> Product {
    let count = store.select(Table::Products, &Query::all()).unwrap().len();
    store
        .create(&Product {
            id: 0,
            sku: format!("SKU-{}", count + 1),
            name: format!("Product {}", count + 1),
            stock,
            avg_cost,
            allow_negative: false,
        })
        .unwrap()
}

pub fn account<S: LedgerStore + ?Sized>(store: &S, method: &str, balance: Decimal) -> Account {
    store
        .create(&Account {
            id: 0,
            name: method.to_uppercase(),
            account_type: if method == "cash" { "cash" } else { "bank" }.into(),
            payment_method_code: Some(method.into()),
            balance,
            opening_balance: balance,
            is_active: true,
        })
        .unwrap()
}

pub fn customer<S: LedgerStore + ?Sized>(store: &S, code: &str, credit: Decimal) -> Customer {
    store
        .create(&Customer {
            id: 0,
            code: code.into(),
            name: format!("Customer {code}"),
            store_credit: credit,
        })
        .unwrap()
}

pub fn prize<S: LedgerStore + ?Sized>(store: &S, remaining: i64) -> IchibanKujiPrize {
    store
        .create(&IchibanKujiPrize {
            id: 0,
            name: "A Prize".into(),
            remaining,
        })
        .unwrap()
}

/// A draft sale with one item per `(product_id, quantity, unit_price)`.
pub fn draft_sale<S: LedgerStore + ?Sized>(
    store: &S,
    customer_code: Option<&str>,
    method: &str,
    paid: Decimal,
    items: &[(RowId, i64, Decimal)],
) -> (Sale, Vec<SaleItem>) {
    let total: Decimal = items
        .iter()
        .map(|(_, qty, price)| Decimal::from(*qty) * price)
        .sum();
    let sale = store
        .create(&Sale {
            id: 0,
            sale_no: "S-0001".into(),
            customer_code: customer_code.map(str::to_string),
            sale_date: today(),
            status: SaleStatus::Draft,
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            total,
            paid_amount: paid,
            payment_method: PaymentMethod::from(method),
            account_id: None,
        })
        .unwrap();
    let items = items
        .iter()
        .map(|(product_id, quantity, unit_price)| {
            store
                .create(&SaleItem {
                    id: 0,
                    sale_id: sale.id,
                    product_id: *product_id,
                    quantity: *quantity,
                    unit_price: *unit_price,
                    subtotal: Decimal::from(*quantity) * unit_price,
                    prize_id: None,
                })
                .unwrap()
        })
        .collect();
    (sale, items)
}

/// A pending delivery shipping `(sale_item, quantity)` pairs.
pub fn delivery<S: LedgerStore + ?Sized>(
    store: &S,
    sale_id: RowId,
    lines: &[(&SaleItem, i64)],
) -> Delivery {
    let delivery = store
        .create(&Delivery {
            id: 0,
            sale_id,
            delivery_no: format!("D-{sale_id}"),
            status: DeliveryStatus::Pending,
            confirmed_at: None,
        })
        .unwrap();
    for (item, quantity) in lines {
        store
            .create(&DeliveryItem {
                id: 0,
                delivery_id: delivery.id,
                sale_item_id: item.id,
                product_id: item.product_id,
                quantity: *quantity,
            })
            .unwrap();
    }
    delivery
}

/// A pending purchase with zero-cost items of the given quantities.
pub fn pending_purchase<S: LedgerStore + ?Sized>(
    store: &S,
    vendor_code: &str,
    method: &str,
    paid: Decimal,
    items: &[(RowId, i64)],
) -> (Purchase, Vec<PurchaseItem>) {
    let purchase = store
        .create(&Purchase {
            id: 0,
            purchase_no: "P-0001".into(),
            vendor_code: vendor_code.into(),
            status: PurchaseStatus::Pending,
            total: Decimal::ZERO,
            paid_amount: paid,
            payment_method: PaymentMethod::from(method),
            account_id: None,
            approved_on: None,
        })
        .unwrap();
    let items = items
        .iter()
        .map(|(product_id, quantity)| {
            store
                .create(&PurchaseItem {
                    id: 0,
                    purchase_id: purchase.id,
                    product_id: *product_id,
                    quantity: *quantity,
                    unit_cost: Decimal::ZERO,
                    subtotal: Decimal::ZERO,
                    received_quantity: 0,
                })
                .unwrap()
        })
        .collect();
    (purchase, items)
}
