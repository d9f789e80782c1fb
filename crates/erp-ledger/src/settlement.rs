//! Settlement engine: receipts and payments allocated across AR/AP lines,
//! and their reversal when the lines they paid go away.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use erp_store::{
    LedgerStore, PartnerAccount, Query, RecordStore, RowId, Settlement, SettlementAllocation,
};
use erp_types::{PartnerType, PaymentMethod, SettlementDirection, TransactionType};

use crate::accounts::{AccountLedger, AccountTarget, PostingOutcome, PostingRequest};
use crate::context::LedgerContext;
use crate::credit::StoreCredit;
use crate::error::{LedgerError, LedgerResult, Warning};
use crate::partners::PartnerAccounts;

const SETTLEMENT_REF: &str = "settlement";
const REFUND_REF: &str = "settlement_refund";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub partner_account_id: RowId,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub partner_type: PartnerType,
    pub partner_code: String,
    pub direction: SettlementDirection,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub allocations: Vec<AllocationRequest>,
    #[serde(default)]
    pub account_id: Option<RowId>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SettlementOutcome {
    pub settlement: Settlement,
    pub allocations: Vec<SettlementAllocation>,
    pub posting: Option<PostingOutcome>,
    pub warnings: Vec<Warning>,
}

/// What unwinding settlements did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SettlementReversal {
    /// Settlements deleted outright.
    pub deleted: Vec<RowId>,
    /// Settlements that lost some allocations, with their new amount.
    pub shrunk: Vec<(RowId, Decimal)>,
    /// Total allocation amount released from partner lines.
    pub released: Decimal,
    pub warnings: Vec<Warning>,
}

impl SettlementReversal {
    pub(crate) fn merge(&mut self, other: SettlementReversal) {
        self.deleted.extend(other.deleted);
        self.shrunk.extend(other.shrunk);
        self.released += other.released;
        self.warnings.extend(other.warnings);
    }
}

fn reference_no(settlement_id: RowId) -> String {
    format!("STL-{settlement_id}")
}

pub struct SettlementEngine<'a, S: ?Sized> {
    store: &'a S,
    ctx: &'a LedgerContext,
}

impl<'a, S: LedgerStore + ?Sized> SettlementEngine<'a, S> {
    pub fn new(store: &'a S, ctx: &'a LedgerContext) -> Self {
        Self { store, ctx }
    }

    fn accounts(&self) -> AccountLedger<'a, S> {
        AccountLedger::new(self.store, self.ctx)
    }

    fn partners(&self) -> PartnerAccounts<'a, S> {
        PartnerAccounts::new(self.store, self.ctx)
    }

    fn credit(&self) -> StoreCredit<'a, S> {
        StoreCredit::new(self.store, self.ctx)
    }

    /// Every precondition, checked before the first write.
    fn validate(&self, request: &SettlementRequest) -> LedgerResult<()> {
        let eps = self.ctx.epsilon();
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(request.amount));
        }
        let allocated: Decimal = request.allocations.iter().map(|a| a.amount).sum();
        if (allocated - request.amount).abs() > eps {
            return Err(LedgerError::AllocationMismatch {
                amount: request.amount,
                allocated,
            });
        }

        let mut per_line: BTreeMap<RowId, Decimal> = BTreeMap::new();
        for allocation in &request.allocations {
            if allocation.amount <= Decimal::ZERO {
                return Err(LedgerError::InvalidAmount(allocation.amount));
            }
            *per_line.entry(allocation.partner_account_id).or_default() += allocation.amount;
        }
        let expected = request.direction.expected_side();
        for (line_id, requested) in per_line {
            let line: PartnerAccount = self.store.get(line_id)?;
            if line.direction != expected {
                return Err(LedgerError::WrongDirection {
                    partner_account_id: line_id,
                    expected,
                    actual: line.direction,
                });
            }
            if line.partner_type != request.partner_type || line.partner_code != request.partner_code
            {
                return Err(LedgerError::invalid_state(
                    "partner_accounts",
                    line_id,
                    format!("belongs to {} {}", line.partner_type, line.partner_code),
                ));
            }
            if requested > line.balance + eps {
                return Err(LedgerError::OverAllocation {
                    partner_account_id: line_id,
                    requested,
                    available: line.balance,
                });
            }
        }

        if request.method == PaymentMethod::StoreCredit {
            if request.partner_type != PartnerType::Customer {
                return Err(LedgerError::InsufficientStoreCredit {
                    customer: request.partner_code.clone(),
                    requested: request.amount,
                    available: Decimal::ZERO,
                });
            }
            self.credit()
                .check_available(&request.partner_code, request.amount)?;
        }
        Ok(())
    }

    /// Record a receipt or payment and apply it to the requested lines.
    ///
    /// Writes in order: settlement row, financial effect, allocations. Run
    /// it inside a journal; a failure after the first write leaves the
    /// rollback to the journal.
    pub fn create_settlement(&self, request: &SettlementRequest) -> LedgerResult<SettlementOutcome> {
        self.validate(request)?;

        let mut settlement = self.store.create(&Settlement {
            id: 0,
            partner_type: request.partner_type,
            partner_code: request.partner_code.clone(),
            direction: request.direction,
            method: request.method.clone(),
            amount: request.amount,
            account_id: request.account_id,
            trans_date: self.ctx.today(),
            note: request.note.clone(),
        })?;

        let mut warnings = Vec::new();
        let posting = if request.method == PaymentMethod::StoreCredit {
            self.credit().consume(
                &request.partner_code,
                request.amount,
                SETTLEMENT_REF,
                settlement.id,
            )?;
            None
        } else {
            let target = AccountTarget::resolve(request.account_id, &request.method);
            let mut posting = PostingRequest::new(
                target,
                request.amount,
                request.direction.balance_direction(),
                request.direction.transaction_type(),
                settlement.id,
            )
            .reference_no(reference_no(settlement.id));
            posting.note = request.note.clone();
            let outcome = self.accounts().update_account_balance(&posting)?;
            if settlement.account_id.is_none() && outcome.posted() {
                settlement.account_id = outcome.account_id;
                self.store.save(&settlement)?;
            }
            warnings.extend(outcome.warnings.iter().cloned());
            Some(outcome)
        };

        let mut allocations = Vec::with_capacity(request.allocations.len());
        for allocation in &request.allocations {
            allocations.push(self.store.create(&SettlementAllocation {
                id: 0,
                settlement_id: settlement.id,
                partner_account_id: allocation.partner_account_id,
                amount: allocation.amount,
            })?);
            self.partners()
                .apply_allocation(allocation.partner_account_id, allocation.amount)?;
        }

        info!(
            settlement_id = settlement.id,
            direction = %settlement.direction,
            amount = %settlement.amount,
            lines = allocations.len(),
            "settlement recorded"
        );
        Ok(SettlementOutcome {
            settlement,
            allocations,
            posting,
            warnings,
        })
    }

    /// Fully reverse one settlement.
    pub fn void_settlement(&self, settlement_id: RowId) -> LedgerResult<SettlementReversal> {
        let settlement: Settlement = self.store.get(settlement_id)?;
        let allocations: Vec<SettlementAllocation> = self
            .store
            .fetch(&Query::all().eq("settlement_id", settlement_id))?;
        self.reverse_fully(&settlement, &allocations)
    }

    /// Unwind every settlement that paid any of `line_ids`.
    ///
    /// A settlement whose allocations all target these lines is deleted with
    /// its financial effect. One that also paid other lines keeps those:
    /// its amount shrinks and a refund row is appended for the removed part.
    pub fn reverse_for_lines(&self, line_ids: &[RowId]) -> LedgerResult<SettlementReversal> {
        let mut reversal = SettlementReversal::default();
        if line_ids.is_empty() {
            return Ok(reversal);
        }
        let affected: Vec<SettlementAllocation> = self.store.fetch(
            &Query::all().is_in("partner_account_id", line_ids.iter().copied()),
        )?;
        let settlement_ids: BTreeSet<RowId> = affected.iter().map(|a| a.settlement_id).collect();
        let targeted: BTreeSet<RowId> = line_ids.iter().copied().collect();

        for settlement_id in settlement_ids {
            let settlement: Settlement = self.store.get(settlement_id)?;
            let all: Vec<SettlementAllocation> = self
                .store
                .fetch(&Query::all().eq("settlement_id", settlement_id))?;
            let (removed, kept): (Vec<_>, Vec<_>) = all
                .into_iter()
                .partition(|a| targeted.contains(&a.partner_account_id));
            let step = if kept.is_empty() {
                self.reverse_fully(&settlement, &removed)?
            } else {
                self.reverse_partially(&settlement, &removed)?
            };
            reversal.merge(step);
        }
        Ok(reversal)
    }

    /// Give back `amount` that settlements paid into a line whose paid
    /// amount was already cut, newest allocation first.
    ///
    /// Each touched allocation is replaced by one for what it keeps, so every
    /// refund is keyed by the allocation it came from. Returns what was
    /// unwound and the part of `amount` no settlement had paid.
    pub fn refund_line_excess(
        &self,
        line_id: RowId,
        amount: Decimal,
    ) -> LedgerResult<(SettlementReversal, Decimal)> {
        let mut reversal = SettlementReversal::default();
        let mut left = amount;
        let allocations: Vec<SettlementAllocation> = self.store.fetch(
            &Query::all()
                .eq("partner_account_id", line_id)
                .newest_first(),
        )?;
        for allocation in allocations {
            if left <= Decimal::ZERO {
                break;
            }
            let take = left.min(allocation.amount);
            self.store.remove::<SettlementAllocation>(allocation.id)?;
            if take < allocation.amount {
                self.store.create(&SettlementAllocation {
                    id: 0,
                    amount: allocation.amount - take,
                    ..allocation.clone()
                })?;
            }
            left -= take;

            let settlement: Settlement = self.store.get(allocation.settlement_id)?;
            let step = if settlement.amount - take <= self.ctx.epsilon() {
                self.store.remove_where::<SettlementAllocation>(
                    &Query::all().eq("settlement_id", settlement.id),
                )?;
                self.undo_effect(&settlement)?;
                self.store.remove::<Settlement>(settlement.id)?;
                SettlementReversal {
                    deleted: vec![settlement.id],
                    released: take,
                    ..SettlementReversal::default()
                }
            } else {
                let mut step = SettlementReversal::default();
                self.refund(&settlement, &allocation, take, &mut step)?;
                self.shrink(&settlement, take, &mut step)?;
                step
            };
            reversal.merge(step);
        }
        debug!(line_id, %amount, unsettled = %left, "line excess refunded");
        Ok((reversal, left))
    }

    fn reverse_fully(
        &self,
        settlement: &Settlement,
        allocations: &[SettlementAllocation],
    ) -> LedgerResult<SettlementReversal> {
        let mut reversal = SettlementReversal::default();
        for allocation in allocations {
            self.partners()
                .release_allocation(allocation.partner_account_id, allocation.amount)?;
            reversal.released += allocation.amount;
        }
        self.store.remove_where::<SettlementAllocation>(
            &Query::all().eq("settlement_id", settlement.id),
        )?;
        self.undo_effect(settlement)?;
        self.store.remove::<Settlement>(settlement.id)?;
        debug!(settlement_id = settlement.id, "settlement reversed");
        reversal.deleted.push(settlement.id);
        Ok(reversal)
    }

    /// Take back the settlement's financial effect, refunds included.
    fn undo_effect(&self, settlement: &Settlement) -> LedgerResult<()> {
        if settlement.method == PaymentMethod::StoreCredit {
            let credit = self.credit();
            let mut logs = credit.logs(SETTLEMENT_REF, &[settlement.id])?;
            logs.extend(credit.logs(REFUND_REF, &[settlement.id])?);
            credit.revert(&logs)?;
        } else {
            let accounts = self.accounts();
            let mut rows =
                accounts.transactions(settlement.direction.transaction_type(), &[settlement.id])?;
            rows.extend(self.store.fetch(
                &Query::all()
                    .eq("ref_type", REFUND_REF)
                    .eq("ref_no", reference_no(settlement.id)),
            )?);
            accounts.reverse_transactions(&rows)?;
        }
        Ok(())
    }

    fn reverse_partially(
        &self,
        settlement: &Settlement,
        removed: &[SettlementAllocation],
    ) -> LedgerResult<SettlementReversal> {
        let mut reversal = SettlementReversal::default();
        let mut refunded = Decimal::ZERO;
        for allocation in removed {
            self.partners()
                .release_allocation(allocation.partner_account_id, allocation.amount)?;
            self.store.remove::<SettlementAllocation>(allocation.id)?;
            self.refund(settlement, allocation, allocation.amount, &mut reversal)?;
            refunded += allocation.amount;
        }
        self.shrink(settlement, refunded, &mut reversal)?;
        Ok(reversal)
    }

    /// Hand `amount` of one allocation back to the partner through the
    /// settlement's own method.
    fn refund(
        &self,
        settlement: &Settlement,
        allocation: &SettlementAllocation,
        amount: Decimal,
        reversal: &mut SettlementReversal,
    ) -> LedgerResult<()> {
        if settlement.method == PaymentMethod::StoreCredit {
            if let Some(customer) = self.credit().customer_by_code(&settlement.partner_code)? {
                self.credit().top_up(
                    customer.id,
                    amount,
                    REFUND_REF,
                    Some(settlement.id),
                    Some(format!("allocation {} removed", allocation.id)),
                )?;
            }
            return Ok(());
        }
        let target = AccountTarget::resolve(settlement.account_id, &settlement.method);
        let posting = PostingRequest::new(
            target,
            amount,
            settlement.direction.balance_direction().reversed(),
            TransactionType::SettlementRefund,
            allocation.id,
        )
        .reference_no(reference_no(settlement.id))
        .note(format!("allocation {} removed", allocation.id));
        let outcome = self.accounts().update_account_balance(&posting)?;
        if !outcome.posted() {
            let reason = outcome
                .warnings
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(settlement_id = settlement.id, %reason, "refund not posted");
            reversal.warnings.push(Warning::RefundNotPosted {
                settlement_id: settlement.id,
                reason,
            });
        }
        Ok(())
    }

    fn shrink(
        &self,
        settlement: &Settlement,
        refunded: Decimal,
        reversal: &mut SettlementReversal,
    ) -> LedgerResult<()> {
        let amount = settlement.amount - refunded;
        let mut shrunk = settlement.clone();
        shrunk.amount = amount;
        self.store.save(&shrunk)?;
        debug!(settlement_id = settlement.id, %refunded, %amount, "settlement shrunk");
        reversal.released += refunded;
        reversal.shrunk.push((settlement.id, amount));
        Ok(())
    }
}
