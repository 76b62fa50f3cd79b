//! Credit ledger.
//!
//! Credit lines are only ever changed by appending adjustments. Callers
//! stage adjustments on a [`CreditPlanner`] and hand the resulting postings
//! to the store in one call, which re-checks every balance while applying.

use crate::error::{AccountingError, Result};
use crate::models::{
    CreditAdjustment, CreditAdjustmentInput, CreditAdjustmentReason, CreditKind, CreditLine,
    CreditLineDiscrepancy, CreditPosting, CreditScope, FeatureType, LineItem,
    ListCreditLinesFilter, Subscription,
};
use crate::services::{record_credit_adjustment, AccountingStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

struct PlannedLine {
    line: CreditLine,
    is_new: bool,
    balance: Decimal,
}

/// Working set of credit lines with pending adjustments applied on top of
/// their stored balances.
pub struct CreditPlanner {
    lines: Vec<PlannedLine>,
    postings: Vec<CreditPosting>,
}

impl CreditPlanner {
    pub fn new(existing: Vec<CreditLine>) -> Self {
        let lines = existing
            .into_iter()
            .map(|line| PlannedLine {
                balance: line.balance,
                line,
                is_new: false,
            })
            .collect();
        Self {
            lines,
            postings: Vec::new(),
        }
    }

    /// Load every active line of `account_id`.
    pub async fn for_account(store: &dyn AccountingStore, account_id: Uuid) -> Result<Self> {
        let lines = store
            .list_credit_lines(&ListCreditLinesFilter {
                account_id: Some(account_id),
                active_only: true,
                ..Default::default()
            })
            .await?;
        Ok(Self::new(lines))
    }

    fn position(&self, scope: &CreditScope) -> Option<usize> {
        self.lines
            .iter()
            .position(|p| p.line.is_active && p.line.scope() == *scope)
    }

    fn position_or_create(&mut self, scope: CreditScope) -> usize {
        match self.position(&scope) {
            Some(index) => index,
            None => {
                self.lines.push(PlannedLine {
                    line: CreditLine::new(scope),
                    is_new: true,
                    balance: Decimal::ZERO,
                });
                self.lines.len() - 1
            }
        }
    }

    fn post(&mut self, index: usize, input: CreditAdjustmentInput) -> Result<CreditAdjustment> {
        let planned = &mut self.lines[index];
        let adjustment = input.into_adjustment(planned.line.credit_line_id);
        adjustment.clean()?;

        let next = planned.balance + adjustment.amount;
        if adjustment.amount < Decimal::ZERO && next < Decimal::ZERO {
            return Err(AccountingError::CreditLine(format!(
                "credit line {} has {} available, cannot apply {}",
                planned.line.credit_line_id, planned.balance, adjustment.amount
            )));
        }
        planned.balance = next;

        self.postings.push(CreditPosting {
            line: planned.line.clone(),
            is_new: planned.is_new,
            adjustment: adjustment.clone(),
        });
        Ok(adjustment)
    }

    /// Pending balance of the line for `scope`, zero when there is none.
    pub fn balance(&self, scope: &CreditScope) -> Decimal {
        self.position(scope)
            .map(|index| self.lines[index].balance)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn line_for(&self, scope: &CreditScope) -> Option<&CreditLine> {
        self.position(scope).map(|index| &self.lines[index].line)
    }

    /// Add to the line for `scope`, creating the line first when needed.
    pub fn add(&mut self, scope: CreditScope, input: CreditAdjustmentInput) -> Result<CreditAdjustment> {
        let index = self.position_or_create(scope);
        self.post(index, input)
    }

    /// Adjust an existing line.
    pub fn adjust(
        &mut self,
        credit_line_id: Uuid,
        input: CreditAdjustmentInput,
    ) -> Result<CreditAdjustment> {
        let index = self
            .lines
            .iter()
            .position(|p| p.line.credit_line_id == credit_line_id)
            .ok_or_else(|| AccountingError::not_found("credit line", credit_line_id))?;
        self.post(index, input)
    }

    /// Draw up to `amount_due` from the lines for `scopes`, in order. Each
    /// draw is a negative adjustment built by `make_input`. Returns the
    /// total drawn.
    pub fn apply(
        &mut self,
        scopes: &[CreditScope],
        amount_due: Decimal,
        make_input: impl Fn(Decimal) -> CreditAdjustmentInput,
    ) -> Result<Decimal> {
        let mut remaining = amount_due;
        for scope in scopes {
            if remaining <= Decimal::ZERO {
                break;
            }
            let Some(index) = self.position(scope) else {
                continue;
            };
            let available = self.lines[index].balance;
            if available <= Decimal::ZERO {
                continue;
            }
            let amount = available.min(remaining);
            self.post(index, make_input(-amount))?;
            remaining -= amount;
        }
        Ok(amount_due - remaining.max(Decimal::ZERO))
    }

    /// Move every non-zero line of `from` to the matching scope of `to`, or
    /// to account scope when there is no successor on the same account.
    pub fn transfer_subscription_credits(
        &mut self,
        from: &Subscription,
        to: Option<&Subscription>,
        web_user: Option<&str>,
    ) -> Result<()> {
        let to = to.filter(|t| t.account_id == from.account_id);
        let sources: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.line.subscription_id == Some(from.subscription_id)
                    && p.line.is_active
                    && p.balance != Decimal::ZERO
            })
            .map(|(index, _)| index)
            .collect();

        for source in sources {
            let amount = self.lines[source].balance;
            let source_line_id = self.lines[source].line.credit_line_id;
            let kind = self.lines[source].line.kind();
            let target_scope = match to {
                Some(successor) => {
                    CreditScope::subscription(from.account_id, successor.subscription_id, kind)
                }
                None => CreditScope::account(from.account_id, kind),
            };
            let target = self.position_or_create(target_scope);
            let target_line_id = self.lines[target].line.credit_line_id;

            let mut debit = CreditAdjustmentInput::new(-amount, CreditAdjustmentReason::Transfer);
            debit.related_credit_line_id = Some(target_line_id);
            debit.web_user = web_user.map(str::to_string);
            self.post(source, debit)?;

            let mut credit = CreditAdjustmentInput::new(amount, CreditAdjustmentReason::Transfer);
            credit.related_credit_line_id = Some(source_line_id);
            credit.web_user = web_user.map(str::to_string);
            self.post(target, credit)?;
        }
        Ok(())
    }

    pub fn has_postings(&self) -> bool {
        !self.postings.is_empty()
    }

    pub fn into_postings(self) -> Vec<CreditPosting> {
        self.postings
    }
}

/// Request to add credit to one scope.
#[derive(Debug, Clone)]
pub struct AddCredit {
    pub amount: Decimal,
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub kind: CreditKind,
    pub reason: CreditAdjustmentReason,
    pub note: Option<String>,
    pub web_user: Option<String>,
    pub permit_inactive: bool,
}

impl AddCredit {
    pub fn new(amount: Decimal, account_id: Uuid, kind: CreditKind) -> Self {
        Self {
            amount,
            account_id,
            subscription_id: None,
            kind,
            reason: CreditAdjustmentReason::Manual,
            note: None,
            web_user: None,
            permit_inactive: false,
        }
    }

    pub fn for_subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn AccountingStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AccountingStore>) -> Self {
        Self { store }
    }

    /// Commit staged postings and count them.
    pub async fn commit(&self, planner: CreditPlanner) -> Result<Vec<CreditPosting>> {
        let postings = planner.into_postings();
        if postings.is_empty() {
            return Ok(postings);
        }
        self.store.post_credit_adjustments(&postings).await?;
        for posting in &postings {
            record_credit_adjustment(&posting.adjustment.reason);
        }
        Ok(postings)
    }

    #[instrument(skip(self, request), fields(account_id = %request.account_id, amount = %request.amount))]
    pub async fn add_credit(&self, request: AddCredit) -> Result<CreditAdjustment> {
        self.store
            .get_account(request.account_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("billing account", request.account_id))?;

        let scope = match request.subscription_id {
            Some(subscription_id) => {
                let subscription = self
                    .store
                    .get_subscription(subscription_id)
                    .await?
                    .ok_or_else(|| AccountingError::not_found("subscription", subscription_id))?;
                if subscription.account_id != request.account_id {
                    return Err(AccountingError::CreditLine(format!(
                        "subscription {} does not belong to account {}",
                        subscription_id, request.account_id
                    )));
                }
                if !subscription.is_active && !request.permit_inactive {
                    return Err(AccountingError::CreditLine(format!(
                        "cannot add credit to inactive subscription {}",
                        subscription_id
                    )));
                }
                CreditScope::subscription(request.account_id, subscription_id, request.kind)
            }
            None => CreditScope::account(request.account_id, request.kind),
        };

        let mut planner = CreditPlanner::for_account(self.store.as_ref(), request.account_id).await?;
        let mut input = CreditAdjustmentInput::new(request.amount, request.reason);
        input.note = request.note;
        input.web_user = request.web_user;
        let adjustment = planner.add(scope, input)?;
        self.commit(planner).await?;

        info!(
            credit_line_id = %adjustment.credit_line_id,
            reason = %adjustment.reason,
            "Credit added"
        );
        Ok(adjustment)
    }

    /// Append an adjustment to an existing line. A result below zero is
    /// rejected.
    #[instrument(skip(self, input), fields(amount = %input.amount))]
    pub async fn adjust_credit_balance(
        &self,
        credit_line_id: Uuid,
        input: CreditAdjustmentInput,
    ) -> Result<CreditAdjustment> {
        let line = self.get_credit_line(credit_line_id).await?;
        let mut planner = CreditPlanner::new(vec![line]);
        let adjustment = planner.adjust(credit_line_id, input)?;
        self.commit(planner).await?;
        Ok(adjustment)
    }

    pub async fn get_credit_line(&self, credit_line_id: Uuid) -> Result<CreditLine> {
        self.store
            .get_credit_line(credit_line_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("credit line", credit_line_id))
    }

    pub async fn list_adjustments(&self, credit_line_id: Uuid) -> Result<Vec<CreditAdjustment>> {
        self.store.list_credit_adjustments(credit_line_id).await
    }

    /// Active non-general lines scoped to `subscription`. A feature type
    /// narrows to that feature; `is_product` narrows to product lines.
    pub async fn get_credits_by_subscription_and_features(
        &self,
        subscription: &Subscription,
        feature_type: Option<FeatureType>,
        is_product: bool,
    ) -> Result<Vec<CreditLine>> {
        let lines = self
            .store
            .list_credit_lines(&ListCreditLinesFilter {
                subscription_id: Some(subscription.subscription_id),
                active_only: true,
                ..Default::default()
            })
            .await?;
        Ok(lines
            .into_iter()
            .filter(|line| match (feature_type, is_product) {
                (Some(ft), _) => line.kind() == CreditKind::Feature(ft),
                (None, true) => line.kind() == CreditKind::Product,
                (None, false) => !line.is_general(),
            })
            .collect())
    }

    /// Lines that pay for a charge of `kind`, subscription scope first.
    pub async fn get_credits_for_kind(
        &self,
        subscription: &Subscription,
        kind: CreditKind,
    ) -> Result<Vec<CreditLine>> {
        let planner = CreditPlanner::for_account(self.store.as_ref(), subscription.account_id).await?;
        Ok(application_order(subscription, kind)
            .iter()
            .filter_map(|scope| planner.line_for(scope).cloned())
            .collect())
    }

    /// Lines that can pay for `line_item`. Empty when the item has no
    /// creditable kind.
    pub async fn get_credits_for_line_item(
        &self,
        subscription: &Subscription,
        line_item: &LineItem,
    ) -> Result<Vec<CreditLine>> {
        match line_item.credit_kind() {
            Some(kind) => self.get_credits_for_kind(subscription, kind).await,
            None => Ok(Vec::new()),
        }
    }

    /// General lines that pay down an invoice balance.
    pub async fn get_credits_for_invoice(&self, subscription: &Subscription) -> Result<Vec<CreditLine>> {
        self.get_credits_for_kind(subscription, CreditKind::General).await
    }

    /// Move the credit of `from` to `to`, or to account scope.
    #[instrument(skip(self, from, to), fields(from = %from.subscription_id))]
    pub async fn transfer_credits(
        &self,
        from: &Subscription,
        to: Option<&Subscription>,
    ) -> Result<()> {
        let mut planner = CreditPlanner::for_account(self.store.as_ref(), from.account_id).await?;
        planner.transfer_subscription_credits(from, to, None)?;
        self.commit(planner).await?;
        Ok(())
    }

    /// Compare every line's balance with the sum of its adjustments.
    #[instrument(skip(self))]
    pub async fn check_credit_line_balances(&self) -> Result<Vec<CreditLineDiscrepancy>> {
        let lines = self
            .store
            .list_credit_lines(&ListCreditLinesFilter::default())
            .await?;
        let mut discrepancies = Vec::new();
        for line in lines {
            let expected_balance: Decimal = self
                .store
                .list_credit_adjustments(line.credit_line_id)
                .await?
                .iter()
                .map(|a| a.amount)
                .sum();
            if expected_balance != line.balance {
                error!(
                    credit_line_id = %line.credit_line_id,
                    balance = %line.balance,
                    expected_balance = %expected_balance,
                    "Credit line balance does not match its adjustments"
                );
                discrepancies.push(CreditLineDiscrepancy {
                    credit_line_id: line.credit_line_id,
                    balance: line.balance,
                    expected_balance,
                });
            }
        }
        Ok(discrepancies)
    }
}

/// Scopes searched for credit against a charge of `kind`.
pub fn application_order(subscription: &Subscription, kind: CreditKind) -> [CreditScope; 2] {
    [
        CreditScope::subscription(subscription.account_id, subscription.subscription_id, kind),
        CreditScope::account(subscription.account_id, kind),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funded(scope: CreditScope, balance: Decimal) -> CreditLine {
        let mut line = CreditLine::new(scope);
        line.balance = balance;
        line
    }

    #[test]
    fn apply_draws_subscription_scope_before_account_scope() {
        let account_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();
        let sub_scope = CreditScope::subscription(account_id, subscription_id, CreditKind::Product);
        let account_scope = CreditScope::account(account_id, CreditKind::Product);
        let mut planner = CreditPlanner::new(vec![
            funded(account_scope, dec!(50)),
            funded(sub_scope, dec!(20)),
        ]);

        let applied = planner
            .apply(&[sub_scope, account_scope], dec!(30), |amount| {
                CreditAdjustmentInput::new(amount, CreditAdjustmentReason::LineItem)
            })
            .unwrap();

        assert_eq!(applied, dec!(30));
        assert_eq!(planner.balance(&sub_scope), dec!(0));
        assert_eq!(planner.balance(&account_scope), dec!(40));
        let postings = planner.into_postings();
        assert_eq!(postings.len(), 2);
        assert!(postings.iter().all(|p| p.adjustment.amount < Decimal::ZERO));
    }

    #[test]
    fn adjust_rejects_negative_result() {
        let line = funded(
            CreditScope::account(Uuid::new_v4(), CreditKind::General),
            dec!(5),
        );
        let id = line.credit_line_id;
        let mut planner = CreditPlanner::new(vec![line]);
        let result = planner.adjust(
            id,
            CreditAdjustmentInput::new(dec!(-6), CreditAdjustmentReason::Manual),
        );
        assert!(matches!(result, Err(AccountingError::CreditLine(_))));
        assert!(!planner.has_postings());
    }
}
