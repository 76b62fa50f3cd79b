//! Invoice and line item models.

use crate::models::{CreditKind, CreditPosting, FeatureType, SubscriptionAdjustment, SubscriptionType};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice for one subscription over one period.
///
/// `balance = subtotal + applied_tax - applied_credit`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub subscription_id: Uuid,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub date_due: Option<NaiveDate>,
    pub date_paid: Option<NaiveDate>,
    pub tax_rate: Decimal,
    pub subtotal: Decimal,
    pub applied_tax: Decimal,
    pub applied_credit: Decimal,
    pub balance: Decimal,
    pub is_hidden: bool,
    pub created_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn is_paid(&self) -> bool {
        self.date_paid.is_some()
    }

    /// Recompute `balance` from the stored components.
    pub fn recompute_balance(&mut self) {
        self.balance = self.subtotal + self.applied_tax - self.applied_credit;
    }
}

/// One charge on an invoice.
///
/// Exactly one of `product_rate_id` and `feature_rate_id` is set.
/// `applied_credit` is the positive amount of credit consumed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub product_rate_id: Option<Uuid>,
    pub feature_rate_id: Option<Uuid>,
    pub feature_type: Option<String>,
    pub base_description: Option<String>,
    pub base_cost: Decimal,
    pub unit_description: Option<String>,
    pub unit_cost: Decimal,
    pub quantity: i32,
    pub applied_credit: Decimal,
}

impl LineItem {
    pub fn subtotal(&self) -> Decimal {
        self.base_cost + self.unit_cost * Decimal::from(self.quantity)
    }

    pub fn total(&self) -> Decimal {
        self.subtotal() - self.applied_credit
    }

    pub fn is_product(&self) -> bool {
        self.product_rate_id.is_some()
    }

    /// Credit kind that can pay for this line, if any.
    pub fn credit_kind(&self) -> Option<CreditKind> {
        if self.is_product() {
            return Some(CreditKind::Product);
        }
        self.feature_type
            .as_deref()
            .and_then(FeatureType::parse)
            .map(CreditKind::Feature)
    }
}

/// Everything an invoice run writes for one subscription, committed in one
/// transaction.
#[derive(Debug, Clone)]
pub struct InvoiceDraft {
    pub invoice: Invoice,
    pub line_items: Vec<LineItem>,
    pub credit_postings: Vec<CreditPosting>,
    pub subscription_adjustments: Vec<SubscriptionAdjustment>,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub subscription_id: Option<Uuid>,
    pub subscriber_id: Option<Uuid>,
    pub is_hidden: Option<bool>,
    pub service_type: Option<SubscriptionType>,
    pub unpaid_only: bool,
    pub due_on_or_after: Option<NaiveDate>,
    pub due_on_or_before: Option<NaiveDate>,
}

/// Outcome of a batch invoicing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRunSummary {
    pub invoices_created: usize,
    pub domains_skipped: usize,
    pub domains_failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(base_cost: Decimal, unit_cost: Decimal, quantity: i32) -> LineItem {
        LineItem {
            line_item_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            product_rate_id: None,
            feature_rate_id: Some(Uuid::new_v4()),
            feature_type: Some("user".to_string()),
            base_description: None,
            base_cost,
            unit_description: None,
            unit_cost,
            quantity,
            applied_credit: Decimal::ZERO,
        }
    }

    #[test]
    fn subtotal_combines_base_and_unit_cost() {
        let mut item = line(dec!(10.00), dec!(2.50), 4);
        assert_eq!(item.subtotal(), dec!(20.00));
        item.applied_credit = dec!(5.00);
        assert_eq!(item.total(), dec!(15.00));
    }
}
