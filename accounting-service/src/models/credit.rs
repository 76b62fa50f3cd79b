//! Credit line and credit adjustment models.

use crate::error::AccountingError;
use crate::models::FeatureType;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What a credit adjustment was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditAdjustmentReason {
    Manual,
    DirectPayment,
    Invoice,
    LineItem,
    Transfer,
}

impl CreditAdjustmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditAdjustmentReason::Manual => "manual",
            CreditAdjustmentReason::DirectPayment => "direct_payment",
            CreditAdjustmentReason::Invoice => "invoice",
            CreditAdjustmentReason::LineItem => "line_item",
            CreditAdjustmentReason::Transfer => "transfer",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "direct_payment" => CreditAdjustmentReason::DirectPayment,
            "invoice" => CreditAdjustmentReason::Invoice,
            "line_item" => CreditAdjustmentReason::LineItem,
            "transfer" => CreditAdjustmentReason::Transfer,
            _ => CreditAdjustmentReason::Manual,
        }
    }
}

/// What a credit line can pay for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    General,
    Product,
    Feature(FeatureType),
}

/// Scope of a credit line: an account, optionally narrowed to one
/// subscription, and what it pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreditScope {
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub kind: CreditKind,
}

impl CreditScope {
    pub fn account(account_id: Uuid, kind: CreditKind) -> Self {
        Self {
            account_id,
            subscription_id: None,
            kind,
        }
    }

    pub fn subscription(account_id: Uuid, subscription_id: Uuid, kind: CreditKind) -> Self {
        Self {
            account_id,
            subscription_id: Some(subscription_id),
            kind,
        }
    }
}

/// Running credit balance for one scope.
///
/// `balance` always equals the sum of the line's adjustment amounts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditLine {
    pub credit_line_id: Uuid,
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub is_product: bool,
    pub feature_type: Option<String>,
    pub balance: Decimal,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub last_modified_utc: DateTime<Utc>,
}

impl CreditLine {
    /// Fresh zero-balance line for `scope`.
    pub fn new(scope: CreditScope) -> Self {
        let now = Utc::now();
        let (is_product, feature_type) = match scope.kind {
            CreditKind::General => (false, None),
            CreditKind::Product => (true, None),
            CreditKind::Feature(ft) => (false, Some(ft.as_str().to_string())),
        };
        Self {
            credit_line_id: Uuid::new_v4(),
            account_id: scope.account_id,
            subscription_id: scope.subscription_id,
            is_product,
            feature_type,
            balance: Decimal::ZERO,
            is_active: true,
            created_utc: now,
            last_modified_utc: now,
        }
    }

    pub fn kind(&self) -> CreditKind {
        if self.is_product {
            CreditKind::Product
        } else if let Some(ft) = self.feature_type.as_deref().and_then(FeatureType::parse) {
            CreditKind::Feature(ft)
        } else {
            CreditKind::General
        }
    }

    pub fn scope(&self) -> CreditScope {
        CreditScope {
            account_id: self.account_id,
            subscription_id: self.subscription_id,
            kind: self.kind(),
        }
    }

    pub fn is_general(&self) -> bool {
        self.kind() == CreditKind::General
    }
}

/// Append-only ledger entry against a credit line.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditAdjustment {
    pub adjustment_id: Uuid,
    pub credit_line_id: Uuid,
    pub reason: String,
    pub amount: Decimal,
    pub note: Option<String>,
    pub line_item_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub related_credit_line_id: Option<Uuid>,
    pub web_user: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl CreditAdjustment {
    pub fn parsed_reason(&self) -> CreditAdjustmentReason {
        CreditAdjustmentReason::from_string(&self.reason)
    }

    /// Reject adjustments triggered by both a line item and an invoice.
    pub fn clean(&self) -> Result<(), AccountingError> {
        if self.line_item_id.is_some() && self.invoice_id.is_some() {
            return Err(AccountingError::Validation(
                "You can't specify both an invoice and a line item.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input describing one credit movement.
#[derive(Debug, Clone)]
pub struct CreditAdjustmentInput {
    pub amount: Decimal,
    pub reason: CreditAdjustmentReason,
    pub note: Option<String>,
    pub line_item_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub related_credit_line_id: Option<Uuid>,
    pub web_user: Option<String>,
}

impl CreditAdjustmentInput {
    pub fn new(amount: Decimal, reason: CreditAdjustmentReason) -> Self {
        Self {
            amount,
            reason,
            note: None,
            line_item_id: None,
            invoice_id: None,
            related_credit_line_id: None,
            web_user: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn into_adjustment(self, credit_line_id: Uuid) -> CreditAdjustment {
        CreditAdjustment {
            adjustment_id: Uuid::new_v4(),
            credit_line_id,
            reason: self.reason.as_str().to_string(),
            amount: self.amount,
            note: self.note,
            line_item_id: self.line_item_id,
            invoice_id: self.invoice_id,
            related_credit_line_id: self.related_credit_line_id,
            web_user: self.web_user,
            created_utc: Utc::now(),
        }
    }
}

/// One adjustment plus the line it applies to. `line` carries the balance
/// the planner saw before the adjustment; `is_new` lines are inserted first.
#[derive(Debug, Clone)]
pub struct CreditPosting {
    pub line: CreditLine,
    pub is_new: bool,
    pub adjustment: CreditAdjustment,
}

/// Filter parameters for listing credit lines.
#[derive(Debug, Clone, Default)]
pub struct ListCreditLinesFilter {
    pub account_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    /// Only lines with no subscription (account scope).
    pub account_scope_only: bool,
    pub active_only: bool,
}

/// Balance drift found by the consistency check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditLineDiscrepancy {
    pub credit_line_id: Uuid,
    pub balance: Decimal,
    pub expected_balance: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_rejects_line_item_and_invoice_together() {
        let mut input = CreditAdjustmentInput::new(Decimal::ONE, CreditAdjustmentReason::Manual);
        input.line_item_id = Some(Uuid::new_v4());
        input.invoice_id = Some(Uuid::new_v4());
        let adjustment = input.into_adjustment(Uuid::new_v4());
        assert!(matches!(
            adjustment.clean(),
            Err(AccountingError::Validation(_))
        ));
    }

    #[test]
    fn clean_accepts_a_single_trigger() {
        let mut input = CreditAdjustmentInput::new(Decimal::ONE, CreditAdjustmentReason::Invoice);
        input.invoice_id = Some(Uuid::new_v4());
        assert!(input.into_adjustment(Uuid::new_v4()).clean().is_ok());
    }

    #[test]
    fn kind_round_trips_through_columns() {
        let account_id = Uuid::new_v4();
        let line = CreditLine::new(CreditScope::account(
            account_id,
            CreditKind::Feature(FeatureType::Sms),
        ));
        assert_eq!(line.kind(), CreditKind::Feature(FeatureType::Sms));
        assert!(!line.is_general());
        assert_eq!(line.scope().account_id, account_id);
    }
}
