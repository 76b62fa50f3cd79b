//! Billing account and subscriber models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The paying entity behind one or more subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingAccount {
    pub account_id: Uuid,
    pub name: String,
    pub currency: String,
    pub created_by: String,
    pub created_by_domain: Option<String>,
    pub is_active: bool,
    pub auto_pay_enabled: bool,
    pub date_confirmed_extra_charges: Option<NaiveDate>,
    pub tax_rate: Decimal,
    pub contact_emails: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

/// The tenant being billed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscriber {
    pub subscriber_id: Uuid,
    pub domain: String,
    pub created_utc: DateTime<Utc>,
}

/// Input for creating a billing account.
#[derive(Debug, Clone)]
pub struct CreateBillingAccount {
    pub name: String,
    pub currency: String,
    pub created_by: String,
    pub created_by_domain: Option<String>,
    pub auto_pay_enabled: bool,
    pub date_confirmed_extra_charges: Option<NaiveDate>,
    pub tax_rate: Decimal,
    pub contact_emails: Vec<String>,
}

impl CreateBillingAccount {
    /// Self-started account for a domain with no billing relationship yet.
    pub fn for_domain(domain: &str, created_by: &str) -> Self {
        Self {
            name: format!("Account for Project {}", domain),
            currency: "USD".to_string(),
            created_by: created_by.to_string(),
            created_by_domain: Some(domain.to_string()),
            auto_pay_enabled: false,
            date_confirmed_extra_charges: None,
            tax_rate: Decimal::ZERO,
            contact_emails: Vec::new(),
        }
    }
}
