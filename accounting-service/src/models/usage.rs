//! Usage inputs read by the invoicing run.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One billable SMS. Multipart messages are billed per part.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmsBillable {
    pub billable_id: Uuid,
    pub domain: String,
    pub date_sent: DateTime<Utc>,
    pub multipart_count: i32,
    pub gateway_charge: Decimal,
    pub usage_charge: Decimal,
    pub is_valid: bool,
}

impl SmsBillable {
    pub fn total_charge(&self) -> Decimal {
        self.gateway_charge + self.usage_charge
    }
}
