//! Domain errors for accounting-service.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised while building or committing an invoice.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("invoice already created: invoice id {invoice_id}")]
    AlreadyCreated { invoice_id: Uuid },

    #[error("domain '{0}' has no subscriber record")]
    InvalidDomain(String),

    #[error("invalid invoice period: {start} is after {end}")]
    InvalidPeriod {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("invoice {0} is already paid")]
    AlreadyPaid(Uuid),
}

#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invoice error: {0}")]
    Invoice(#[from] InvoiceError),

    #[error("Line item error: {0}")]
    LineItem(String),

    #[error("Credit line error: {0}")]
    CreditLine(String),

    #[error("New subscription error: {0}")]
    NewSubscription(String),

    #[error("Subscription change error: {0}")]
    SubscriptionChange(String),

    #[error("Subscription renewal error: {0}")]
    SubscriptionRenewal(String),

    #[error("Plan catalog error: {0}")]
    Catalog(String),

    #[error(transparent)]
    App(#[from] AppError),
}

impl AccountingError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        AccountingError::NotFound(format!("{} {}", what, id))
    }

    pub fn database(context: &str, err: sqlx::Error) -> Self {
        AccountingError::App(AppError::DatabaseError(anyhow::anyhow!(
            "{}: {}",
            context,
            err
        )))
    }

    /// Short label used for the `errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AccountingError::Validation(_) => "validation",
            AccountingError::NotFound(_) => "not_found",
            AccountingError::Invoice(_) => "invoice",
            AccountingError::LineItem(_) => "line_item",
            AccountingError::CreditLine(_) => "credit_line",
            AccountingError::NewSubscription(_) => "new_subscription",
            AccountingError::SubscriptionChange(_) => "subscription_change",
            AccountingError::SubscriptionRenewal(_) => "subscription_renewal",
            AccountingError::Catalog(_) => "catalog",
            AccountingError::App(AppError::DatabaseError(_)) => "db_error",
            AccountingError::App(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AccountingError>;
