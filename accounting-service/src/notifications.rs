//! Outbound billing notices.
//!
//! The engine only decides that a notice is due. Rendering and delivery
//! belong to whatever implements [`Notifier`].

use crate::error::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    InvoiceCreated,
    OverdueInvoice,
    DowngradeWarning,
    Downgraded,
    SubscriptionEnding,
}

impl std::fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoticeKind::InvoiceCreated => write!(f, "invoice_created"),
            NoticeKind::OverdueInvoice => write!(f, "overdue_invoice"),
            NoticeKind::DowngradeWarning => write!(f, "downgrade_warning"),
            NoticeKind::Downgraded => write!(f, "downgraded"),
            NoticeKind::SubscriptionEnding => write!(f, "subscription_ending"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub domain: String,
    pub account_id: Uuid,
    pub recipients: Vec<String>,
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    /// Due date for invoice notices, end date for ending reminders.
    pub date: Option<NaiveDate>,
    pub days: Option<i64>,
}

impl Notice {
    pub fn new(kind: NoticeKind, domain: &str, account_id: Uuid, recipients: Vec<String>) -> Self {
        Self {
            kind,
            domain: domain.to_string(),
            account_id,
            recipients,
            invoice_id: None,
            subscription_id: None,
            amount: None,
            date: None,
            days: None,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: &Notice) -> Result<()>;
}

/// Writes each notice to the log and nothing else.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, notice: &Notice) -> Result<()> {
        tracing::info!(
            kind = %notice.kind,
            domain = %notice.domain,
            account_id = %notice.account_id,
            recipients = notice.recipients.len(),
            invoice_id = ?notice.invoice_id,
            amount = ?notice.amount,
            "Billing notice"
        );
        Ok(())
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_of(&self, kind: NoticeKind) -> Vec<Notice> {
        self.sent()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &Notice) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notice.clone());
        }
        Ok(())
    }
}
