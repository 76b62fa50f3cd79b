//! Overdue invoice escalation.
//!
//! Runs daily. A domain whose unpaid product invoices reach the threshold
//! is warned 30 and 58 days after the oldest qualifying due date and moved
//! to community on day 61.

use crate::catalog::PlanCatalog;
use crate::config::BillingSettings;
use crate::error::{AccountingError, Result};
use crate::models::{
    Invoice, ListInvoicesFilter, SubscriptionAdjustmentMethod, SubscriptionType,
};
use crate::notifications::{Notice, NoticeKind, Notifier};
use crate::services::{record_error, AccountingStore};
use crate::subscriptions::{ChangeContext, SubscriptionManager};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const DOWNGRADE_NOTE: &str = "Automatic downgrade to community for invoice 60 days late";

const OVERDUE_NOTICE_DAYS: i64 = 30;
const DOWNGRADE_WARNING_DAYS: i64 = 58;
const DOWNGRADE_DAYS: i64 = 61;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DowngradeRunSummary {
    pub overdue_notices: usize,
    pub downgrade_warnings: usize,
    pub downgrades: usize,
    pub failures: usize,
}

/// Oldest unpaid invoice whose running total crossed the threshold.
#[derive(Debug, Clone)]
pub struct OverdueInvoice {
    pub invoice: Invoice,
    pub total: Decimal,
}

#[derive(Clone)]
pub struct DowngradeProcess {
    store: Arc<dyn AccountingStore>,
    catalog: PlanCatalog,
    subscriptions: SubscriptionManager,
    notifier: Arc<dyn Notifier>,
    settings: BillingSettings,
}

fn unpaid_product_invoices() -> ListInvoicesFilter {
    ListInvoicesFilter {
        is_hidden: Some(false),
        service_type: Some(SubscriptionType::Product),
        unpaid_only: true,
        ..Default::default()
    }
}

impl DowngradeProcess {
    pub fn new(
        store: Arc<dyn AccountingStore>,
        catalog: PlanCatalog,
        subscriptions: SubscriptionManager,
        notifier: Arc<dyn Notifier>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            subscriptions,
            notifier,
            settings,
        }
    }

    fn in_downgrade_range(today: NaiveDate) -> ListInvoicesFilter {
        ListInvoicesFilter {
            due_on_or_after: Some(today - Duration::days(DOWNGRADE_DAYS)),
            due_on_or_before: Some(today - Duration::days(1)),
            ..unpaid_product_invoices()
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, today: NaiveDate) -> Result<DowngradeRunSummary> {
        let mut subscriber_ids: Vec<Uuid> = Vec::new();
        for invoice in self
            .store
            .list_invoices(&Self::in_downgrade_range(today))
            .await?
        {
            let Some(subscription) = self.store.get_subscription(invoice.subscription_id).await?
            else {
                continue;
            };
            if !subscriber_ids.contains(&subscription.subscriber_id) {
                subscriber_ids.push(subscription.subscriber_id);
            }
        }

        let mut summary = DowngradeRunSummary::default();
        for subscriber_id in subscriber_ids {
            if let Err(e) = self.process_subscriber(subscriber_id, today, &mut summary).await {
                summary.failures += 1;
                record_error(e.kind(), "downgrade_process");
                error!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Error applying downgrade process"
                );
            }
        }

        info!(
            overdue_notices = summary.overdue_notices,
            downgrade_warnings = summary.downgrade_warnings,
            downgrades = summary.downgrades,
            failures = summary.failures,
            "Downgrade process finished"
        );
        Ok(summary)
    }

    /// First invoice in the downgrade window at which the subscriber's
    /// unpaid total reaches the threshold. The total counts every unpaid
    /// invoice due no later than it, plus undated ones ending no later.
    pub async fn unpaid_invoice_over_threshold(
        &self,
        subscriber_id: Uuid,
        today: NaiveDate,
    ) -> Result<Option<OverdueInvoice>> {
        let candidates = self
            .store
            .list_invoices(&ListInvoicesFilter {
                subscriber_id: Some(subscriber_id),
                ..Self::in_downgrade_range(today)
            })
            .await?;
        let unpaid = self
            .store
            .list_invoices(&ListInvoicesFilter {
                subscriber_id: Some(subscriber_id),
                ..unpaid_product_invoices()
            })
            .await?;

        for candidate in candidates {
            let Some(due) = candidate.date_due else {
                continue;
            };
            let total: Decimal = unpaid
                .iter()
                .filter(|i| match i.date_due {
                    Some(date_due) => date_due <= due,
                    None => i.date_end <= candidate.date_end,
                })
                .map(|i| i.balance)
                .sum();
            if total >= self.settings.unpaid_invoice_threshold {
                return Ok(Some(OverdueInvoice {
                    invoice: candidate,
                    total,
                }));
            }
        }
        Ok(None)
    }

    async fn process_subscriber(
        &self,
        subscriber_id: Uuid,
        today: NaiveDate,
        summary: &mut DowngradeRunSummary,
    ) -> Result<()> {
        let Some(overdue) = self.unpaid_invoice_over_threshold(subscriber_id, today).await? else {
            return Ok(());
        };
        let subscriber = self
            .store
            .get_subscriber(subscriber_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("subscriber", subscriber_id))?;

        let Some(current) = self
            .subscriptions
            .active_subscription_for_domain(&subscriber.domain)
            .await?
        else {
            warn!(domain = %subscriber.domain, "Overdue domain has no active subscription");
            return Ok(());
        };
        let version = self.catalog.get_version(current.plan_version_id).await?;
        if version.is_community() || current.skip_auto_downgrade {
            return Ok(());
        }

        let Some(date_due) = overdue.invoice.date_due else {
            return Ok(());
        };
        let days_ago = (today - date_due).num_days();
        let kind = match days_ago {
            DOWNGRADE_DAYS => {
                let community = self.catalog.community_plan_version().await?;
                self.subscriptions
                    .change_plan(
                        current.subscription_id,
                        community.version_id(),
                        None,
                        ChangeContext::new(SubscriptionAdjustmentMethod::AutomaticDowngrade)
                            .with_note(DOWNGRADE_NOTE),
                        today,
                    )
                    .await?;
                info!(
                    domain = %subscriber.domain,
                    invoice_id = %overdue.invoice.invoice_id,
                    "Domain downgraded to community for unpaid invoices"
                );
                summary.downgrades += 1;
                NoticeKind::Downgraded
            }
            DOWNGRADE_WARNING_DAYS => {
                summary.downgrade_warnings += 1;
                NoticeKind::DowngradeWarning
            }
            OVERDUE_NOTICE_DAYS => {
                summary.overdue_notices += 1;
                NoticeKind::OverdueInvoice
            }
            _ => return Ok(()),
        };

        let account = self.subscriptions.get_account(current.account_id).await?;
        let mut notice = Notice::new(
            kind,
            &subscriber.domain,
            account.account_id,
            account.contact_emails.clone(),
        );
        notice.invoice_id = Some(overdue.invoice.invoice_id);
        notice.subscription_id = Some(current.subscription_id);
        notice.amount = Some(overdue.total);
        notice.date = Some(date_due + Duration::days(60));
        notice.days = Some(days_ago);
        if let Err(e) = self.notifier.send(&notice).await {
            error!(domain = %subscriber.domain, kind = %kind, error = %e, "Failed to send downgrade notice");
        }
        Ok(())
    }
}
