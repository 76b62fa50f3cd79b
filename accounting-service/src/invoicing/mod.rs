//! Invoice generation.
//!
//! One invoice per (subscription, period). The invoice, its line items, the
//! credit drawn against them and any audit row are committed together.

pub mod line_items;

pub use line_items::{days_in_month, round2, BillingPeriod};

use crate::catalog::PlanCatalog;
use crate::config::BillingSettings;
use crate::credits::{application_order, CreditPlanner};
use crate::error::{AccountingError, InvoiceError, Result};
use crate::models::{
    CreditAdjustmentInput, CreditAdjustmentReason, CreditKind, CreditScope, FeatureType, Invoice,
    InvoiceDraft, InvoiceRunSummary, LineItem, ListInvoicesFilter, ListSubscriptionsFilter,
    PlanVersionDetail, Subscriber, Subscription, SubscriptionAdjustment,
    SubscriptionAdjustmentMethod, SubscriptionAdjustmentReason, SubscriptionType,
};
use crate::notifications::{Notice, NoticeKind, Notifier};
use crate::services::{
    record_credit_adjustment, record_error, record_invoice_created,
    record_subscription_adjustment, AccountingStore, SubscriptionChange, UsageSource,
};
use crate::subscriptions::SubscriptionManager;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Whether `subscription` overlaps `period` at all.
fn in_period(subscription: &Subscription, period: &BillingPeriod) -> bool {
    subscription.date_start <= period.date_end
        && subscription.date_end.map_or(true, |end| {
            end > period.date_start && end > subscription.date_start
        })
}

/// Half-open `[start, end)` ranges of `period` not covered by
/// `subscriptions`, which must be ordered by start date.
pub fn community_ranges(
    subscriptions: &[Subscription],
    period: &BillingPeriod,
) -> Vec<(NaiveDate, NaiveDate)> {
    let after_period = period.date_end + Duration::days(1);
    if subscriptions.is_empty() {
        return vec![(period.date_start, after_period)];
    }

    let mut ranges = Vec::new();
    let mut previous_end = Some(period.date_end);
    let last = subscriptions.len() - 1;
    for (index, subscription) in subscriptions.iter().enumerate() {
        if index == 0 && subscription.date_start > period.date_start {
            ranges.push((period.date_start, subscription.date_start));
        }
        if let Some(previous) = previous_end {
            if previous < period.date_end && subscription.date_start > previous {
                ranges.push((previous, subscription.date_start));
            }
        }
        previous_end = subscription.date_end;

        if index == last {
            if let Some(end) = subscription.date_end {
                if end <= period.date_end {
                    ranges.push((end, after_period));
                }
            }
        }
    }
    ranges
}

/// Invoice dates for `subscription` inside `period`. The subscription's end
/// date is exclusive, so an end inside the period bills through the day
/// before.
pub fn invoice_period(subscription: &Subscription, period: &BillingPeriod) -> BillingPeriod {
    let date_start = subscription.date_start.max(period.date_start);
    let date_end = match subscription.date_end {
        Some(end) if end <= period.date_end => end - Duration::days(1),
        _ => period.date_end,
    };
    BillingPeriod {
        date_start,
        date_end,
    }
}

#[derive(Clone)]
pub struct InvoiceGenerator {
    store: Arc<dyn AccountingStore>,
    usage: Arc<dyn UsageSource>,
    catalog: PlanCatalog,
    subscriptions: SubscriptionManager,
    notifier: Arc<dyn Notifier>,
    settings: BillingSettings,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn AccountingStore>,
        usage: Arc<dyn UsageSource>,
        catalog: PlanCatalog,
        subscriptions: SubscriptionManager,
        notifier: Arc<dyn Notifier>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            usage,
            catalog,
            subscriptions,
            notifier,
            settings,
        }
    }

    /// Invoice every subscriber for the month before `based_on_date`. A
    /// failing domain is logged and the run moves on.
    #[instrument(skip(self))]
    pub async fn generate_invoices(&self, based_on_date: NaiveDate) -> Result<InvoiceRunSummary> {
        let period = BillingPeriod::previous_month(based_on_date);
        info!(
            date_start = %period.date_start,
            date_end = %period.date_end,
            "Starting invoice run"
        );

        let mut summary = InvoiceRunSummary::default();
        for subscriber in self.store.list_subscribers().await? {
            match self.create_invoices_for_domain(&subscriber.domain, &period).await {
                Ok(invoices) if invoices.is_empty() => summary.domains_skipped += 1,
                Ok(invoices) => summary.invoices_created += invoices.len(),
                Err(e) => {
                    summary.domains_failed += 1;
                    record_error(e.kind(), "generate_invoices");
                    error!(
                        domain = %subscriber.domain,
                        error = %e,
                        "Error occurred while creating invoice for domain"
                    );
                }
            }
        }

        info!(
            invoices_created = summary.invoices_created,
            domains_skipped = summary.domains_skipped,
            domains_failed = summary.domains_failed,
            "Invoice run finished"
        );
        Ok(summary)
    }

    /// Invoice every subscription `domain` had during `period`, filling gaps
    /// with community subscriptions first.
    #[instrument(skip(self, period), fields(date_start = %period.date_start, date_end = %period.date_end))]
    pub async fn create_invoices_for_domain(
        &self,
        domain: &str,
        period: &BillingPeriod,
    ) -> Result<Vec<Invoice>> {
        let subscriber = self
            .store
            .find_subscriber(domain)
            .await?
            .ok_or_else(|| InvoiceError::InvalidDomain(domain.to_string()))?;

        let mut subscriptions: Vec<Subscription> = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                subscriber_id: Some(subscriber.subscriber_id),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| in_period(s, period))
            .collect();
        self.ensure_full_coverage(&subscriber, &mut subscriptions, period)
            .await?;

        let mut invoices = Vec::new();
        for subscription in &subscriptions {
            let version = self.catalog.get_version(subscription.plan_version_id).await?;
            if !self
                .should_create_invoice(subscription, &version, domain, period)
                .await?
            {
                continue;
            }
            match self
                .create_invoice_for_subscription(subscription, &version, domain, period)
                .await
            {
                Ok(invoice) => invoices.push(invoice),
                Err(AccountingError::Invoice(InvoiceError::AlreadyCreated { invoice_id })) => {
                    error!(
                        domain = %domain,
                        invoice_id = %invoice_id,
                        "Invoice already existed for domain"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(invoices)
    }

    async fn ensure_full_coverage(
        &self,
        subscriber: &Subscriber,
        subscriptions: &mut Vec<Subscription>,
        period: &BillingPeriod,
    ) -> Result<()> {
        let community = self.catalog.community_plan_version().await?;
        if !self
            .catalog
            .feature_charges_exist_for_domain(
                &community,
                &subscriber.domain,
                period.date_start,
                period.date_end,
            )
            .await?
        {
            return Ok(());
        }

        let ranges = community_ranges(subscriptions, period);
        if ranges.is_empty() {
            return Ok(());
        }

        let mut do_not_invoice = subscriptions.iter().any(|s| s.do_not_invoice);
        let account = self
            .subscriptions
            .get_or_create_account_for_domain(&subscriber.domain, "invoice_generator")
            .await?;
        if account.date_confirmed_extra_charges.is_none() {
            info!(
                domain = %subscriber.domain,
                "Community invoice hidden because extra charges were never confirmed"
            );
            do_not_invoice = true;
        }

        let now = Utc::now();
        let gaps: Vec<Subscription> = ranges
            .into_iter()
            .map(|(date_start, date_end)| Subscription {
                subscription_id: Uuid::new_v4(),
                account_id: account.account_id,
                subscriber_id: subscriber.subscriber_id,
                plan_version_id: community.version_id(),
                date_start,
                date_end: Some(date_end),
                is_active: false,
                is_trial: false,
                do_not_invoice,
                auto_generate_credits: false,
                skip_invoicing_if_no_feature_charges: false,
                skip_auto_downgrade: false,
                service_type: SubscriptionType::Product.as_str().to_string(),
                next_subscription_id: None,
                created_utc: now,
                updated_utc: now,
            })
            .collect();

        self.store
            .apply_subscription_change(&SubscriptionChange {
                subscriptions: gaps.clone(),
                ..Default::default()
            })
            .await?;
        info!(
            domain = %subscriber.domain,
            count = gaps.len(),
            "Community subscriptions created for uncovered days"
        );
        subscriptions.extend(gaps);
        Ok(())
    }

    pub async fn should_create_invoice(
        &self,
        subscription: &Subscription,
        version: &PlanVersionDetail,
        domain: &str,
        period: &BillingPeriod,
    ) -> Result<bool> {
        if subscription.is_trial {
            info!(
                subscription_id = %subscription.subscription_id,
                "Skipping invoicing for trial subscription"
            );
            return Ok(false);
        }
        if subscription.skip_invoicing_if_no_feature_charges
            && !self
                .catalog
                .feature_charges_exist_for_domain(
                    version,
                    domain,
                    period.date_start,
                    period.date_end,
                )
                .await?
        {
            info!(
                subscription_id = %subscription.subscription_id,
                "Skipping invoicing because there are no feature charges"
            );
            return Ok(false);
        }
        if subscription.date_start > period.date_end {
            return Ok(false);
        }
        if subscription
            .date_end
            .is_some_and(|end| end <= period.date_start)
        {
            return Ok(false);
        }
        Ok(true)
    }

    async fn build_line_items(
        &self,
        invoice_id: Uuid,
        version: &PlanVersionDetail,
        domain: &str,
        period: &BillingPeriod,
    ) -> Result<Vec<LineItem>> {
        let mut items = vec![line_items::product_line_item(
            invoice_id,
            &version.product_rate,
            &version.plan.name,
            period,
        )?];
        for rate in &version.feature_rates {
            let item = match rate.parsed_feature_type() {
                Some(FeatureType::User) => {
                    let active_users = self.usage.active_user_count(domain).await?;
                    line_items::user_line_item(invoice_id, rate, active_users, period)?
                }
                Some(FeatureType::Sms) => {
                    let billables = self
                        .usage
                        .sms_billables(&[domain.to_string()], period.date_start, period.date_end)
                        .await?;
                    line_items::sms_line_item(invoice_id, rate, &billables)?
                }
                None => {
                    return Err(AccountingError::LineItem(format!(
                        "No line item factory exists for the feature type '{}'",
                        rate.feature_type
                    )))
                }
            };
            items.push(item);
        }
        Ok(items)
    }

    #[instrument(skip_all, fields(subscription_id = %subscription.subscription_id, domain = %domain))]
    pub async fn create_invoice_for_subscription(
        &self,
        subscription: &Subscription,
        version: &PlanVersionDetail,
        domain: &str,
        period: &BillingPeriod,
    ) -> Result<Invoice> {
        let dates = invoice_period(subscription, period);
        if let Some(existing) = self
            .store
            .find_invoice(subscription.subscription_id, dates.date_start, dates.date_end)
            .await?
        {
            return Err(InvoiceError::AlreadyCreated {
                invoice_id: existing.invoice_id,
            }
            .into());
        }

        let account = self.subscriptions.get_account(subscription.account_id).await?;
        let invoice_id = Uuid::new_v4();
        let mut items = self
            .build_line_items(invoice_id, version, domain, &dates)
            .await?;

        let mut planner = CreditPlanner::for_account(self.store.as_ref(), account.account_id).await?;

        if subscription.auto_generate_credits {
            if let Some(product) = items.iter().find(|i| i.is_product()) {
                let amount = product.subtotal();
                if amount > Decimal::ZERO {
                    planner.add(
                        CreditScope::subscription(
                            account.account_id,
                            subscription.subscription_id,
                            CreditKind::Product,
                        ),
                        CreditAdjustmentInput::new(amount, CreditAdjustmentReason::Manual),
                    )?;
                }
            }
        }

        for item in &mut items {
            let Some(kind) = item.credit_kind() else {
                continue;
            };
            let line_item_id = item.line_item_id;
            item.applied_credit = planner.apply(
                &application_order(subscription, kind),
                item.subtotal(),
                |amount| {
                    let mut input =
                        CreditAdjustmentInput::new(amount, CreditAdjustmentReason::LineItem);
                    input.line_item_id = Some(line_item_id);
                    input
                },
            )?;
        }

        let subtotal: Decimal = items.iter().map(|i| i.total()).sum();
        let applied_tax = round2(subtotal * account.tax_rate);
        let applied_credit = planner.apply(
            &application_order(subscription, CreditKind::General),
            subtotal + applied_tax,
            |amount| {
                let mut input = CreditAdjustmentInput::new(amount, CreditAdjustmentReason::Invoice);
                input.invoice_id = Some(invoice_id);
                input
            },
        )?;

        let mut invoice = Invoice {
            invoice_id,
            subscription_id: subscription.subscription_id,
            date_start: dates.date_start,
            date_end: dates.date_end,
            date_due: None,
            date_paid: None,
            tax_rate: account.tax_rate,
            subtotal,
            applied_tax,
            applied_credit,
            balance: Decimal::ZERO,
            is_hidden: subscription.do_not_invoice,
            created_utc: Utc::now(),
        };
        invoice.recompute_balance();

        let outstanding: Decimal = self
            .store
            .list_invoices(&ListInvoicesFilter {
                subscriber_id: Some(subscription.subscriber_id),
                is_hidden: Some(false),
                unpaid_only: true,
                ..Default::default()
            })
            .await?
            .iter()
            .map(|i| i.balance)
            .sum();
        let total_balance = if invoice.is_hidden {
            outstanding
        } else {
            outstanding + invoice.balance
        };
        if total_balance > self.settings.small_invoice_threshold
            || (account.auto_pay_enabled && total_balance > Decimal::ZERO)
        {
            invoice.date_due = Some(period.date_end + Duration::days(self.settings.days_until_due));
        }

        let mut subscription_adjustments: Vec<SubscriptionAdjustment> = Vec::new();
        if self
            .store
            .list_subscription_adjustments(subscription.subscription_id)
            .await?
            .is_empty()
        {
            subscription_adjustments.push(SubscriptionAdjustment {
                adjustment_id: Uuid::new_v4(),
                subscription_id: subscription.subscription_id,
                reason: SubscriptionAdjustmentReason::Create.as_str().to_string(),
                method: SubscriptionAdjustmentMethod::Task.as_str().to_string(),
                note: None,
                web_user: None,
                invoice_id: Some(invoice_id),
                related_subscription_id: None,
                new_date_start: subscription.date_start,
                new_date_end: subscription.date_end,
                created_utc: Utc::now(),
            });
        }

        let draft = InvoiceDraft {
            invoice: invoice.clone(),
            line_items: items,
            credit_postings: planner.into_postings(),
            subscription_adjustments,
        };
        self.store.commit_invoice(&draft).await?;

        record_invoice_created(invoice.is_hidden);
        for posting in &draft.credit_postings {
            record_credit_adjustment(&posting.adjustment.reason);
        }
        for adjustment in &draft.subscription_adjustments {
            record_subscription_adjustment(&adjustment.reason, &adjustment.method);
        }
        info!(
            invoice_id = %invoice.invoice_id,
            subtotal = %invoice.subtotal,
            balance = %invoice.balance,
            is_hidden = invoice.is_hidden,
            "Invoice created"
        );

        if !invoice.is_hidden && invoice.balance > Decimal::ZERO {
            let mut notice = Notice::new(
                NoticeKind::InvoiceCreated,
                domain,
                account.account_id,
                account.contact_emails.clone(),
            );
            notice.invoice_id = Some(invoice.invoice_id);
            notice.subscription_id = Some(subscription.subscription_id);
            notice.amount = Some(invoice.balance);
            notice.date = invoice.date_due;
            if let Err(e) = self.notifier.send(&notice).await {
                error!(invoice_id = %invoice.invoice_id, error = %e, "Failed to send invoice notice");
            }
        }
        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("invoice", invoice_id))
    }

    pub async fn line_items(&self, invoice_id: Uuid) -> Result<Vec<LineItem>> {
        self.store.list_line_items(invoice_id).await
    }

    pub async fn mark_invoice_paid(&self, invoice_id: Uuid, date_paid: NaiveDate) -> Result<Invoice> {
        let invoice = self.store.mark_invoice_paid(invoice_id, date_paid).await?;
        info!(invoice_id = %invoice_id, date_paid = %date_paid, "Invoice marked paid");
        Ok(invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn subscription(date_start: NaiveDate, date_end: Option<NaiveDate>) -> Subscription {
        let now = Utc::now();
        Subscription {
            subscription_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            subscriber_id: Uuid::new_v4(),
            plan_version_id: Uuid::new_v4(),
            date_start,
            date_end,
            is_active: true,
            is_trial: false,
            do_not_invoice: false,
            auto_generate_credits: false,
            skip_invoicing_if_no_feature_charges: false,
            skip_auto_downgrade: false,
            service_type: "product".to_string(),
            next_subscription_id: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn march() -> BillingPeriod {
        BillingPeriod::new(date(2024, 3, 1), date(2024, 3, 31)).unwrap()
    }

    #[test]
    fn no_subscriptions_means_the_whole_period_is_a_gap() {
        assert_eq!(
            community_ranges(&[], &march()),
            vec![(date(2024, 3, 1), date(2024, 4, 1))]
        );
    }

    #[test]
    fn gaps_before_between_and_after_subscriptions() {
        let subs = vec![
            subscription(date(2024, 3, 5), Some(date(2024, 3, 10))),
            subscription(date(2024, 3, 15), Some(date(2024, 3, 20))),
        ];
        assert_eq!(
            community_ranges(&subs, &march()),
            vec![
                (date(2024, 3, 1), date(2024, 3, 5)),
                (date(2024, 3, 10), date(2024, 3, 15)),
                (date(2024, 3, 20), date(2024, 4, 1)),
            ]
        );
    }

    #[test]
    fn open_ended_subscription_covers_the_rest() {
        let subs = vec![subscription(date(2024, 2, 1), None)];
        assert!(community_ranges(&subs, &march()).is_empty());
    }

    #[test]
    fn invoice_period_stops_the_day_before_the_end() {
        let sub = subscription(date(2024, 3, 10), Some(date(2024, 3, 20)));
        let dates = invoice_period(&sub, &march());
        assert_eq!(dates.date_start, date(2024, 3, 10));
        assert_eq!(dates.date_end, date(2024, 3, 19));

        let open = subscription(date(2024, 1, 1), None);
        assert_eq!(invoice_period(&open, &march()), march());
    }

    #[test]
    fn subscriptions_ending_on_the_first_day_are_outside_the_period() {
        let ended = subscription(date(2024, 2, 1), Some(date(2024, 3, 1)));
        assert!(!in_period(&ended, &march()));
        let empty = subscription(date(2024, 3, 5), Some(date(2024, 3, 5)));
        assert!(!in_period(&empty, &march()));
        let current = subscription(date(2024, 2, 1), Some(date(2024, 3, 2)));
        assert!(in_period(&current, &march()));
    }
}
