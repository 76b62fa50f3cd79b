//! Periodic accounting tasks and the background scheduler that drives them.

use crate::config::SchedulerConfig;
use crate::downgrade::DowngradeRunSummary;
use crate::engine::AccountingEngine;
use crate::error::Result;
use crate::models::{
    CreditLineDiscrepancy, InvoiceRunSummary, ListSubscriptionsFilter, Subscription,
};
use crate::notifications::{Notice, NoticeKind};
use crate::services::record_task_run;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriptionUpdateSummary {
    pub deactivated: usize,
    pub activated: usize,
    pub still_active: usize,
    pub not_active: usize,
    pub domains_without_single_active: usize,
    pub credit_line_discrepancies: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyRunSummary {
    pub subscriptions: Option<SubscriptionUpdateSummary>,
    pub reminders_sent: Option<usize>,
    pub downgrades: Option<DowngradeRunSummary>,
    pub invoices: Option<InvoiceRunSummary>,
}

fn record<T>(task: &str, result: &Result<T>) {
    match result {
        Ok(_) => record_task_run(task, "success"),
        Err(e) => {
            record_task_run(task, "failure");
            error!(task = task, error = %e, "Accounting task failed");
        }
    }
}

/// Ends subscriptions whose `date_end` has passed and starts the ones
/// whose `date_start` has arrived, then reports anything left inconsistent.
#[instrument(skip(engine))]
pub async fn update_subscriptions(
    engine: &AccountingEngine,
    today: NaiveDate,
) -> Result<SubscriptionUpdateSummary> {
    let subscriptions = &engine.subscriptions;
    let mut summary = SubscriptionUpdateSummary::default();

    summary.deactivated += subscriptions.deactivate_subscriptions(Some(today), today).await?;
    summary.deactivated += subscriptions.deactivate_subscriptions(None, today).await?;
    summary.activated += subscriptions.activate_subscriptions(Some(today), today).await?;
    summary.activated += subscriptions.activate_subscriptions(None, today).await?;

    summary.still_active = subscriptions.warn_subscriptions_still_active(today).await?.len();
    summary.not_active = subscriptions.warn_subscriptions_not_active(today).await?.len();
    summary.domains_without_single_active = subscriptions
        .warn_active_subscriptions_per_domain_not_one()
        .await?
        .len();
    summary.credit_line_discrepancies = check_credit_line_balances(engine).await?.len();

    info!(
        deactivated = summary.deactivated,
        activated = summary.activated,
        "Subscriptions updated"
    );
    Ok(summary)
}

pub async fn check_credit_line_balances(
    engine: &AccountingEngine,
) -> Result<Vec<CreditLineDiscrepancy>> {
    engine.credits.check_credit_line_balances().await
}

/// Warns accounts whose paid subscription ends in exactly `days` days and
/// has not been renewed. Returns the number of notices sent.
#[instrument(skip(engine))]
pub async fn remind_subscriptions_ending(
    engine: &AccountingEngine,
    today: NaiveDate,
    days: i64,
) -> Result<usize> {
    let ending_on = today + Duration::days(days);
    let ending = engine
        .store
        .list_subscriptions(&ListSubscriptionsFilter {
            is_active: Some(true),
            ..Default::default()
        })
        .await?
        .into_iter()
        .filter(|s| !s.is_trial && s.date_end == Some(ending_on) && s.next_subscription_id.is_none());

    let mut sent = 0;
    for subscription in ending {
        match send_ending_reminder(engine, &subscription, ending_on, days).await {
            Ok(true) => sent += 1,
            Ok(false) => {}
            Err(e) => error!(
                subscription_id = %subscription.subscription_id,
                error = %e,
                "Failed to send subscription reminder"
            ),
        }
    }
    Ok(sent)
}

async fn send_ending_reminder(
    engine: &AccountingEngine,
    subscription: &Subscription,
    ending_on: NaiveDate,
    days: i64,
) -> Result<bool> {
    let account = engine.subscriptions.get_account(subscription.account_id).await?;
    let Some(subscriber) = engine.store.get_subscriber(subscription.subscriber_id).await? else {
        warn!(subscription_id = %subscription.subscription_id, "Subscription has no subscriber");
        return Ok(false);
    };
    let mut notice = Notice::new(
        NoticeKind::SubscriptionEnding,
        &subscriber.domain,
        account.account_id,
        account.contact_emails,
    );
    notice.subscription_id = Some(subscription.subscription_id);
    notice.date = Some(ending_on);
    notice.days = Some(days);
    engine.notifier.send(&notice).await?;
    Ok(true)
}

/// Everything due on `today`. Invoices are generated on the first of the
/// month only. A failing task does not stop the others.
#[instrument(skip(engine, reminder_days))]
pub async fn run_daily(
    engine: &AccountingEngine,
    today: NaiveDate,
    reminder_days: &[i64],
) -> DailyRunSummary {
    let mut summary = DailyRunSummary::default();

    let result = update_subscriptions(engine, today).await;
    record("update_subscriptions", &result);
    summary.subscriptions = result.ok();

    if today.day() == 1 {
        let result = engine.invoices.generate_invoices(today).await;
        record("generate_invoices", &result);
        summary.invoices = result.ok();
    }

    let mut reminders = 0;
    let mut reminders_ok = true;
    for days in reminder_days {
        let result = remind_subscriptions_ending(engine, today, *days).await;
        record("subscription_reminders", &result);
        match result {
            Ok(sent) => reminders += sent,
            Err(_) => reminders_ok = false,
        }
    }
    summary.reminders_sent = reminders_ok.then_some(reminders);

    let result = engine.downgrades.run(today).await;
    record("downgrade_process", &result);
    summary.downgrades = result.ok();

    summary
}

/// Runs [`run_daily`] at most once per calendar day, polling every
/// `interval_secs`, until `shutdown` is cancelled.
pub fn spawn_scheduler(
    engine: AccountingEngine,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        info!("Accounting scheduler disabled by configuration");
        return None;
    }

    info!(
        interval_secs = config.interval_secs,
        "Starting accounting scheduler"
    );

    Some(tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(config.interval_secs.max(1)));
        let mut last_run: Option<NaiveDate> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Accounting scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let today = Utc::now().date_naive();
                    if last_run == Some(today) {
                        continue;
                    }
                    let summary = run_daily(&engine, today, &config.reminder_days).await;
                    info!(date = %today, summary = ?summary, "Daily accounting run complete");
                    last_run = Some(today);
                }
            }
        }
    }))
}
