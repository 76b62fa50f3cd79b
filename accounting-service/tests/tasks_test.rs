//! Integration tests for the periodic accounting tasks.

mod common;

use accounting_service::config::SchedulerConfig;
use accounting_service::models::SubscriptionOptions;
use accounting_service::notifications::NoticeKind;
use accounting_service::subscriptions::ChangeContext;
use accounting_service::tasks::{
    remind_subscriptions_ending, run_daily, spawn_scheduler, update_subscriptions,
};
use common::{date, setup};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn update_subscriptions_rolls_domains_forward() {
    let ctx = setup().await;
    let account = ctx.account("task-roll").await;
    let start = date(2024, 3, 1);
    let pending = ctx
        .subscribe(&account, "task-roll", &ctx.pro, date(2024, 4, 1), None, start)
        .await;
    let current = ctx
        .subscribe(&account, "task-roll", &ctx.standard, start, Some(date(2024, 4, 1)), start)
        .await;

    let summary = update_subscriptions(&ctx.engine, date(2024, 4, 1)).await.unwrap();
    assert_eq!(summary.deactivated, 1);
    assert_eq!(summary.still_active, 0);
    assert_eq!(summary.not_active, 0);
    assert_eq!(summary.domains_without_single_active, 0);
    assert_eq!(summary.credit_line_discrepancies, 0);

    let subscriptions = &ctx.engine.subscriptions;
    assert!(!subscriptions
        .get_subscription(current.subscription_id)
        .await
        .unwrap()
        .is_active);
    let active = subscriptions
        .active_subscription_for_domain("task-roll")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.subscription_id, pending.subscription_id);
}

#[tokio::test]
async fn update_subscriptions_activates_missed_starts() {
    let ctx = setup().await;
    let account = ctx.account("task-missed").await;
    let late = ctx
        .subscribe(
            &account,
            "task-missed",
            &ctx.standard,
            date(2024, 3, 1),
            None,
            date(2024, 2, 1),
        )
        .await;

    let summary = update_subscriptions(&ctx.engine, date(2024, 3, 4)).await.unwrap();
    assert_eq!(summary.activated, 1);
    assert!(ctx
        .engine
        .subscriptions
        .get_subscription(late.subscription_id)
        .await
        .unwrap()
        .is_active);
}

#[tokio::test]
async fn reminder_goes_out_for_unrenewed_subscriptions_only() {
    let ctx = setup().await;
    let start = date(2024, 3, 1);
    let end = date(2024, 5, 1);

    let ending_account = ctx.account("task-ending").await;
    let ending = ctx
        .subscribe(&ending_account, "task-ending", &ctx.standard, start, Some(end), start)
        .await;

    let renewed_account = ctx.account("task-renewed").await;
    let renewed = ctx
        .subscribe(&renewed_account, "task-renewed", &ctx.standard, start, Some(end), start)
        .await;
    ctx.engine
        .subscriptions
        .renew_subscription(renewed.subscription_id, None, ChangeContext::default())
        .await
        .unwrap();

    let trial_account = ctx.account("task-trial").await;
    ctx.subscribe_with(
        &trial_account,
        "task-trial",
        &ctx.pro,
        start,
        Some(end),
        SubscriptionOptions {
            is_trial: true,
            ..Default::default()
        },
        start,
    )
    .await;

    let sent = remind_subscriptions_ending(&ctx.engine, date(2024, 4, 1), 30)
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let notices = ctx.notifier.sent_of(NoticeKind::SubscriptionEnding);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].domain, "task-ending");
    assert_eq!(notices[0].subscription_id, Some(ending.subscription_id));
    assert_eq!(notices[0].date, Some(end));
    assert_eq!(notices[0].days, Some(30));
    assert_eq!(notices[0].recipients, ending_account.contact_emails);

    let off_day = remind_subscriptions_ending(&ctx.engine, date(2024, 4, 2), 30)
        .await
        .unwrap();
    assert_eq!(off_day, 0);
}

#[tokio::test]
async fn daily_run_invoices_on_the_first_of_the_month() {
    let ctx = setup().await;
    let account = ctx.account("task-daily").await;
    ctx.subscribe(
        &account,
        "task-daily",
        &ctx.pro,
        date(2024, 1, 1),
        None,
        date(2024, 1, 1),
    )
    .await;

    let mid_month = run_daily(&ctx.engine, date(2024, 3, 15), &[30, 10, 1]).await;
    assert!(mid_month.subscriptions.is_some());
    assert!(mid_month.invoices.is_none());
    assert_eq!(mid_month.reminders_sent, Some(0));
    assert!(mid_month.downgrades.is_some());

    let first = run_daily(&ctx.engine, date(2024, 4, 1), &[30, 10, 1]).await;
    let invoices = first.invoices.expect("Expected an invoice run");
    assert_eq!(invoices.invoices_created, 1);
    assert_eq!(ctx.notifier.sent_of(NoticeKind::InvoiceCreated).len(), 1);
}

#[tokio::test]
async fn disabled_scheduler_does_not_start() {
    let ctx = setup().await;
    let handle = spawn_scheduler(
        ctx.engine.clone(),
        SchedulerConfig {
            enabled: false,
            interval_secs: 60,
            reminder_days: vec![30],
        },
        CancellationToken::new(),
    );
    assert!(handle.is_none());
}

#[tokio::test]
async fn scheduler_stops_when_cancelled() {
    let ctx = setup().await;
    let shutdown = CancellationToken::new();
    let handle = spawn_scheduler(
        ctx.engine.clone(),
        SchedulerConfig {
            enabled: true,
            interval_secs: 3600,
            reminder_days: vec![30],
        },
        shutdown.clone(),
    )
    .expect("Expected the scheduler to start");

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("Scheduler did not stop")
        .expect("Scheduler task panicked");
}
