//! Integration tests for the overdue invoice escalation.

mod common;

use accounting_service::downgrade::DOWNGRADE_NOTE;
use accounting_service::models::{
    RuleWorkflow, Subscription, SubscriptionAdjustmentMethod, SubscriptionAdjustmentReason,
    SubscriptionOptions,
};
use accounting_service::notifications::NoticeKind;
use common::{date, setup, TestContext};
use rust_decimal_macros::dec;

const DOMAIN: &str = "overdue";

/// Pro subscriber invoiced 500 for January, due 2024-03-01.
async fn overdue_pro(options: SubscriptionOptions) -> (TestContext, Subscription) {
    let ctx = setup().await;
    let account = ctx.account(DOMAIN).await;
    let subscription = ctx
        .subscribe_with(
            &account,
            DOMAIN,
            &ctx.pro,
            date(2024, 1, 1),
            None,
            options,
            date(2024, 1, 1),
        )
        .await;

    let summary = ctx
        .engine
        .invoices
        .generate_invoices(date(2024, 2, 1))
        .await
        .unwrap();
    assert_eq!(summary.invoices_created, 1);
    (ctx, subscription)
}

#[tokio::test]
async fn escalation_warns_then_downgrades_on_day_61() {
    let (ctx, pro) = overdue_pro(SubscriptionOptions::default()).await;
    ctx.add_rule(DOMAIN, RuleWorkflow::CaseUpdate).await;
    ctx.add_rule(DOMAIN, RuleWorkflow::Scheduling).await;
    let downgrades = &ctx.engine.downgrades;

    let overdue = downgrades
        .unpaid_invoice_over_threshold(pro.subscriber_id, date(2024, 3, 31))
        .await
        .unwrap()
        .expect("Expected an overdue invoice");
    assert_eq!(overdue.total, dec!(500));
    assert_eq!(overdue.invoice.date_due, Some(date(2024, 3, 1)));

    let day_30 = downgrades.run(date(2024, 3, 31)).await.unwrap();
    assert_eq!(day_30.overdue_notices, 1);
    let overdue_notices = ctx.notifier.sent_of(NoticeKind::OverdueInvoice);
    assert_eq!(overdue_notices.len(), 1);
    assert_eq!(overdue_notices[0].days, Some(30));
    assert_eq!(overdue_notices[0].amount, Some(dec!(500)));
    assert_eq!(overdue_notices[0].date, Some(date(2024, 4, 30)));

    let quiet = downgrades.run(date(2024, 4, 1)).await.unwrap();
    assert_eq!(quiet, Default::default());

    let day_58 = downgrades.run(date(2024, 4, 28)).await.unwrap();
    assert_eq!(day_58.downgrade_warnings, 1);
    assert_eq!(ctx.notifier.sent_of(NoticeKind::DowngradeWarning).len(), 1);

    let day_61 = downgrades.run(date(2024, 5, 1)).await.unwrap();
    assert_eq!(day_61.downgrades, 1);
    assert_eq!(day_61.failures, 0);
    assert_eq!(ctx.notifier.sent_of(NoticeKind::Downgraded).len(), 1);

    let active = ctx
        .engine
        .subscriptions
        .active_subscription_for_domain(DOMAIN)
        .await
        .unwrap()
        .expect("Expected a community subscription");
    assert_eq!(active.plan_version_id, ctx.community.version_id());
    assert_eq!(active.date_start, date(2024, 5, 1));

    let adjustments = ctx
        .engine
        .subscriptions
        .list_adjustments(pro.subscription_id)
        .await
        .unwrap();
    let downgrade = adjustments
        .iter()
        .find(|a| a.parsed_reason() == SubscriptionAdjustmentReason::Downgrade)
        .expect("Expected a downgrade adjustment");
    assert_eq!(
        downgrade.parsed_method(),
        SubscriptionAdjustmentMethod::AutomaticDowngrade
    );
    assert_eq!(downgrade.note.as_deref(), Some(DOWNGRADE_NOTE));

    assert!(ctx.live_rules(DOMAIN).await.is_empty());
}

#[tokio::test]
async fn community_domain_is_not_escalated_again() {
    let (ctx, pro) = overdue_pro(SubscriptionOptions::default()).await;
    ctx.engine.downgrades.run(date(2024, 5, 1)).await.unwrap();

    let later = ctx.engine.downgrades.run(date(2024, 5, 1)).await.unwrap();
    assert_eq!(later.downgrades, 0);
    assert_eq!(ctx.notifier.sent_of(NoticeKind::Downgraded).len(), 1);
    assert!(!ctx
        .engine
        .subscriptions
        .get_subscription(pro.subscription_id)
        .await
        .unwrap()
        .is_active);
}

#[tokio::test]
async fn skip_auto_downgrade_is_respected() {
    let (ctx, pro) = overdue_pro(SubscriptionOptions {
        skip_auto_downgrade: true,
        ..Default::default()
    })
    .await;

    let summary = ctx.engine.downgrades.run(date(2024, 5, 1)).await.unwrap();
    assert_eq!(summary.downgrades, 0);
    assert!(ctx.notifier.sent_of(NoticeKind::Downgraded).is_empty());

    let still = ctx
        .engine
        .subscriptions
        .active_subscription_for_domain(DOMAIN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.subscription_id, pro.subscription_id);
}

#[tokio::test]
async fn paid_invoices_are_not_escalated() {
    let (ctx, pro) = overdue_pro(SubscriptionOptions::default()).await;
    let invoice = ctx
        .engine
        .downgrades
        .unpaid_invoice_over_threshold(pro.subscriber_id, date(2024, 3, 31))
        .await
        .unwrap()
        .unwrap()
        .invoice;
    ctx.engine
        .invoices
        .mark_invoice_paid(invoice.invoice_id, date(2024, 3, 15))
        .await
        .unwrap();

    let summary = ctx.engine.downgrades.run(date(2024, 3, 31)).await.unwrap();
    assert_eq!(summary, Default::default());
    assert!(ctx.notifier.sent_of(NoticeKind::OverdueInvoice).is_empty());
}

#[tokio::test]
async fn small_invoices_have_no_due_date_and_are_ignored() {
    let ctx = setup().await;
    let account = ctx.account(DOMAIN).await;
    let subscription = ctx
        .subscribe(&account, DOMAIN, &ctx.standard, date(2024, 1, 1), None, date(2024, 1, 1))
        .await;

    ctx.engine
        .invoices
        .generate_invoices(date(2024, 2, 1))
        .await
        .unwrap();

    let overdue = ctx
        .engine
        .downgrades
        .unpaid_invoice_over_threshold(subscription.subscriber_id, date(2024, 3, 31))
        .await
        .unwrap();
    assert!(overdue.is_none());

    let summary = ctx.engine.downgrades.run(date(2024, 4, 1)).await.unwrap();
    assert_eq!(summary, Default::default());
}
