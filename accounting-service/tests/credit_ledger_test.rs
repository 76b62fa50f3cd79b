//! Integration tests for the credit ledger.

mod common;

use accounting_service::credits::AddCredit;
use accounting_service::error::AccountingError;
use accounting_service::models::{
    CreditAdjustmentInput, CreditAdjustmentReason, CreditKind, FeatureType,
    SubscriptionAdjustmentMethod,
};
use accounting_service::subscriptions::ChangeContext;
use common::{date, setup};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn balance_is_the_sum_of_adjustments() {
    let ctx = setup().await;
    let account = ctx.account("ledger-sum").await;
    let credits = &ctx.engine.credits;

    let first = credits
        .add_credit(AddCredit::new(dec!(40), account.account_id, CreditKind::General))
        .await
        .expect("Failed to add credit");
    credits
        .add_credit(AddCredit::new(dec!(15.50), account.account_id, CreditKind::General))
        .await
        .expect("Failed to add credit");
    credits
        .adjust_credit_balance(
            first.credit_line_id,
            CreditAdjustmentInput::new(dec!(-5.25), CreditAdjustmentReason::Manual)
                .with_note("correction"),
        )
        .await
        .expect("Failed to adjust credit");

    let line = credits.get_credit_line(first.credit_line_id).await.unwrap();
    let adjustments = credits.list_adjustments(first.credit_line_id).await.unwrap();
    let sum: Decimal = adjustments.iter().map(|a| a.amount).sum();

    assert_eq!(adjustments.len(), 3);
    assert_eq!(line.balance, dec!(50.25));
    assert_eq!(line.balance, sum);
    assert!(credits.check_credit_line_balances().await.unwrap().is_empty());
}

#[tokio::test]
async fn adjustment_below_zero_is_rejected() {
    let ctx = setup().await;
    let account = ctx.account("ledger-negative").await;
    let credits = &ctx.engine.credits;

    let added = credits
        .add_credit(AddCredit::new(dec!(10), account.account_id, CreditKind::Product))
        .await
        .unwrap();

    let result = credits
        .adjust_credit_balance(
            added.credit_line_id,
            CreditAdjustmentInput::new(dec!(-10.01), CreditAdjustmentReason::Manual),
        )
        .await;

    assert!(matches!(result, Err(AccountingError::CreditLine(_))));
    let line = credits.get_credit_line(added.credit_line_id).await.unwrap();
    assert_eq!(line.balance, dec!(10));
    assert_eq!(credits.list_adjustments(line.credit_line_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn adjustment_cannot_reference_line_item_and_invoice() {
    let ctx = setup().await;
    let account = ctx.account("ledger-clean").await;
    let credits = &ctx.engine.credits;

    let added = credits
        .add_credit(AddCredit::new(dec!(10), account.account_id, CreditKind::General))
        .await
        .unwrap();

    let mut input = CreditAdjustmentInput::new(dec!(-1), CreditAdjustmentReason::Manual);
    input.line_item_id = Some(Uuid::new_v4());
    input.invoice_id = Some(Uuid::new_v4());
    let result = credits.adjust_credit_balance(added.credit_line_id, input).await;

    assert!(matches!(result, Err(AccountingError::Validation(_))));
}

#[tokio::test]
async fn subscription_credit_must_belong_to_the_account() {
    let ctx = setup().await;
    let owner = ctx.account("ledger-owner").await;
    let other = ctx.account("ledger-other").await;
    let today = date(2024, 3, 1);
    let subscription = ctx
        .subscribe(&owner, "ledger-owner", &ctx.standard, today, None, today)
        .await;

    let result = ctx
        .engine
        .credits
        .add_credit(
            AddCredit::new(dec!(25), other.account_id, CreditKind::Product)
                .for_subscription(subscription.subscription_id),
        )
        .await;

    assert!(matches!(result, Err(AccountingError::CreditLine(_))));
}

#[tokio::test]
async fn inactive_subscription_needs_permission_for_credit() {
    let ctx = setup().await;
    let account = ctx.account("ledger-pending").await;
    let today = date(2024, 3, 1);
    let pending = ctx
        .subscribe(
            &account,
            "ledger-pending",
            &ctx.standard,
            date(2024, 4, 1),
            None,
            today,
        )
        .await;
    assert!(!pending.is_active);

    let request = AddCredit::new(dec!(25), account.account_id, CreditKind::Product)
        .for_subscription(pending.subscription_id);
    let result = ctx.engine.credits.add_credit(request.clone()).await;
    assert!(matches!(result, Err(AccountingError::CreditLine(_))));

    let mut permitted = request;
    permitted.permit_inactive = true;
    let adjustment = ctx
        .engine
        .credits
        .add_credit(permitted)
        .await
        .expect("Failed to add permitted credit");
    let line = ctx
        .engine
        .credits
        .get_credit_line(adjustment.credit_line_id)
        .await
        .unwrap();
    assert_eq!(line.subscription_id, Some(pending.subscription_id));
    assert_eq!(line.balance, dec!(25));
}

#[tokio::test]
async fn repeated_credit_reuses_one_line_per_scope() {
    let ctx = setup().await;
    let account = ctx.account("ledger-scope").await;
    let credits = &ctx.engine.credits;

    let users = CreditKind::Feature(FeatureType::User);
    let first = credits
        .add_credit(AddCredit::new(dec!(5), account.account_id, users))
        .await
        .unwrap();
    let second = credits
        .add_credit(AddCredit::new(dec!(7), account.account_id, users))
        .await
        .unwrap();
    let product = credits
        .add_credit(AddCredit::new(dec!(3), account.account_id, CreditKind::Product))
        .await
        .unwrap();

    assert_eq!(first.credit_line_id, second.credit_line_id);
    assert_ne!(first.credit_line_id, product.credit_line_id);
    let line = credits.get_credit_line(first.credit_line_id).await.unwrap();
    assert_eq!(line.balance, dec!(12));
}

#[tokio::test]
async fn balance_drift_is_reported() {
    let ctx = setup().await;
    let account = ctx.account("ledger-drift").await;

    let added = ctx
        .engine
        .credits
        .add_credit(AddCredit::new(dec!(20), account.account_id, CreditKind::General))
        .await
        .unwrap();
    ctx.store
        .force_credit_line_balance(added.credit_line_id, dec!(35))
        .await;

    let discrepancies = ctx.engine.credits.check_credit_line_balances().await.unwrap();
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].credit_line_id, added.credit_line_id);
    assert_eq!(discrepancies[0].balance, dec!(35));
    assert_eq!(discrepancies[0].expected_balance, dec!(20));
}

#[tokio::test]
async fn plan_change_moves_subscription_credit_to_the_successor() {
    let ctx = setup().await;
    let account = ctx.account("ledger-transfer").await;
    let start = date(2024, 3, 1);
    let subscription = ctx
        .subscribe(&account, "ledger-transfer", &ctx.standard, start, None, start)
        .await;

    let added = ctx
        .engine
        .credits
        .add_credit(
            AddCredit::new(dec!(60), account.account_id, CreditKind::Product)
                .for_subscription(subscription.subscription_id),
        )
        .await
        .unwrap();

    let next = ctx
        .engine
        .subscriptions
        .change_plan(
            subscription.subscription_id,
            ctx.pro.version_id(),
            None,
            ChangeContext::new(SubscriptionAdjustmentMethod::User).by_user("admin@example.com"),
            date(2024, 3, 15),
        )
        .await
        .expect("Failed to change plan");

    let old_line = ctx
        .engine
        .credits
        .get_credit_line(added.credit_line_id)
        .await
        .unwrap();
    assert_eq!(old_line.balance, dec!(0));

    let moved = ctx
        .engine
        .credits
        .get_credits_by_subscription_and_features(&next, None, true)
        .await
        .unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].balance, dec!(60));

    let transfer = ctx
        .engine
        .credits
        .list_adjustments(moved[0].credit_line_id)
        .await
        .unwrap();
    assert_eq!(transfer.len(), 1);
    assert_eq!(transfer[0].parsed_reason(), CreditAdjustmentReason::Transfer);
    assert_eq!(transfer[0].related_credit_line_id, Some(added.credit_line_id));
    assert_eq!(transfer[0].web_user.as_deref(), Some("admin@example.com"));

    assert!(ctx.engine.credits.check_credit_line_balances().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_subscription_credit_moves_to_the_account() {
    let ctx = setup().await;
    let account = ctx.account("ledger-cancel").await;
    let start = date(2024, 3, 1);
    let subscription = ctx
        .subscribe(&account, "ledger-cancel", &ctx.standard, start, None, start)
        .await;
    ctx.engine
        .credits
        .add_credit(
            AddCredit::new(dec!(45), account.account_id, CreditKind::Feature(FeatureType::Sms))
                .for_subscription(subscription.subscription_id),
        )
        .await
        .unwrap();

    let today = date(2024, 3, 20);
    ctx.engine
        .subscriptions
        .cancel_subscription(subscription.subscription_id, None, ChangeContext::default(), today)
        .await
        .expect("Failed to cancel subscription");

    let cancelled = ctx
        .engine
        .subscriptions
        .get_subscription(subscription.subscription_id)
        .await
        .unwrap();
    let account_lines = ctx
        .engine
        .credits
        .get_credits_for_kind(&cancelled, CreditKind::Feature(FeatureType::Sms))
        .await
        .unwrap();
    let account_scoped: Vec<_> = account_lines
        .iter()
        .filter(|l| l.subscription_id.is_none())
        .collect();
    assert_eq!(account_scoped.len(), 1);
    assert_eq!(account_scoped[0].balance, dec!(45));
}

#[tokio::test]
async fn invoice_credit_prefers_subscription_scope() {
    let ctx = setup().await;
    let account = ctx.account("ledger-order").await;
    let today = date(2024, 3, 1);
    let subscription = ctx
        .subscribe(&account, "ledger-order", &ctx.standard, today, None, today)
        .await;
    let credits = &ctx.engine.credits;

    credits
        .add_credit(AddCredit::new(dec!(10), account.account_id, CreditKind::General))
        .await
        .unwrap();
    credits
        .add_credit(
            AddCredit::new(dec!(5), account.account_id, CreditKind::General)
                .for_subscription(subscription.subscription_id),
        )
        .await
        .unwrap();

    let lines = credits.get_credits_for_invoice(&subscription).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].subscription_id, Some(subscription.subscription_id));
    assert_eq!(lines[0].balance, dec!(5));
    assert_eq!(lines[1].subscription_id, None);
    assert_eq!(lines[1].balance, dec!(10));
}
