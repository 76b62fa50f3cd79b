//! Integration tests for the plan catalog.

mod common;

use accounting_service::error::AccountingError;
use accounting_service::models::{
    CreateProductRate, FeatureType, PublishPlanVersion, SoftwarePlanEdition,
};
use accounting_service::privileges;
use common::{date, setup, sms_rate, user_rate};
use rust_decimal_macros::dec;

fn publish_request(
    plan_id: uuid::Uuid,
    monthly_fee: rust_decimal::Decimal,
) -> PublishPlanVersion {
    PublishPlanVersion {
        plan_id,
        product_rate: CreateProductRate {
            name: "Advanced".to_string(),
            monthly_fee,
        },
        feature_rates: vec![user_rate(50, dec!(2))],
        privileges: vec![privileges::API_ACCESS.to_string()],
    }
}

#[tokio::test]
async fn publishing_again_creates_the_next_version() {
    let ctx = setup().await;
    let catalog = &ctx.engine.catalog;
    let plan = catalog
        .create_plan("Advanced", SoftwarePlanEdition::Advanced, None)
        .await
        .unwrap();

    let v1 = catalog
        .publish_version(publish_request(plan.plan_id, dec!(1000)))
        .await
        .unwrap();
    let v2 = catalog
        .publish_version(publish_request(plan.plan_id, dec!(1200)))
        .await
        .unwrap();

    assert_eq!(v1.version.version, 1);
    assert_eq!(v2.version.version, 2);
    assert_eq!(
        catalog.latest_version(plan.plan_id).await.unwrap().version_id(),
        v2.version_id()
    );

    let original = catalog.get_version(v1.version_id()).await.unwrap();
    assert_eq!(original.product_rate.monthly_fee, dec!(1000));
    assert!(original.has_privilege(privileges::API_ACCESS));
    assert_eq!(
        original
            .feature_rate(FeatureType::User)
            .map(|r| r.monthly_limit),
        Some(50)
    );
}

#[tokio::test]
async fn default_plan_must_match_the_edition() {
    let ctx = setup().await;
    let catalog = &ctx.engine.catalog;

    let result = catalog
        .set_default_plan(SoftwarePlanEdition::Community, ctx.pro.plan.plan_id)
        .await;
    assert!(matches!(result, Err(AccountingError::Catalog(_))));

    let community = catalog.community_plan_version().await.unwrap();
    assert_eq!(community.version_id(), ctx.community.version_id());
    assert!(community.is_community());

    let standard = catalog
        .default_plan_version(SoftwarePlanEdition::Standard)
        .await
        .unwrap();
    assert_eq!(standard.version_id(), ctx.standard.version_id());
}

#[tokio::test]
async fn missing_default_plan_is_a_catalog_error() {
    let ctx = setup().await;
    let result = ctx
        .engine
        .catalog
        .default_plan_version(SoftwarePlanEdition::Enterprise)
        .await;
    assert!(matches!(result, Err(AccountingError::Catalog(_))));
}

#[tokio::test]
async fn unknown_privilege_is_rejected() {
    let ctx = setup().await;
    let catalog = &ctx.engine.catalog;
    let plan = catalog
        .create_plan("Advanced", SoftwarePlanEdition::Advanced, None)
        .await
        .unwrap();

    let mut request = publish_request(plan.plan_id, dec!(1000));
    request.privileges.push("time_travel".to_string());
    let result = catalog.publish_version(request).await;

    assert!(matches!(result, Err(AccountingError::Validation(_))));
    assert!(matches!(
        catalog.latest_version(plan.plan_id).await,
        Err(AccountingError::Catalog(_))
    ));
}

#[tokio::test]
async fn duplicate_feature_rates_are_rejected() {
    let ctx = setup().await;
    let catalog = &ctx.engine.catalog;
    let plan = catalog
        .create_plan("Advanced", SoftwarePlanEdition::Advanced, None)
        .await
        .unwrap();

    let mut request = publish_request(plan.plan_id, dec!(1000));
    request.feature_rates.push(user_rate(10, dec!(1)));
    assert!(matches!(
        catalog.publish_version(request).await,
        Err(AccountingError::Validation(_))
    ));
}

#[tokio::test]
async fn feature_charges_follow_usage_over_limits() {
    let ctx = setup().await;
    let catalog = &ctx.engine.catalog;
    let (start, end) = (date(2024, 3, 1), date(2024, 3, 31));

    ctx.usage.set_active_users("usage-domain", 5).await;
    assert!(!catalog
        .feature_charges_exist_for_domain(&ctx.community, "usage-domain", start, end)
        .await
        .unwrap());

    ctx.usage.set_active_users("usage-domain", 6).await;
    assert!(catalog
        .feature_charges_exist_for_domain(&ctx.community, "usage-domain", start, end)
        .await
        .unwrap());
    assert!(!catalog
        .feature_charges_exist_for_domain(&ctx.standard, "usage-domain", start, end)
        .await
        .unwrap());
}

#[tokio::test]
async fn unlimited_features_never_charge() {
    let ctx = setup().await;
    let catalog = &ctx.engine.catalog;
    let plan = catalog
        .create_plan("Unlimited", SoftwarePlanEdition::Enterprise, None)
        .await
        .unwrap();
    let version = catalog
        .publish_version(PublishPlanVersion {
            plan_id: plan.plan_id,
            product_rate: CreateProductRate {
                name: "Unlimited".to_string(),
                monthly_fee: dec!(2000),
            },
            feature_rates: vec![user_rate(-1, dec!(1)), sms_rate(-1)],
            privileges: Vec::new(),
        })
        .await
        .unwrap();

    ctx.usage.set_active_users("big-domain", 10_000).await;
    assert!(!catalog
        .feature_charges_exist_for_domain(&version, "big-domain", date(2024, 3, 1), date(2024, 3, 31))
        .await
        .unwrap());
}
