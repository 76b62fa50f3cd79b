//! Common test utilities for accounting-service integration tests.

#![allow(dead_code)]

use accounting_service::config::BillingSettings;
use accounting_service::engine::AccountingEngine;
use accounting_service::models::{
    AutomaticUpdateRule, BillingAccount, CreateBillingAccount, CreateFeatureRate,
    CreateProductRate, FeatureType, PlanVersionDetail, PublishPlanVersion, RuleWorkflow,
    SoftwarePlanEdition, Subscription, SubscriptionOptions,
};
use accounting_service::notifications::RecordingNotifier;
use accounting_service::privileges;
use accounting_service::services::{AccountingStore, InMemoryStore, InMemoryUsage};
use accounting_service::subscriptions::NewSubscription;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn user_rate(limit: i32, per_excess_fee: Decimal) -> CreateFeatureRate {
    CreateFeatureRate {
        feature_name: "Users".to_string(),
        feature_type: FeatureType::User,
        monthly_fee: dec!(0),
        monthly_limit: limit,
        per_excess_fee,
    }
}

pub fn sms_rate(limit: i32) -> CreateFeatureRate {
    CreateFeatureRate {
        feature_name: "SMS".to_string(),
        feature_type: FeatureType::Sms,
        monthly_fee: dec!(0),
        monthly_limit: limit,
        per_excess_fee: dec!(0),
    }
}

/// In-memory engine with a community, standard and pro plan published and
/// set as defaults.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub usage: Arc<InMemoryUsage>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: AccountingEngine,
    pub community: PlanVersionDetail,
    pub standard: PlanVersionDetail,
    pub pro: PlanVersionDetail,
}

pub async fn setup() -> TestContext {
    setup_with(BillingSettings::default()).await
}

pub async fn setup_with(settings: BillingSettings) -> TestContext {
    service_core::observability::init_test_tracing();

    let store = Arc::new(InMemoryStore::new());
    let usage = Arc::new(InMemoryUsage::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = AccountingEngine::new(store.clone(), usage.clone(), notifier.clone(), settings);

    let community = publish(
        &engine,
        "Community",
        SoftwarePlanEdition::Community,
        dec!(0),
        vec![user_rate(5, dec!(2))],
        vec![],
    )
    .await;
    let standard = publish(
        &engine,
        "Standard",
        SoftwarePlanEdition::Standard,
        dec!(100),
        vec![user_rate(10, dec!(1)), sms_rate(50)],
        vec![privileges::OUTBOUND_SMS, privileges::INBOUND_SMS],
    )
    .await;
    let pro = publish(
        &engine,
        "Pro",
        SoftwarePlanEdition::Pro,
        dec!(500),
        vec![user_rate(20, dec!(1))],
        vec![
            privileges::DATA_CLEANUP,
            privileges::OUTBOUND_SMS,
            privileges::INBOUND_SMS,
            privileges::ROLE_BASED_ACCESS,
        ],
    )
    .await;

    TestContext {
        store,
        usage,
        notifier,
        engine,
        community,
        standard,
        pro,
    }
}

async fn publish(
    engine: &AccountingEngine,
    name: &str,
    edition: SoftwarePlanEdition,
    monthly_fee: Decimal,
    feature_rates: Vec<CreateFeatureRate>,
    privileges: Vec<&str>,
) -> PlanVersionDetail {
    let version =
        publish_plan(engine, name, edition, monthly_fee, feature_rates, privileges).await;
    engine
        .catalog
        .set_default_plan(edition, version.plan.plan_id)
        .await
        .expect("Failed to set default plan");
    version
}

/// Publish a plan without making it its edition's default.
pub async fn publish_plan(
    engine: &AccountingEngine,
    name: &str,
    edition: SoftwarePlanEdition,
    monthly_fee: Decimal,
    feature_rates: Vec<CreateFeatureRate>,
    privileges: Vec<&str>,
) -> PlanVersionDetail {
    let plan = engine
        .catalog
        .create_plan(name, edition, None)
        .await
        .expect("Failed to create plan");
    engine
        .catalog
        .publish_version(PublishPlanVersion {
            plan_id: plan.plan_id,
            product_rate: CreateProductRate {
                name: name.to_string(),
                monthly_fee,
            },
            feature_rates,
            privileges: privileges.into_iter().map(str::to_string).collect(),
        })
        .await
        .expect("Failed to publish plan version")
}

impl TestContext {
    /// Account owned by `domain` that has confirmed extra charges.
    pub async fn account(&self, domain: &str) -> BillingAccount {
        let mut input = CreateBillingAccount::for_domain(domain, "admin@example.com");
        input.contact_emails = vec![format!("billing@{}.example.com", domain)];
        input.date_confirmed_extra_charges = Some(date(2024, 1, 1));
        self.engine
            .subscriptions
            .create_account(input)
            .await
            .expect("Failed to create account")
    }

    pub async fn subscribe(
        &self,
        account: &BillingAccount,
        domain: &str,
        version: &PlanVersionDetail,
        date_start: NaiveDate,
        date_end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Subscription {
        self.subscribe_with(
            account,
            domain,
            version,
            date_start,
            date_end,
            SubscriptionOptions::default(),
            today,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe_with(
        &self,
        account: &BillingAccount,
        domain: &str,
        version: &PlanVersionDetail,
        date_start: NaiveDate,
        date_end: Option<NaiveDate>,
        options: SubscriptionOptions,
        today: NaiveDate,
    ) -> Subscription {
        self.engine
            .subscriptions
            .new_domain_subscription(
                NewSubscription {
                    account_id: account.account_id,
                    domain: domain.to_string(),
                    plan_version_id: version.version_id(),
                    date_start,
                    date_end,
                    options,
                },
                today,
            )
            .await
            .expect("Failed to create subscription")
    }

    pub async fn add_rule(&self, domain: &str, workflow: RuleWorkflow) -> AutomaticUpdateRule {
        self.insert_rule(domain, workflow, false).await
    }

    /// Scheduling rule that sends a survey.
    pub async fn add_survey_rule(&self, domain: &str) -> AutomaticUpdateRule {
        self.insert_rule(domain, RuleWorkflow::Scheduling, true).await
    }

    async fn insert_rule(
        &self,
        domain: &str,
        workflow: RuleWorkflow,
        uses_survey: bool,
    ) -> AutomaticUpdateRule {
        let rule = AutomaticUpdateRule {
            rule_id: Uuid::new_v4(),
            domain: domain.to_string(),
            name: format!("{} rule", workflow.as_str()),
            workflow: workflow.as_str().to_string(),
            uses_survey,
            active: true,
            deleted: false,
            last_modified_utc: Utc::now(),
        };
        self.store.insert_automatic_update_rule(rule.clone()).await;
        rule
    }

    pub async fn live_rules(&self, domain: &str) -> Vec<AutomaticUpdateRule> {
        self.store
            .list_automatic_update_rules(domain, None)
            .await
            .expect("Failed to list rules")
            .into_iter()
            .filter(|r| r.is_live())
            .collect()
    }
}
