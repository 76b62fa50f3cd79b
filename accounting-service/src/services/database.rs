//! Database service for accounting-service.

use crate::error::{AccountingError, InvoiceError, Result};
use crate::models::{
    AutomaticUpdateRule, BillingAccount, CreditAdjustment, CreditLine, CreditPosting,
    DefaultProductPlan, FeatureRate, Invoice, InvoiceDraft, LineItem, ListCreditLinesFilter,
    ListInvoicesFilter, ListSubscriptionsFilter, PlanVersionDetail, ProductRate, RuleSelector,
    RuleWorkflow, SmsBillable, SoftwarePlan, SoftwarePlanEdition, SoftwarePlanVersion, Subscriber,
    Subscription, SubscriptionAdjustment,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{AccountingStore, SubscriptionChange, UsageSource};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, account_id, subscriber_id, plan_version_id, date_start, date_end, is_active, is_trial, do_not_invoice, auto_generate_credits, skip_invoicing_if_no_feature_charges, skip_auto_downgrade, service_type, next_subscription_id, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, subscription_id, date_start, date_end, date_due, date_paid, tax_rate, subtotal, applied_tax, applied_credit, balance, is_hidden, created_utc";

const CREDIT_LINE_COLUMNS: &str = "credit_line_id, account_id, subscription_id, is_product, feature_type, balance, is_active, created_utc, last_modified_utc";

const ACCOUNT_COLUMNS: &str = "account_id, name, currency, created_by, created_by_domain, is_active, auto_pay_enabled, date_confirmed_extra_charges, tax_rate, contact_emails, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "accounting-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> std::result::Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> std::result::Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| AccountingError::database("Failed to begin transaction", e))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| AccountingError::database("Failed to commit transaction", e))
    }

    /// Load the plan, product rate and feature rates behind a version row.
    async fn load_plan_version(&self, version: SoftwarePlanVersion) -> Result<PlanVersionDetail> {
        let plan = sqlx::query_as::<_, SoftwarePlan>(
            r#"
            SELECT plan_id, name, description, edition, created_utc
            FROM software_plans
            WHERE plan_id = $1
            "#,
        )
        .bind(version.plan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get plan for version", e))?;

        let product_rate = sqlx::query_as::<_, ProductRate>(
            r#"
            SELECT rate_id, version_id, name, monthly_fee
            FROM product_rates
            WHERE version_id = $1
            "#,
        )
        .bind(version.version_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get product rate", e))?;

        let feature_rates = sqlx::query_as::<_, FeatureRate>(
            r#"
            SELECT rate_id, version_id, feature_name, feature_type, monthly_fee, monthly_limit, per_excess_fee
            FROM feature_rates
            WHERE version_id = $1
            ORDER BY feature_type
            "#,
        )
        .bind(version.version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get feature rates", e))?;

        Ok(PlanVersionDetail {
            plan,
            version,
            product_rate,
            feature_rates,
        })
    }

    async fn upsert_subscription(
        tx: &mut Transaction<'static, Postgres>,
        subscription: &Subscription,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, account_id, subscriber_id, plan_version_id, date_start, date_end, is_active, is_trial, do_not_invoice, auto_generate_credits, skip_invoicing_if_no_feature_charges, skip_auto_downgrade, service_type, next_subscription_id, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
            ON CONFLICT (subscription_id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                plan_version_id = EXCLUDED.plan_version_id,
                date_start = EXCLUDED.date_start,
                date_end = EXCLUDED.date_end,
                is_active = EXCLUDED.is_active,
                is_trial = EXCLUDED.is_trial,
                do_not_invoice = EXCLUDED.do_not_invoice,
                auto_generate_credits = EXCLUDED.auto_generate_credits,
                skip_invoicing_if_no_feature_charges = EXCLUDED.skip_invoicing_if_no_feature_charges,
                skip_auto_downgrade = EXCLUDED.skip_auto_downgrade,
                service_type = EXCLUDED.service_type,
                next_subscription_id = EXCLUDED.next_subscription_id,
                updated_utc = NOW()
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.account_id)
        .bind(subscription.subscriber_id)
        .bind(subscription.plan_version_id)
        .bind(subscription.date_start)
        .bind(subscription.date_end)
        .bind(subscription.is_active)
        .bind(subscription.is_trial)
        .bind(subscription.do_not_invoice)
        .bind(subscription.auto_generate_credits)
        .bind(subscription.skip_invoicing_if_no_feature_charges)
        .bind(subscription.skip_auto_downgrade)
        .bind(&subscription.service_type)
        .bind(subscription.next_subscription_id)
        .bind(subscription.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| AccountingError::database("Failed to save subscription", e))?;
        Ok(())
    }

    async fn insert_subscription_adjustment(
        tx: &mut Transaction<'static, Postgres>,
        adjustment: &SubscriptionAdjustment,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_adjustments (adjustment_id, subscription_id, reason, method, note, web_user, invoice_id, related_subscription_id, new_date_start, new_date_end, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(adjustment.adjustment_id)
        .bind(adjustment.subscription_id)
        .bind(&adjustment.reason)
        .bind(&adjustment.method)
        .bind(&adjustment.note)
        .bind(&adjustment.web_user)
        .bind(adjustment.invoice_id)
        .bind(adjustment.related_subscription_id)
        .bind(adjustment.new_date_start)
        .bind(adjustment.new_date_end)
        .bind(adjustment.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| AccountingError::database("Failed to record subscription adjustment", e))?;
        Ok(())
    }

    /// Insert new lines, append the adjustments and move balances. The
    /// balance update refuses to take a line below zero.
    async fn post_in_tx(
        tx: &mut Transaction<'static, Postgres>,
        postings: &[CreditPosting],
    ) -> Result<()> {
        for posting in postings {
            posting.adjustment.clean()?;
            let line = &posting.line;

            if posting.is_new {
                sqlx::query(
                    r#"
                    INSERT INTO credit_lines (credit_line_id, account_id, subscription_id, is_product, feature_type, balance, is_active, created_utc, last_modified_utc)
                    VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $7)
                    ON CONFLICT (credit_line_id) DO NOTHING
                    "#,
                )
                .bind(line.credit_line_id)
                .bind(line.account_id)
                .bind(line.subscription_id)
                .bind(line.is_product)
                .bind(&line.feature_type)
                .bind(line.is_active)
                .bind(line.created_utc)
                .execute(&mut **tx)
                .await
                .map_err(|e| AccountingError::database("Failed to create credit line", e))?;
            }

            let adjustment = &posting.adjustment;
            let updated = sqlx::query(
                r#"
                UPDATE credit_lines
                SET balance = balance + $2, last_modified_utc = NOW()
                WHERE credit_line_id = $1 AND ($2 >= 0 OR balance + $2 >= 0)
                "#,
            )
            .bind(line.credit_line_id)
            .bind(adjustment.amount)
            .execute(&mut **tx)
            .await
            .map_err(|e| AccountingError::database("Failed to update credit balance", e))?;

            if updated.rows_affected() == 0 {
                return Err(AccountingError::CreditLine(format!(
                    "credit line {} is missing or would go negative by {}",
                    line.credit_line_id, adjustment.amount
                )));
            }

            sqlx::query(
                r#"
                INSERT INTO credit_adjustments (adjustment_id, credit_line_id, reason, amount, note, line_item_id, invoice_id, related_credit_line_id, web_user, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(adjustment.adjustment_id)
            .bind(adjustment.credit_line_id)
            .bind(&adjustment.reason)
            .bind(adjustment.amount)
            .bind(&adjustment.note)
            .bind(adjustment.line_item_id)
            .bind(adjustment.invoice_id)
            .bind(adjustment.related_credit_line_id)
            .bind(&adjustment.web_user)
            .bind(adjustment.created_utc)
            .execute(&mut **tx)
            .await
            .map_err(|e| AccountingError::database("Failed to record credit adjustment", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AccountingStore for Database {
    // =========================================================================
    // Plan Catalog
    // =========================================================================

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn insert_plan(&self, plan: &SoftwarePlan) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_plan"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO software_plans (plan_id, name, description, edition, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(&plan.edition)
        .bind(plan.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to create plan", e))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<SoftwarePlan>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, SoftwarePlan>(
            r#"
            SELECT plan_id, name, description, edition, created_utc
            FROM software_plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get plan", e))?;

        timer.observe_duration();

        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn list_plans(&self) -> Result<Vec<SoftwarePlan>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plans"])
            .start_timer();

        let plans = sqlx::query_as::<_, SoftwarePlan>(
            r#"
            SELECT plan_id, name, description, edition, created_utc
            FROM software_plans
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list plans", e))?;

        timer.observe_duration();

        Ok(plans)
    }

    #[instrument(skip(self, detail), fields(plan_id = %detail.version.plan_id, version = detail.version.version))]
    async fn insert_plan_version(&self, detail: &PlanVersionDetail) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_plan_version"])
            .start_timer();

        let mut tx = self.begin().await?;
        let version = &detail.version;

        let inserted = sqlx::query(
            r#"
            INSERT INTO software_plan_versions (version_id, plan_id, version, privileges, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (plan_id, version) DO NOTHING
            "#,
        )
        .bind(version.version_id)
        .bind(version.plan_id)
        .bind(version.version)
        .bind(&version.privileges)
        .bind(version.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| AccountingError::database("Failed to create plan version", e))?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(AccountingError::Catalog(format!(
                "version {} of plan {} already exists",
                version.version, version.plan_id
            )));
        }

        let rate = &detail.product_rate;
        sqlx::query(
            r#"
            INSERT INTO product_rates (rate_id, version_id, name, monthly_fee)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(rate.rate_id)
        .bind(rate.version_id)
        .bind(&rate.name)
        .bind(rate.monthly_fee)
        .execute(&mut *tx)
        .await
        .map_err(|e| AccountingError::database("Failed to create product rate", e))?;

        for rate in &detail.feature_rates {
            sqlx::query(
                r#"
                INSERT INTO feature_rates (rate_id, version_id, feature_name, feature_type, monthly_fee, monthly_limit, per_excess_fee)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(rate.rate_id)
            .bind(rate.version_id)
            .bind(&rate.feature_name)
            .bind(&rate.feature_type)
            .bind(rate.monthly_fee)
            .bind(rate.monthly_limit)
            .bind(rate.per_excess_fee)
            .execute(&mut *tx)
            .await
            .map_err(|e| AccountingError::database("Failed to create feature rate", e))?;
        }

        Self::commit(tx).await?;
        timer.observe_duration();
        info!(version_id = %version.version_id, "Plan version published");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_plan_version(&self, version_id: Uuid) -> Result<Option<PlanVersionDetail>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan_version"])
            .start_timer();

        let version = sqlx::query_as::<_, SoftwarePlanVersion>(
            r#"
            SELECT version_id, plan_id, version, privileges, created_utc
            FROM software_plan_versions
            WHERE version_id = $1
            "#,
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get plan version", e))?;

        let detail = match version {
            Some(version) => Some(self.load_plan_version(version).await?),
            None => None,
        };

        timer.observe_duration();

        Ok(detail)
    }

    #[instrument(skip(self))]
    async fn latest_plan_version(&self, plan_id: Uuid) -> Result<Option<PlanVersionDetail>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_plan_version"])
            .start_timer();

        let version = sqlx::query_as::<_, SoftwarePlanVersion>(
            r#"
            SELECT version_id, plan_id, version, privileges, created_utc
            FROM software_plan_versions
            WHERE plan_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get latest plan version", e))?;

        let detail = match version {
            Some(version) => Some(self.load_plan_version(version).await?),
            None => None,
        };

        timer.observe_duration();

        Ok(detail)
    }

    #[instrument(skip(self, default_plan), fields(edition = %default_plan.edition))]
    async fn set_default_plan(&self, default_plan: &DefaultProductPlan) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_default_plan"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO default_product_plans (edition, plan_id, created_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (edition) DO UPDATE SET plan_id = EXCLUDED.plan_id
            "#,
        )
        .bind(&default_plan.edition)
        .bind(default_plan.plan_id)
        .bind(default_plan.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to set default plan", e))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(edition = edition.as_str()))]
    async fn get_default_plan(
        &self,
        edition: SoftwarePlanEdition,
    ) -> Result<Option<DefaultProductPlan>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_default_plan"])
            .start_timer();

        let default_plan = sqlx::query_as::<_, DefaultProductPlan>(
            r#"
            SELECT edition, plan_id, created_utc
            FROM default_product_plans
            WHERE edition = $1
            "#,
        )
        .bind(edition.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get default plan", e))?;

        timer.observe_duration();

        Ok(default_plan)
    }

    // =========================================================================
    // Accounts and Subscribers
    // =========================================================================

    #[instrument(skip(self, account), fields(account_id = %account.account_id))]
    async fn insert_account(&self, account: &BillingAccount) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_account"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO billing_accounts (account_id, name, currency, created_by, created_by_domain, is_active, auto_pay_enabled, date_confirmed_extra_charges, tax_rate, contact_emails, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(account.account_id)
        .bind(&account.name)
        .bind(&account.currency)
        .bind(&account.created_by)
        .bind(&account.created_by_domain)
        .bind(account.is_active)
        .bind(account.auto_pay_enabled)
        .bind(account.date_confirmed_extra_charges)
        .bind(account.tax_rate)
        .bind(&account.contact_emails)
        .bind(account.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to create billing account", e))?;

        timer.observe_duration();
        info!(account_id = %account.account_id, name = %account.name, "Billing account created");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_account(&self, account_id: Uuid) -> Result<Option<BillingAccount>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = sqlx::query_as::<_, BillingAccount>(&format!(
            "SELECT {} FROM billing_accounts WHERE account_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get billing account", e))?;

        timer.observe_duration();

        Ok(account)
    }

    #[instrument(skip(self))]
    async fn find_account_for_domain(&self, domain: &str) -> Result<Option<BillingAccount>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_account_for_domain"])
            .start_timer();

        let account = sqlx::query_as::<_, BillingAccount>(&format!(
            "SELECT {} FROM billing_accounts WHERE created_by_domain = $1 AND is_active = TRUE ORDER BY created_utc LIMIT 1",
            ACCOUNT_COLUMNS
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to find billing account", e))?;

        timer.observe_duration();

        Ok(account)
    }

    #[instrument(skip(self))]
    async fn get_or_create_subscriber(&self, domain: &str) -> Result<Subscriber> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_or_create_subscriber"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO subscribers (subscriber_id, domain)
            VALUES ($1, $2)
            ON CONFLICT (domain) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(domain)
        .execute(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to create subscriber", e))?;

        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT subscriber_id, domain, created_utc
            FROM subscribers
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get subscriber", e))?;

        timer.observe_duration();

        Ok(subscriber)
    }

    #[instrument(skip(self))]
    async fn get_subscriber(&self, subscriber_id: Uuid) -> Result<Option<Subscriber>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscriber"])
            .start_timer();

        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT subscriber_id, domain, created_utc
            FROM subscribers
            WHERE subscriber_id = $1
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get subscriber", e))?;

        timer.observe_duration();

        Ok(subscriber)
    }

    #[instrument(skip(self))]
    async fn find_subscriber(&self, domain: &str) -> Result<Option<Subscriber>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriber"])
            .start_timer();

        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT subscriber_id, domain, created_utc
            FROM subscribers
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to find subscriber", e))?;

        timer.observe_duration();

        Ok(subscriber)
    }

    #[instrument(skip(self))]
    async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscribers"])
            .start_timer();

        let subscribers = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT subscriber_id, domain, created_utc
            FROM subscribers
            ORDER BY domain
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list subscribers", e))?;

        timer.observe_duration();

        Ok(subscribers)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get subscription", e))?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self, filter))]
    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE ($1::uuid IS NULL OR subscriber_id = $1)
              AND ($2::uuid IS NULL OR account_id = $2)
              AND ($3::boolean IS NULL OR is_active = $3)
            ORDER BY date_start, date_end NULLS LAST
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(filter.subscriber_id)
        .bind(filter.account_id)
        .bind(filter.is_active)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list subscriptions", e))?;

        timer.observe_duration();

        Ok(subscriptions)
    }

    #[instrument(skip(self, change), fields(subscriptions = change.subscriptions.len(), postings = change.credit_postings.len()))]
    async fn apply_subscription_change(&self, change: &SubscriptionChange) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_subscription_change"])
            .start_timer();

        let mut tx = self.begin().await?;
        for subscription in &change.subscriptions {
            Self::upsert_subscription(&mut tx, subscription).await?;
        }
        for adjustment in &change.adjustments {
            Self::insert_subscription_adjustment(&mut tx, adjustment).await?;
        }
        Self::post_in_tx(&mut tx, &change.credit_postings).await?;
        Self::commit(tx).await?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_subscription_adjustments(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionAdjustment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscription_adjustments"])
            .start_timer();

        let adjustments = sqlx::query_as::<_, SubscriptionAdjustment>(
            r#"
            SELECT adjustment_id, subscription_id, reason, method, note, web_user, invoice_id, related_subscription_id, new_date_start, new_date_end, created_utc
            FROM subscription_adjustments
            WHERE subscription_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list subscription adjustments", e))?;

        timer.observe_duration();

        Ok(adjustments)
    }

    // =========================================================================
    // Credits
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_credit_line(&self, credit_line_id: Uuid) -> Result<Option<CreditLine>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credit_line"])
            .start_timer();

        let line = sqlx::query_as::<_, CreditLine>(&format!(
            "SELECT {} FROM credit_lines WHERE credit_line_id = $1",
            CREDIT_LINE_COLUMNS
        ))
        .bind(credit_line_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get credit line", e))?;

        timer.observe_duration();

        Ok(line)
    }

    #[instrument(skip(self, filter))]
    async fn list_credit_lines(&self, filter: &ListCreditLinesFilter) -> Result<Vec<CreditLine>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credit_lines"])
            .start_timer();

        let lines = sqlx::query_as::<_, CreditLine>(&format!(
            r#"
            SELECT {}
            FROM credit_lines
            WHERE ($1::uuid IS NULL OR account_id = $1)
              AND ($2::uuid IS NULL OR subscription_id = $2)
              AND (NOT $3 OR subscription_id IS NULL)
              AND (NOT $4 OR is_active = TRUE)
            ORDER BY created_utc
            "#,
            CREDIT_LINE_COLUMNS
        ))
        .bind(filter.account_id)
        .bind(filter.subscription_id)
        .bind(filter.account_scope_only)
        .bind(filter.active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list credit lines", e))?;

        timer.observe_duration();

        Ok(lines)
    }

    #[instrument(skip(self))]
    async fn list_credit_adjustments(
        &self,
        credit_line_id: Uuid,
    ) -> Result<Vec<CreditAdjustment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credit_adjustments"])
            .start_timer();

        let adjustments = sqlx::query_as::<_, CreditAdjustment>(
            r#"
            SELECT adjustment_id, credit_line_id, reason, amount, note, line_item_id, invoice_id, related_credit_line_id, web_user, created_utc
            FROM credit_adjustments
            WHERE credit_line_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(credit_line_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list credit adjustments", e))?;

        timer.observe_duration();

        Ok(adjustments)
    }

    #[instrument(skip(self, postings), fields(postings = postings.len()))]
    async fn post_credit_adjustments(&self, postings: &[CreditPosting]) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["post_credit_adjustments"])
            .start_timer();

        let mut tx = self.begin().await?;
        Self::post_in_tx(&mut tx, postings).await?;
        Self::commit(tx).await?;

        timer.observe_duration();

        Ok(())
    }

    // =========================================================================
    // Invoices
    // =========================================================================

    #[instrument(skip(self))]
    async fn find_invoice(
        &self,
        subscription_id: Uuid,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE subscription_id = $1 AND date_start = $2 AND date_end = $3",
            INVOICE_COLUMNS
        ))
        .bind(subscription_id)
        .bind(date_start)
        .bind(date_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to find invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self, filter))]
    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> Result<Vec<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT i.invoice_id, i.subscription_id, i.date_start, i.date_end, i.date_due, i.date_paid, i.tax_rate, i.subtotal, i.applied_tax, i.applied_credit, i.balance, i.is_hidden, i.created_utc
            FROM invoices i
            JOIN subscriptions s ON s.subscription_id = i.subscription_id
            WHERE ($1::uuid IS NULL OR i.subscription_id = $1)
              AND ($2::uuid IS NULL OR s.subscriber_id = $2)
              AND ($3::boolean IS NULL OR i.is_hidden = $3)
              AND ($4::text IS NULL OR s.service_type = $4)
              AND (NOT $5 OR i.date_paid IS NULL)
              AND ($6::date IS NULL OR i.date_due >= $6)
              AND ($7::date IS NULL OR i.date_due <= $7)
            ORDER BY i.date_due NULLS LAST, i.date_end
            "#,
        )
        .bind(filter.subscription_id)
        .bind(filter.subscriber_id)
        .bind(filter.is_hidden)
        .bind(filter.service_type.map(|t| t.as_str()))
        .bind(filter.unpaid_only)
        .bind(filter.due_on_or_after)
        .bind(filter.due_on_or_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn list_line_items(&self, invoice_id: Uuid) -> Result<Vec<LineItem>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, LineItem>(
            r#"
            SELECT line_item_id, invoice_id, product_rate_id, feature_rate_id, feature_type, base_description, base_cost, unit_description, unit_cost, quantity, applied_credit
            FROM line_items
            WHERE invoice_id = $1
            ORDER BY product_rate_id NULLS LAST, feature_type
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list line items", e))?;

        timer.observe_duration();

        Ok(items)
    }

    #[instrument(skip(self, draft), fields(subscription_id = %draft.invoice.subscription_id, invoice_id = %draft.invoice.invoice_id))]
    async fn commit_invoice(&self, draft: &InvoiceDraft) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_invoice"])
            .start_timer();

        let invoice = &draft.invoice;
        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, subscription_id, date_start, date_end, date_due, date_paid, tax_rate, subtotal, applied_tax, applied_credit, balance, is_hidden, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (subscription_id, date_start, date_end) DO NOTHING
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.subscription_id)
        .bind(invoice.date_start)
        .bind(invoice.date_end)
        .bind(invoice.date_due)
        .bind(invoice.date_paid)
        .bind(invoice.tax_rate)
        .bind(invoice.subtotal)
        .bind(invoice.applied_tax)
        .bind(invoice.applied_credit)
        .bind(invoice.balance)
        .bind(invoice.is_hidden)
        .bind(invoice.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| AccountingError::database("Failed to create invoice", e))?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.ok();
            let existing = self
                .find_invoice(invoice.subscription_id, invoice.date_start, invoice.date_end)
                .await?
                .map(|i| i.invoice_id)
                .unwrap_or(invoice.invoice_id);
            warn!(invoice_id = %existing, "Invoice already exists for period");
            return Err(InvoiceError::AlreadyCreated {
                invoice_id: existing,
            }
            .into());
        }

        for item in &draft.line_items {
            sqlx::query(
                r#"
                INSERT INTO line_items (line_item_id, invoice_id, product_rate_id, feature_rate_id, feature_type, base_description, base_cost, unit_description, unit_cost, quantity, applied_credit)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(item.line_item_id)
            .bind(item.invoice_id)
            .bind(item.product_rate_id)
            .bind(item.feature_rate_id)
            .bind(&item.feature_type)
            .bind(&item.base_description)
            .bind(item.base_cost)
            .bind(&item.unit_description)
            .bind(item.unit_cost)
            .bind(item.quantity)
            .bind(item.applied_credit)
            .execute(&mut *tx)
            .await
            .map_err(|e| AccountingError::database("Failed to create line item", e))?;
        }

        for adjustment in &draft.subscription_adjustments {
            Self::insert_subscription_adjustment(&mut tx, adjustment).await?;
        }

        Self::post_in_tx(&mut tx, &draft.credit_postings).await?;
        Self::commit(tx).await?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice.invoice_id,
            balance = %invoice.balance,
            "Invoice committed"
        );

        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_invoice_paid(&self, invoice_id: Uuid, date_paid: NaiveDate) -> Result<Invoice> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_paid"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices SET date_paid = $2 WHERE invoice_id = $1 AND date_paid IS NULL RETURNING {}",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(date_paid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to mark invoice paid", e))?;

        timer.observe_duration();

        match invoice {
            Some(invoice) => Ok(invoice),
            None => match self.get_invoice(invoice_id).await? {
                Some(_) => Err(InvoiceError::AlreadyPaid(invoice_id).into()),
                None => Err(AccountingError::not_found("invoice", invoice_id)),
            },
        }
    }

    // =========================================================================
    // Automatic Update Rules
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_automatic_update_rules(
        &self,
        domain: &str,
        workflow: Option<RuleWorkflow>,
    ) -> Result<Vec<AutomaticUpdateRule>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_automatic_update_rules"])
            .start_timer();

        let rules = sqlx::query_as::<_, AutomaticUpdateRule>(
            r#"
            SELECT rule_id, domain, name, workflow, uses_survey, active, deleted, last_modified_utc
            FROM automatic_update_rules
            WHERE domain = $1 AND deleted = FALSE
              AND ($2::text IS NULL OR workflow = $2)
            ORDER BY name
            "#,
        )
        .bind(domain)
        .bind(workflow.map(|w| w.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list automatic update rules", e))?;

        timer.observe_duration();

        Ok(rules)
    }

    #[instrument(
        skip(self),
        fields(workflow = selector.workflow.as_str(), survey_only = selector.survey_only)
    )]
    async fn deactivate_automatic_update_rules(
        &self,
        domain: &str,
        selector: RuleSelector,
    ) -> Result<u64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_automatic_update_rules"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE automatic_update_rules
            SET active = FALSE, last_modified_utc = $3
            WHERE domain = $1 AND workflow = $2 AND active = TRUE AND deleted = FALSE
              AND ($4 = FALSE OR uses_survey = TRUE)
            "#,
        )
        .bind(domain)
        .bind(selector.workflow.as_str())
        .bind(Utc::now())
        .bind(selector.survey_only)
        .execute(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to deactivate automatic update rules", e))?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AccountingError::database("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl UsageSource for Database {
    #[instrument(skip(self))]
    async fn active_user_count(&self, domain: &str) -> Result<i64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_user_count"])
            .start_timer();

        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT active_users
            FROM domain_user_counts
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to get active user count", e))?;

        timer.observe_duration();

        Ok(count.unwrap_or(0))
    }

    #[instrument(skip(self, domains), fields(domains = domains.len()))]
    async fn sms_billables(
        &self,
        domains: &[String],
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Vec<SmsBillable>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sms_billables"])
            .start_timer();

        let billables = sqlx::query_as::<_, SmsBillable>(
            r#"
            SELECT billable_id, domain, date_sent, multipart_count, gateway_charge, usage_charge, is_valid
            FROM sms_billables
            WHERE domain = ANY($1)
              AND is_valid = TRUE
              AND date_sent >= $2::date
              AND date_sent < ($3::date + 1)
            ORDER BY date_sent DESC
            "#,
        )
        .bind(domains)
        .bind(date_start)
        .bind(date_end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AccountingError::database("Failed to list SMS billables", e))?;

        timer.observe_duration();

        Ok(billables)
    }
}
