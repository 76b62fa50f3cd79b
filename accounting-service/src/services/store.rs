//! Storage seams for the accounting engine.
//!
//! `AccountingStore` owns every persisted accounting row. Multi-row writes
//! are exposed as single calls so each backend can make them atomic: one SQL
//! transaction in Postgres, one write lock in memory.

use crate::error::Result;
use crate::models::{
    AutomaticUpdateRule, BillingAccount, CreditAdjustment, CreditLine, CreditPosting,
    DefaultProductPlan, Invoice, InvoiceDraft, LineItem, ListCreditLinesFilter,
    ListInvoicesFilter, ListSubscriptionsFilter, PlanVersionDetail, RuleSelector, RuleWorkflow,
    SmsBillable, SoftwarePlan, SoftwarePlanEdition, Subscriber, Subscription,
    SubscriptionAdjustment,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

/// Subscription rows to upsert plus the audit rows and credit movements that
/// go with them.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChange {
    pub subscriptions: Vec<Subscription>,
    pub adjustments: Vec<SubscriptionAdjustment>,
    pub credit_postings: Vec<CreditPosting>,
}

impl SubscriptionChange {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.adjustments.is_empty()
            && self.credit_postings.is_empty()
    }
}

#[async_trait]
pub trait AccountingStore: Send + Sync {
    // Plan catalog
    async fn insert_plan(&self, plan: &SoftwarePlan) -> Result<()>;
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<SoftwarePlan>>;
    async fn list_plans(&self) -> Result<Vec<SoftwarePlan>>;
    /// Insert a version with its rates. Fails when the version number is
    /// already taken for the plan.
    async fn insert_plan_version(&self, detail: &PlanVersionDetail) -> Result<()>;
    async fn get_plan_version(&self, version_id: Uuid) -> Result<Option<PlanVersionDetail>>;
    async fn latest_plan_version(&self, plan_id: Uuid) -> Result<Option<PlanVersionDetail>>;
    async fn set_default_plan(&self, default_plan: &DefaultProductPlan) -> Result<()>;
    async fn get_default_plan(
        &self,
        edition: SoftwarePlanEdition,
    ) -> Result<Option<DefaultProductPlan>>;

    // Accounts and subscribers
    async fn insert_account(&self, account: &BillingAccount) -> Result<()>;
    async fn get_account(&self, account_id: Uuid) -> Result<Option<BillingAccount>>;
    /// Oldest active account created for `domain`.
    async fn find_account_for_domain(&self, domain: &str) -> Result<Option<BillingAccount>>;
    async fn get_or_create_subscriber(&self, domain: &str) -> Result<Subscriber>;
    async fn get_subscriber(&self, subscriber_id: Uuid) -> Result<Option<Subscriber>>;
    async fn find_subscriber(&self, domain: &str) -> Result<Option<Subscriber>>;
    async fn list_subscribers(&self) -> Result<Vec<Subscriber>>;

    // Subscriptions
    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>>;
    /// Ordered by `date_start`, then `date_end` with open ends last.
    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>>;
    async fn apply_subscription_change(&self, change: &SubscriptionChange) -> Result<()>;
    async fn list_subscription_adjustments(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionAdjustment>>;

    // Credits
    async fn get_credit_line(&self, credit_line_id: Uuid) -> Result<Option<CreditLine>>;
    async fn list_credit_lines(&self, filter: &ListCreditLinesFilter) -> Result<Vec<CreditLine>>;
    async fn list_credit_adjustments(&self, credit_line_id: Uuid)
        -> Result<Vec<CreditAdjustment>>;
    /// Apply every posting or none. A posting that would drive its line
    /// negative is rejected with a credit line error.
    async fn post_credit_adjustments(&self, postings: &[CreditPosting]) -> Result<()>;

    // Invoices
    async fn find_invoice(
        &self,
        subscription_id: Uuid,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Option<Invoice>>;
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>>;
    /// Ordered by `date_due` with undated invoices last.
    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> Result<Vec<Invoice>>;
    async fn list_line_items(&self, invoice_id: Uuid) -> Result<Vec<LineItem>>;
    /// Persist the invoice, its line items and credit postings together.
    /// A second invoice for the same (subscription, start, end) is rejected
    /// with `InvoiceError::AlreadyCreated`.
    async fn commit_invoice(&self, draft: &InvoiceDraft) -> Result<()>;
    async fn mark_invoice_paid(&self, invoice_id: Uuid, date_paid: NaiveDate) -> Result<Invoice>;

    // Automatic update rules
    async fn list_automatic_update_rules(
        &self,
        domain: &str,
        workflow: Option<RuleWorkflow>,
    ) -> Result<Vec<AutomaticUpdateRule>>;
    /// Deactivate the live rules picked by `selector`. Returns how many changed.
    async fn deactivate_automatic_update_rules(
        &self,
        domain: &str,
        selector: RuleSelector,
    ) -> Result<u64>;

    async fn health_check(&self) -> Result<()>;
}

/// Usage counters read by the invoicing run.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn active_user_count(&self, domain: &str) -> Result<i64>;

    /// Valid billables for `domains` sent between `date_start` and
    /// `date_end` inclusive, newest first.
    async fn sms_billables(
        &self,
        domains: &[String],
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Vec<SmsBillable>>;
}
