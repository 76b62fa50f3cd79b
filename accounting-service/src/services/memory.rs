//! In-memory backends for the accounting store and usage source.
//!
//! All state lives behind one `tokio::sync::RwLock`, so every multi-row
//! write is atomic with respect to readers. Used by tests and local runs.

use crate::error::{AccountingError, InvoiceError, Result};
use crate::models::{
    AutomaticUpdateRule, BillingAccount, CreditAdjustment, CreditLine, CreditPosting,
    DefaultProductPlan, Invoice, InvoiceDraft, LineItem, ListCreditLinesFilter,
    ListInvoicesFilter, ListSubscriptionsFilter, PlanVersionDetail, RuleSelector, RuleWorkflow,
    SmsBillable, SoftwarePlan, SoftwarePlanEdition, Subscriber, Subscription,
    SubscriptionAdjustment,
};
use crate::services::store::{AccountingStore, SubscriptionChange, UsageSource};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, SoftwarePlan>,
    versions: HashMap<Uuid, PlanVersionDetail>,
    default_plans: HashMap<String, DefaultProductPlan>,
    accounts: HashMap<Uuid, BillingAccount>,
    subscribers: HashMap<Uuid, Subscriber>,
    subscriptions: HashMap<Uuid, Subscription>,
    subscription_adjustments: Vec<SubscriptionAdjustment>,
    credit_lines: HashMap<Uuid, CreditLine>,
    credit_adjustments: Vec<CreditAdjustment>,
    invoices: HashMap<Uuid, Invoice>,
    line_items: Vec<LineItem>,
    rules: Vec<AutomaticUpdateRule>,
}

impl State {
    /// Check every posting against running balances before anything is
    /// written.
    fn validate_postings(&self, postings: &[CreditPosting]) -> Result<()> {
        let mut balances: HashMap<Uuid, Decimal> = HashMap::new();
        for posting in postings {
            posting.adjustment.clean()?;
            let line_id = posting.line.credit_line_id;
            let current = match balances.get(&line_id) {
                Some(balance) => *balance,
                None => match self.credit_lines.get(&line_id) {
                    Some(line) => line.balance,
                    None if posting.is_new => Decimal::ZERO,
                    None => {
                        return Err(AccountingError::CreditLine(format!(
                            "credit line {} does not exist",
                            line_id
                        )))
                    }
                },
            };
            let next = current + posting.adjustment.amount;
            if posting.adjustment.amount < Decimal::ZERO && next < Decimal::ZERO {
                return Err(AccountingError::CreditLine(format!(
                    "credit line {} would have a negative balance of {}",
                    line_id, next
                )));
            }
            balances.insert(line_id, next);
        }
        Ok(())
    }

    fn apply_postings(&mut self, postings: &[CreditPosting]) {
        let now = Utc::now();
        for posting in postings {
            let line = self
                .credit_lines
                .entry(posting.line.credit_line_id)
                .or_insert_with(|| {
                    let mut line = posting.line.clone();
                    line.balance = Decimal::ZERO;
                    line
                });
            line.balance += posting.adjustment.amount;
            line.last_modified_utc = now;
            self.credit_adjustments.push(posting.adjustment.clone());
        }
    }
}

fn subscription_order(a: &Subscription, b: &Subscription) -> std::cmp::Ordering {
    a.date_start.cmp(&b.date_start).then_with(|| match (a.date_end, b.date_end) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    })
}

/// In-memory `AccountingStore`.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an automatic update rule.
    pub async fn insert_automatic_update_rule(&self, rule: AutomaticUpdateRule) {
        self.state.write().await.rules.push(rule);
    }

    /// Overwrite a credit line balance without a matching adjustment.
    /// Only useful to exercise the balance consistency check.
    pub async fn force_credit_line_balance(&self, credit_line_id: Uuid, balance: Decimal) {
        if let Some(line) = self.state.write().await.credit_lines.get_mut(&credit_line_id) {
            line.balance = balance;
        }
    }

    pub async fn all_credit_lines(&self) -> Vec<CreditLine> {
        self.state.read().await.credit_lines.values().cloned().collect()
    }
}

#[async_trait]
impl AccountingStore for InMemoryStore {
    async fn insert_plan(&self, plan: &SoftwarePlan) -> Result<()> {
        self.state
            .write()
            .await
            .plans
            .insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<SoftwarePlan>> {
        Ok(self.state.read().await.plans.get(&plan_id).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<SoftwarePlan>> {
        let state = self.state.read().await;
        let mut plans: Vec<SoftwarePlan> = state.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(plans)
    }

    async fn insert_plan_version(&self, detail: &PlanVersionDetail) -> Result<()> {
        let mut state = self.state.write().await;
        let taken = state.versions.values().any(|v| {
            v.version.plan_id == detail.version.plan_id && v.version.version == detail.version.version
        });
        if taken {
            return Err(AccountingError::Catalog(format!(
                "version {} of plan {} already exists",
                detail.version.version, detail.version.plan_id
            )));
        }
        state.versions.insert(detail.version_id(), detail.clone());
        Ok(())
    }

    async fn get_plan_version(&self, version_id: Uuid) -> Result<Option<PlanVersionDetail>> {
        Ok(self.state.read().await.versions.get(&version_id).cloned())
    }

    async fn latest_plan_version(&self, plan_id: Uuid) -> Result<Option<PlanVersionDetail>> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .values()
            .filter(|v| v.version.plan_id == plan_id)
            .max_by_key(|v| v.version.version)
            .cloned())
    }

    async fn set_default_plan(&self, default_plan: &DefaultProductPlan) -> Result<()> {
        self.state
            .write()
            .await
            .default_plans
            .insert(default_plan.edition.clone(), default_plan.clone());
        Ok(())
    }

    async fn get_default_plan(
        &self,
        edition: SoftwarePlanEdition,
    ) -> Result<Option<DefaultProductPlan>> {
        Ok(self
            .state
            .read()
            .await
            .default_plans
            .get(edition.as_str())
            .cloned())
    }

    async fn insert_account(&self, account: &BillingAccount) -> Result<()> {
        self.state
            .write()
            .await
            .accounts
            .insert(account.account_id, account.clone());
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<BillingAccount>> {
        Ok(self.state.read().await.accounts.get(&account_id).cloned())
    }

    async fn find_account_for_domain(&self, domain: &str) -> Result<Option<BillingAccount>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .values()
            .filter(|a| a.is_active && a.created_by_domain.as_deref() == Some(domain))
            .min_by_key(|a| a.created_utc)
            .cloned())
    }

    async fn get_or_create_subscriber(&self, domain: &str) -> Result<Subscriber> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.subscribers.values().find(|s| s.domain == domain) {
            return Ok(existing.clone());
        }
        let subscriber = Subscriber {
            subscriber_id: Uuid::new_v4(),
            domain: domain.to_string(),
            created_utc: Utc::now(),
        };
        state
            .subscribers
            .insert(subscriber.subscriber_id, subscriber.clone());
        Ok(subscriber)
    }

    async fn get_subscriber(&self, subscriber_id: Uuid) -> Result<Option<Subscriber>> {
        Ok(self.state.read().await.subscribers.get(&subscriber_id).cloned())
    }

    async fn find_subscriber(&self, domain: &str) -> Result<Option<Subscriber>> {
        let state = self.state.read().await;
        Ok(state.subscribers.values().find(|s| s.domain == domain).cloned())
    }

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        let state = self.state.read().await;
        let mut subscribers: Vec<Subscriber> = state.subscribers.values().cloned().collect();
        subscribers.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(subscribers)
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>> {
        let state = self.state.read().await;
        let mut subscriptions: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| filter.subscriber_id.map_or(true, |id| s.subscriber_id == id))
            .filter(|s| filter.account_id.map_or(true, |id| s.account_id == id))
            .filter(|s| filter.is_active.map_or(true, |active| s.is_active == active))
            .cloned()
            .collect();
        subscriptions.sort_by(subscription_order);
        Ok(subscriptions)
    }

    async fn apply_subscription_change(&self, change: &SubscriptionChange) -> Result<()> {
        let mut state = self.state.write().await;
        state.validate_postings(&change.credit_postings)?;
        let now = Utc::now();
        for subscription in &change.subscriptions {
            let mut row = subscription.clone();
            row.updated_utc = now;
            state.subscriptions.insert(row.subscription_id, row);
        }
        state
            .subscription_adjustments
            .extend(change.adjustments.iter().cloned());
        state.apply_postings(&change.credit_postings);
        Ok(())
    }

    async fn list_subscription_adjustments(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionAdjustment>> {
        let state = self.state.read().await;
        Ok(state
            .subscription_adjustments
            .iter()
            .filter(|a| a.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn get_credit_line(&self, credit_line_id: Uuid) -> Result<Option<CreditLine>> {
        Ok(self
            .state
            .read()
            .await
            .credit_lines
            .get(&credit_line_id)
            .cloned())
    }

    async fn list_credit_lines(&self, filter: &ListCreditLinesFilter) -> Result<Vec<CreditLine>> {
        let state = self.state.read().await;
        let mut lines: Vec<CreditLine> = state
            .credit_lines
            .values()
            .filter(|l| filter.account_id.map_or(true, |id| l.account_id == id))
            .filter(|l| {
                filter
                    .subscription_id
                    .map_or(true, |id| l.subscription_id == Some(id))
            })
            .filter(|l| !filter.account_scope_only || l.subscription_id.is_none())
            .filter(|l| !filter.active_only || l.is_active)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.created_utc);
        Ok(lines)
    }

    async fn list_credit_adjustments(
        &self,
        credit_line_id: Uuid,
    ) -> Result<Vec<CreditAdjustment>> {
        let state = self.state.read().await;
        Ok(state
            .credit_adjustments
            .iter()
            .filter(|a| a.credit_line_id == credit_line_id)
            .cloned()
            .collect())
    }

    async fn post_credit_adjustments(&self, postings: &[CreditPosting]) -> Result<()> {
        let mut state = self.state.write().await;
        state.validate_postings(postings)?;
        state.apply_postings(postings);
        Ok(())
    }

    async fn find_invoice(
        &self,
        subscription_id: Uuid,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Option<Invoice>> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.subscription_id == subscription_id
                    && i.date_start == date_start
                    && i.date_end == date_end
            })
            .cloned())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>> {
        Ok(self.state.read().await.invoices.get(&invoice_id).cloned())
    }

    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> Result<Vec<Invoice>> {
        let state = self.state.read().await;
        let subscription_matches = |invoice: &Invoice| -> bool {
            let Some(subscription) = state.subscriptions.get(&invoice.subscription_id) else {
                return filter.subscriber_id.is_none() && filter.service_type.is_none();
            };
            filter
                .subscriber_id
                .map_or(true, |id| subscription.subscriber_id == id)
                && filter
                    .service_type
                    .map_or(true, |t| subscription.parsed_service_type() == t)
        };
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| {
                filter
                    .subscription_id
                    .map_or(true, |id| i.subscription_id == id)
            })
            .filter(|i| filter.is_hidden.map_or(true, |hidden| i.is_hidden == hidden))
            .filter(|i| !filter.unpaid_only || i.date_paid.is_none())
            .filter(|i| {
                filter
                    .due_on_or_after
                    .map_or(true, |d| i.date_due.is_some_and(|due| due >= d))
            })
            .filter(|i| {
                filter
                    .due_on_or_before
                    .map_or(true, |d| i.date_due.is_some_and(|due| due <= d))
            })
            .filter(|i| subscription_matches(i))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| match (a.date_due, b.date_due) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.date_end.cmp(&b.date_end),
        });
        Ok(invoices)
    }

    async fn list_line_items(&self, invoice_id: Uuid) -> Result<Vec<LineItem>> {
        let state = self.state.read().await;
        Ok(state
            .line_items
            .iter()
            .filter(|l| l.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn commit_invoice(&self, draft: &InvoiceDraft) -> Result<()> {
        let mut state = self.state.write().await;
        let invoice = &draft.invoice;
        if let Some(existing) = state.invoices.values().find(|i| {
            i.subscription_id == invoice.subscription_id
                && i.date_start == invoice.date_start
                && i.date_end == invoice.date_end
        }) {
            return Err(InvoiceError::AlreadyCreated {
                invoice_id: existing.invoice_id,
            }
            .into());
        }
        state.validate_postings(&draft.credit_postings)?;
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        state.line_items.extend(draft.line_items.iter().cloned());
        state
            .subscription_adjustments
            .extend(draft.subscription_adjustments.iter().cloned());
        state.apply_postings(&draft.credit_postings);
        Ok(())
    }

    async fn mark_invoice_paid(&self, invoice_id: Uuid, date_paid: NaiveDate) -> Result<Invoice> {
        let mut state = self.state.write().await;
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| AccountingError::not_found("invoice", invoice_id))?;
        if invoice.is_paid() {
            return Err(InvoiceError::AlreadyPaid(invoice_id).into());
        }
        invoice.date_paid = Some(date_paid);
        Ok(invoice.clone())
    }

    async fn list_automatic_update_rules(
        &self,
        domain: &str,
        workflow: Option<RuleWorkflow>,
    ) -> Result<Vec<AutomaticUpdateRule>> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .iter()
            .filter(|r| r.domain == domain && !r.deleted)
            .filter(|r| workflow.map_or(true, |w| r.parsed_workflow() == w))
            .cloned()
            .collect())
    }

    async fn deactivate_automatic_update_rules(
        &self,
        domain: &str,
        selector: RuleSelector,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut changed = 0;
        for rule in state
            .rules
            .iter_mut()
            .filter(|r| r.domain == domain && r.matches(selector) && r.is_live())
        {
            rule.active = false;
            rule.last_modified_utc = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory `UsageSource`.
#[derive(Default)]
pub struct InMemoryUsage {
    users: RwLock<HashMap<String, i64>>,
    sms: RwLock<Vec<SmsBillable>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_active_users(&self, domain: &str, count: i64) {
        self.users.write().await.insert(domain.to_string(), count);
    }

    pub async fn record_sms(&self, billable: SmsBillable) {
        self.sms.write().await.push(billable);
    }
}

#[async_trait]
impl UsageSource for InMemoryUsage {
    async fn active_user_count(&self, domain: &str) -> Result<i64> {
        Ok(self.users.read().await.get(domain).copied().unwrap_or(0))
    }

    async fn sms_billables(
        &self,
        domains: &[String],
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<Vec<SmsBillable>> {
        let sms = self.sms.read().await;
        let mut billables: Vec<SmsBillable> = sms
            .iter()
            .filter(|b| b.is_valid && domains.contains(&b.domain))
            .filter(|b| {
                let day = b.date_sent.date_naive();
                day >= date_start && day <= date_end
            })
            .cloned()
            .collect();
        billables.sort_by(|a, b| b.date_sent.cmp(&a.date_sent));
        Ok(billables)
    }
}
