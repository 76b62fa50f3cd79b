//! Subscription lifecycle.
//!
//! Every change is assembled as one [`SubscriptionChange`] (rows, audit
//! adjustments and credit movements) and committed in a single store call.
//! Privilege side effects run after the commit.

use crate::catalog::PlanCatalog;
use crate::credits::CreditPlanner;
use crate::error::{AccountingError, Result};
use crate::models::{
    BillingAccount, CreateBillingAccount, ListSubscriptionsFilter, PlanVersionDetail,
    Subscriber, Subscription, SubscriptionAdjustment, SubscriptionAdjustmentMethod,
    SubscriptionAdjustmentReason, SubscriptionOptions, SubscriptionState, SubscriptionType,
};
use crate::services::{record_error, record_subscription_adjustment, AccountingStore, SubscriptionChange};
use crate::subscription_changes::{
    get_change_status, DowngradeActionHandler, DowngradeStatusHandler,
};
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Who is making a change and why.
#[derive(Debug, Clone)]
pub struct ChangeContext {
    pub note: Option<String>,
    pub web_user: Option<String>,
    pub method: SubscriptionAdjustmentMethod,
}

impl ChangeContext {
    pub fn new(method: SubscriptionAdjustmentMethod) -> Self {
        Self {
            note: None,
            web_user: None,
            method,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn by_user(mut self, web_user: impl Into<String>) -> Self {
        self.web_user = Some(web_user.into());
        self
    }
}

impl Default for ChangeContext {
    fn default() -> Self {
        Self::new(SubscriptionAdjustmentMethod::Internal)
    }
}

/// Request to subscribe a domain to a plan version.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub account_id: Uuid,
    pub domain: String,
    pub plan_version_id: Uuid,
    pub date_start: NaiveDate,
    pub date_end: Option<NaiveDate>,
    pub options: SubscriptionOptions,
}

fn adjustment(
    subscription: &Subscription,
    reason: SubscriptionAdjustmentReason,
    context: &ChangeContext,
    related_subscription_id: Option<Uuid>,
) -> SubscriptionAdjustment {
    SubscriptionAdjustment {
        adjustment_id: Uuid::new_v4(),
        subscription_id: subscription.subscription_id,
        reason: reason.as_str().to_string(),
        method: context.method.as_str().to_string(),
        note: context.note.clone(),
        web_user: context.web_user.clone(),
        invoice_id: None,
        related_subscription_id,
        new_date_start: subscription.date_start,
        new_date_end: subscription.date_end,
        created_utc: Utc::now(),
    }
}

/// Copy of `from` on a new plan version and date range, keeping its
/// invoicing flags.
fn successor(
    from: &Subscription,
    plan_version_id: Uuid,
    date_start: NaiveDate,
    date_end: Option<NaiveDate>,
) -> Subscription {
    let now = Utc::now();
    Subscription {
        subscription_id: Uuid::new_v4(),
        account_id: from.account_id,
        subscriber_id: from.subscriber_id,
        plan_version_id,
        date_start,
        date_end,
        is_active: false,
        is_trial: false,
        do_not_invoice: from.do_not_invoice,
        auto_generate_credits: from.auto_generate_credits,
        skip_invoicing_if_no_feature_charges: from.skip_invoicing_if_no_feature_charges,
        skip_auto_downgrade: from.skip_auto_downgrade,
        service_type: from.service_type.clone(),
        next_subscription_id: None,
        created_utc: now,
        updated_utc: now,
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn AccountingStore>,
    catalog: PlanCatalog,
    downgrade_handler: DowngradeActionHandler,
    status_handler: DowngradeStatusHandler,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn AccountingStore>, catalog: PlanCatalog) -> Self {
        Self {
            downgrade_handler: DowngradeActionHandler::new(store.clone()),
            status_handler: DowngradeStatusHandler::new(store.clone()),
            store,
            catalog,
        }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_account(&self, input: CreateBillingAccount) -> Result<BillingAccount> {
        if input.name.trim().is_empty() {
            return Err(AccountingError::Validation(
                "account name must not be empty".to_string(),
            ));
        }
        let account = BillingAccount {
            account_id: Uuid::new_v4(),
            name: input.name,
            currency: input.currency,
            created_by: input.created_by,
            created_by_domain: input.created_by_domain,
            is_active: true,
            auto_pay_enabled: input.auto_pay_enabled,
            date_confirmed_extra_charges: input.date_confirmed_extra_charges,
            tax_rate: input.tax_rate,
            contact_emails: input.contact_emails,
            created_utc: Utc::now(),
        };
        self.store.insert_account(&account).await?;
        info!(account_id = %account.account_id, "Billing account created");
        Ok(account)
    }

    pub async fn get_or_create_account_for_domain(
        &self,
        domain: &str,
        created_by: &str,
    ) -> Result<BillingAccount> {
        if let Some(account) = self.store.find_account_for_domain(domain).await? {
            return Ok(account);
        }
        self.create_account(CreateBillingAccount::for_domain(domain, created_by))
            .await
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<BillingAccount> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("billing account", account_id))
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn get_subscription(&self, subscription_id: Uuid) -> Result<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("subscription", subscription_id))
    }

    async fn subscriber_of(&self, subscription: &Subscription) -> Result<Subscriber> {
        self.store
            .get_subscriber(subscription.subscriber_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("subscriber", subscription.subscriber_id))
    }

    pub async fn subscriptions_for_domain(&self, domain: &str) -> Result<Vec<Subscription>> {
        match self.store.find_subscriber(domain).await? {
            Some(subscriber) => {
                self.store
                    .list_subscriptions(&ListSubscriptionsFilter {
                        subscriber_id: Some(subscriber.subscriber_id),
                        ..Default::default()
                    })
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn active_subscription_for_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .subscriptions_for_domain(domain)
            .await?
            .into_iter()
            .find(|s| s.is_active))
    }

    pub async fn list_adjustments(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionAdjustment>> {
        self.store.list_subscription_adjustments(subscription_id).await
    }

    /// Subscriptions of `subscriber_id` other than `exclude` whose range
    /// intersects `[date_start, date_end)`.
    async fn overlapping(
        &self,
        subscriber_id: Uuid,
        date_start: NaiveDate,
        date_end: Option<NaiveDate>,
        exclude: &[Uuid],
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                subscriber_id: Some(subscriber_id),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| !exclude.contains(&s.subscription_id))
            .filter(|s| !s.is_empty_range() && s.overlaps(date_start, date_end))
            .collect())
    }

    async fn commit(&self, change: &SubscriptionChange) -> Result<()> {
        self.store.apply_subscription_change(change).await?;
        for adjustment in &change.adjustments {
            record_subscription_adjustment(&adjustment.reason, &adjustment.method);
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self, input), fields(domain = %input.domain, plan_version_id = %input.plan_version_id))]
    pub async fn new_domain_subscription(
        &self,
        input: NewSubscription,
        today: NaiveDate,
    ) -> Result<Subscription> {
        if let Some(end) = input.date_end {
            if end <= input.date_start {
                return Err(AccountingError::NewSubscription(format!(
                    "date_end {} must be after date_start {}",
                    end, input.date_start
                )));
            }
        }
        self.get_account(input.account_id).await?;
        let version = self.catalog.get_version(input.plan_version_id).await?;
        let subscriber = self.store.get_or_create_subscriber(&input.domain).await?;

        let conflicts = self
            .overlapping(subscriber.subscriber_id, input.date_start, input.date_end, &[])
            .await?;
        if let Some(conflict) = conflicts.first() {
            return Err(AccountingError::NewSubscription(format!(
                "{} already has subscription {} between {} and {}",
                input.domain,
                conflict.subscription_id,
                conflict.date_start,
                conflict
                    .date_end
                    .map_or_else(|| "open end".to_string(), |d| d.to_string())
            )));
        }

        let now = Utc::now();
        let options = input.options;
        let mut subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            account_id: input.account_id,
            subscriber_id: subscriber.subscriber_id,
            plan_version_id: version.version_id(),
            date_start: input.date_start,
            date_end: input.date_end,
            is_active: false,
            is_trial: options.is_trial,
            do_not_invoice: options.do_not_invoice,
            auto_generate_credits: options.auto_generate_credits,
            skip_invoicing_if_no_feature_charges: options.skip_invoicing_if_no_feature_charges,
            skip_auto_downgrade: options.skip_auto_downgrade,
            service_type: options.service_type.as_str().to_string(),
            next_subscription_id: None,
            created_utc: now,
            updated_utc: now,
        };
        subscription.is_active = subscription.covers(today);

        let context = ChangeContext {
            note: options.note,
            web_user: options.web_user,
            method: options.adjustment_method,
        };
        let change = SubscriptionChange {
            adjustments: vec![adjustment(
                &subscription,
                SubscriptionAdjustmentReason::Create,
                &context,
                None,
            )],
            subscriptions: vec![subscription.clone()],
            credit_postings: Vec::new(),
        };
        self.commit(&change).await?;

        info!(
            subscription_id = %subscription.subscription_id,
            is_active = subscription.is_active,
            "Subscription created"
        );
        if subscription.is_active {
            log_upgrades(&subscriber.domain, None, &version);
        }
        Ok(subscription)
    }

    /// End `subscription_id` today and continue on `new_plan_version_id`.
    #[instrument(skip(self, context))]
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan_version_id: Uuid,
        date_end: Option<NaiveDate>,
        context: ChangeContext,
        today: NaiveDate,
    ) -> Result<Subscription> {
        let mut current = self.get_subscription(subscription_id).await?;
        if !current.is_active || current.date_end.is_some_and(|end| end <= today) {
            return Err(AccountingError::SubscriptionChange(format!(
                "subscription {} is not active and cannot change plans",
                subscription_id
            )));
        }
        if date_end.is_some_and(|end| end <= today) {
            return Err(AccountingError::SubscriptionChange(format!(
                "new date_end must be after {}",
                today
            )));
        }

        let old_version = self.catalog.get_version(current.plan_version_id).await?;
        let new_version = self.catalog.get_version(new_plan_version_id).await?;
        let subscriber = self.subscriber_of(&current).await?;
        let status = get_change_status(Some(&old_version), &new_version);

        if let Some(conflict) = self
            .overlapping(
                current.subscriber_id,
                today,
                date_end,
                &[current.subscription_id],
            )
            .await?
            .first()
        {
            return Err(AccountingError::SubscriptionChange(format!(
                "{} already has subscription {} starting {}",
                subscriber.domain, conflict.subscription_id, conflict.date_start
            )));
        }

        let mut next = successor(&current, new_version.version_id(), today, date_end);
        next.is_active = true;

        current.date_end = Some(today);
        current.is_active = false;
        current.next_subscription_id = Some(next.subscription_id);

        let mut planner = CreditPlanner::for_account(self.store.as_ref(), current.account_id).await?;
        planner.transfer_subscription_credits(&current, Some(&next), context.web_user.as_deref())?;

        let change = SubscriptionChange {
            adjustments: vec![adjustment(
                &current,
                status.reason,
                &context,
                Some(next.subscription_id),
            )],
            subscriptions: vec![current.clone(), next.clone()],
            credit_postings: planner.into_postings(),
        };
        self.commit(&change).await?;

        info!(
            old_subscription_id = %current.subscription_id,
            new_subscription_id = %next.subscription_id,
            reason = status.reason.as_str(),
            "Subscription plan changed"
        );
        self.downgrade_handler
            .apply(&subscriber.domain, &status.downgraded_privileges)
            .await;
        log_upgrades(&subscriber.domain, Some(&old_version), &new_version);
        Ok(next)
    }

    /// Schedule a successor starting on the current `date_end`. Without an
    /// explicit version the plan's latest version is used.
    #[instrument(skip(self, context))]
    pub async fn renew_subscription(
        &self,
        subscription_id: Uuid,
        plan_version_id: Option<Uuid>,
        context: ChangeContext,
    ) -> Result<Subscription> {
        let mut current = self.get_subscription(subscription_id).await?;
        let Some(date_end) = current.date_end else {
            return Err(AccountingError::SubscriptionRenewal(
                "Cannot renew a subscription with no date_end set.".to_string(),
            ));
        };
        if current.next_subscription_id.is_some() {
            return Err(AccountingError::SubscriptionRenewal(format!(
                "subscription {} has already been renewed",
                subscription_id
            )));
        }

        let version = match plan_version_id {
            Some(version_id) => self.catalog.get_version(version_id).await?,
            None => {
                let current_version = self.catalog.get_version(current.plan_version_id).await?;
                self.catalog.latest_version(current_version.plan.plan_id).await?
            }
        };

        if let Some(conflict) = self
            .overlapping(
                current.subscriber_id,
                date_end,
                None,
                &[current.subscription_id],
            )
            .await?
            .first()
        {
            return Err(AccountingError::SubscriptionRenewal(format!(
                "subscription {} already covers {}",
                conflict.subscription_id, date_end
            )));
        }

        let next = successor(&current, version.version_id(), date_end, None);
        current.next_subscription_id = Some(next.subscription_id);

        let change = SubscriptionChange {
            adjustments: vec![adjustment(
                &current,
                SubscriptionAdjustmentReason::Renewal,
                &context,
                Some(next.subscription_id),
            )],
            subscriptions: vec![current.clone(), next.clone()],
            credit_postings: Vec::new(),
        };
        self.commit(&change).await?;

        info!(
            subscription_id = %current.subscription_id,
            renewal_id = %next.subscription_id,
            date_start = %next.date_start,
            "Subscription renewed"
        );
        Ok(next)
    }

    /// What moving `domain` from its active subscription to
    /// `new_plan_version_id` would switch off. Empty when nothing is lost.
    pub async fn plan_change_messages(
        &self,
        domain: &str,
        new_plan_version_id: Uuid,
    ) -> Result<Vec<String>> {
        let new_version = self.catalog.get_version(new_plan_version_id).await?;
        let current_version = match self.active_subscription_for_domain(domain).await? {
            Some(current) => Some(self.catalog.get_version(current.plan_version_id).await?),
            None => None,
        };
        let status = get_change_status(current_version.as_ref(), &new_version);
        self.status_handler
            .messages(domain, &status.downgraded_privileges)
            .await
    }

    /// End a subscription on `date_end` (today by default). An end on or
    /// before today takes effect immediately and falls back to community.
    /// Cancelling can only shorten a subscription that has not ended yet.
    #[instrument(skip(self, context))]
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        date_end: Option<NaiveDate>,
        context: ChangeContext,
        today: NaiveDate,
    ) -> Result<Subscription> {
        let mut subscription = self.get_subscription(subscription_id).await?;
        if let Some(current_end) = subscription.date_end {
            if current_end <= today {
                return Err(AccountingError::SubscriptionChange(format!(
                    "subscription {} already ended on {}",
                    subscription_id, current_end
                )));
            }
        }
        let date_end = date_end.unwrap_or(today);
        if subscription.date_end.is_some_and(|current_end| date_end > current_end) {
            return Err(AccountingError::SubscriptionChange(format!(
                "cannot cancel subscription {} on {}, after its end date",
                subscription_id, date_end
            )));
        }
        if subscription.date_start > date_end {
            subscription.date_start = date_end;
        }
        let conflicts = if subscription.date_start < date_end {
            self.overlapping(
                subscription.subscriber_id,
                subscription.date_start,
                Some(date_end),
                &[subscription.subscription_id],
            )
            .await?
        } else {
            Vec::new()
        };
        if let Some(conflict) = conflicts.first() {
            return Err(AccountingError::SubscriptionChange(format!(
                "cancelling on {} would overlap subscription {}",
                date_end, conflict.subscription_id
            )));
        }
        subscription.date_end = Some(date_end);

        let ends_now = date_end <= today;
        let was_active = subscription.is_active;
        if ends_now {
            subscription.is_active = false;
        }

        let mut change = SubscriptionChange {
            adjustments: vec![adjustment(
                &subscription,
                SubscriptionAdjustmentReason::Cancel,
                &context,
                None,
            )],
            subscriptions: vec![subscription.clone()],
            credit_postings: Vec::new(),
        };
        if ends_now {
            let mut planner =
                CreditPlanner::for_account(self.store.as_ref(), subscription.account_id).await?;
            planner.transfer_subscription_credits(&subscription, None, context.web_user.as_deref())?;
            change.credit_postings = planner.into_postings();
        }
        self.commit(&change).await?;
        info!(
            subscription_id = %subscription.subscription_id,
            date_end = %date_end,
            "Subscription cancelled"
        );

        if ends_now && was_active {
            let subscriber = self.subscriber_of(&subscription).await?;
            let community = self.catalog.community_plan_version().await?;
            let status = get_change_status(
                Some(&self.catalog.get_version(subscription.plan_version_id).await?),
                &community,
            );
            self.downgrade_handler
                .apply(&subscriber.domain, &status.downgraded_privileges)
                .await;
            self.ensure_explicit_community_subscription(
                &subscriber.domain,
                date_end,
                SubscriptionAdjustmentMethod::DefaultCommunity,
                today,
            )
            .await?;
        }
        Ok(subscription)
    }

    #[instrument(skip(self, context))]
    pub async fn modify_dates(
        &self,
        subscription_id: Uuid,
        date_start: NaiveDate,
        date_end: Option<NaiveDate>,
        context: ChangeContext,
        today: NaiveDate,
    ) -> Result<Subscription> {
        if date_end.is_some_and(|end| end <= date_start) {
            return Err(AccountingError::SubscriptionChange(format!(
                "date_end must be after date_start {}",
                date_start
            )));
        }
        let mut subscription = self.get_subscription(subscription_id).await?;
        if let Some(conflict) = self
            .overlapping(
                subscription.subscriber_id,
                date_start,
                date_end,
                &[subscription.subscription_id],
            )
            .await?
            .first()
        {
            return Err(AccountingError::SubscriptionChange(format!(
                "new dates overlap subscription {}",
                conflict.subscription_id
            )));
        }

        let was_active = subscription.is_active;
        subscription.date_start = date_start;
        subscription.date_end = date_end;
        let record = adjustment(
            &subscription,
            SubscriptionAdjustmentReason::Modify,
            &context,
            None,
        );

        // Ending an active subscription hands the domain on the same way the
        // daily deactivation does.
        if was_active && date_end.is_some_and(|end| end <= today) {
            return self.end_subscription(subscription, vec![record], today).await;
        }

        subscription.is_active = subscription.covers(today);
        let change = SubscriptionChange {
            adjustments: vec![record],
            subscriptions: vec![subscription.clone()],
            credit_postings: Vec::new(),
        };
        self.commit(&change).await?;
        Ok(subscription)
    }

    pub async fn state(&self, subscription_id: Uuid, today: NaiveDate) -> Result<SubscriptionState> {
        let subscription = self.get_subscription(subscription_id).await?;
        if subscription.date_start > today {
            return Ok(SubscriptionState::Pending);
        }
        if subscription.covers(today) {
            return Ok(SubscriptionState::Active);
        }
        if subscription.next_subscription_id.is_some() {
            return Ok(SubscriptionState::Renewed);
        }
        let cancelled = self
            .list_adjustments(subscription_id)
            .await?
            .iter()
            .any(|a| a.parsed_reason() == SubscriptionAdjustmentReason::Cancel);
        Ok(if cancelled {
            SubscriptionState::Cancelled
        } else {
            SubscriptionState::Ended
        })
    }

    // =========================================================================
    // Community fallback
    // =========================================================================

    /// Community subscription for `subscriber` from `date_start` up to the
    /// start of its next scheduled subscription.
    async fn build_explicit_community(
        &self,
        subscriber: &Subscriber,
        account_id: Uuid,
        date_start: NaiveDate,
        method: SubscriptionAdjustmentMethod,
        today: NaiveDate,
        ending: Option<Uuid>,
    ) -> Result<(Subscription, SubscriptionAdjustment)> {
        let community = self.catalog.community_plan_version().await?;
        let future_start = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                subscriber_id: Some(subscriber.subscriber_id),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| !s.is_empty_range() && s.date_start > date_start)
            .map(|s| s.date_start)
            .min();

        // The subscription being ended is stored with its old dates until the
        // change commits.
        let exclude: Vec<Uuid> = ending.into_iter().collect();
        let conflicts = self
            .overlapping(subscriber.subscriber_id, date_start, future_start, &exclude)
            .await?;
        if let Some(conflict) = conflicts.first() {
            return Err(AccountingError::NewSubscription(format!(
                "{} already has subscription {} on {}",
                subscriber.domain, conflict.subscription_id, date_start
            )));
        }

        let now = Utc::now();
        let mut subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            account_id,
            subscriber_id: subscriber.subscriber_id,
            plan_version_id: community.version_id(),
            date_start,
            date_end: future_start,
            is_active: false,
            is_trial: false,
            do_not_invoice: false,
            auto_generate_credits: false,
            skip_invoicing_if_no_feature_charges: true,
            skip_auto_downgrade: false,
            service_type: SubscriptionType::Product.as_str().to_string(),
            next_subscription_id: None,
            created_utc: now,
            updated_utc: now,
        };
        subscription.is_active = subscription.covers(today);
        let record = adjustment(
            &subscription,
            SubscriptionAdjustmentReason::Create,
            &ChangeContext::new(method),
            None,
        );
        Ok((subscription, record))
    }

    #[instrument(skip(self))]
    pub async fn assign_explicit_community_subscription(
        &self,
        domain: &str,
        date_start: NaiveDate,
        method: SubscriptionAdjustmentMethod,
        account_id: Option<Uuid>,
        today: NaiveDate,
    ) -> Result<Subscription> {
        let account_id = match account_id {
            Some(account_id) => account_id,
            None => {
                self.get_or_create_account_for_domain(domain, method.as_str())
                    .await?
                    .account_id
            }
        };
        let subscriber = self.store.get_or_create_subscriber(domain).await?;
        let (subscription, record) = self
            .build_explicit_community(&subscriber, account_id, date_start, method, today, None)
            .await?;
        self.commit(&SubscriptionChange {
            subscriptions: vec![subscription.clone()],
            adjustments: vec![record],
            credit_postings: Vec::new(),
        })
        .await?;
        info!(
            domain = %domain,
            subscription_id = %subscription.subscription_id,
            "Community subscription assigned"
        );
        Ok(subscription)
    }

    /// Assign community from `from_date` unless something already covers it.
    pub async fn ensure_explicit_community_subscription(
        &self,
        domain: &str,
        from_date: NaiveDate,
        method: SubscriptionAdjustmentMethod,
        today: NaiveDate,
    ) -> Result<Option<Subscription>> {
        let covered = self
            .subscriptions_for_domain(domain)
            .await?
            .iter()
            .any(|s| !s.is_empty_range() && s.covers(from_date));
        if covered {
            return Ok(None);
        }
        self.assign_explicit_community_subscription(domain, from_date, method, None, today)
            .await
            .map(Some)
    }

    // =========================================================================
    // Daily activation
    // =========================================================================

    /// Activate inactive subscriptions starting on `based_on_date`, or every
    /// one covering `today` when no date is given. Returns how many were
    /// activated.
    #[instrument(skip(self))]
    pub async fn activate_subscriptions(
        &self,
        based_on_date: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<usize> {
        let starting: Vec<Subscription> = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                is_active: Some(false),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| !s.is_empty_range())
            .filter(|s| match based_on_date {
                Some(date) => s.date_start == date,
                None => s.covers(today),
            })
            .collect();

        let mut activated = 0;
        for subscription in starting {
            match self.activate_one(subscription.clone()).await {
                Ok(()) => activated += 1,
                Err(e) => {
                    record_error(e.kind(), "activate_subscription");
                    error!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Error activating subscription"
                    );
                }
            }
        }
        Ok(activated)
    }

    async fn activate_one(&self, mut subscription: Subscription) -> Result<()> {
        subscription.is_active = true;
        self.commit(&SubscriptionChange {
            subscriptions: vec![subscription.clone()],
            ..Default::default()
        })
        .await?;
        let version = self.catalog.get_version(subscription.plan_version_id).await?;
        let subscriber = self.subscriber_of(&subscription).await?;
        info!(subscription_id = %subscription.subscription_id, "Subscription activated");
        log_upgrades(&subscriber.domain, None, &version);
        Ok(())
    }

    /// Deactivate active subscriptions ending on `based_on_date`, or on or
    /// before `today` when no date is given. Returns how many ended.
    #[instrument(skip(self))]
    pub async fn deactivate_subscriptions(
        &self,
        based_on_date: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<usize> {
        let ending: Vec<Subscription> = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                is_active: Some(true),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| match (s.date_end, based_on_date) {
                (Some(end), Some(date)) => end == date,
                (Some(end), None) => end <= today,
                (None, _) => false,
            })
            .collect();

        let mut deactivated = 0;
        for subscription in ending {
            match self
                .end_subscription(subscription.clone(), Vec::new(), today)
                .await
            {
                Ok(_) => deactivated += 1,
                Err(e) => {
                    record_error(e.kind(), "deactivate_subscription");
                    error!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Error deactivating subscription"
                    );
                }
            }
        }
        Ok(deactivated)
    }

    /// Deactivate `subscription` at its end date and activate what follows:
    /// its contiguous successor or a community subscription. Credits move to
    /// the follower and lost privileges are handled. `adjustments` commit in
    /// the same change.
    async fn end_subscription(
        &self,
        mut subscription: Subscription,
        mut adjustments: Vec<SubscriptionAdjustment>,
        today: NaiveDate,
    ) -> Result<Subscription> {
        let Some(date_end) = subscription.date_end else {
            return Err(AccountingError::SubscriptionChange(format!(
                "subscription {} has no end date",
                subscription.subscription_id
            )));
        };
        subscription.is_active = false;
        let subscriber = self.subscriber_of(&subscription).await?;

        let contiguous = match subscription.next_subscription_id {
            Some(next_id) => self
                .store
                .get_subscription(next_id)
                .await?
                .filter(|next| next.date_start == date_end),
            // An unlinked subscription may already be scheduled to start on
            // the end date.
            None => self
                .store
                .list_subscriptions(&ListSubscriptionsFilter {
                    subscriber_id: Some(subscription.subscriber_id),
                    is_active: Some(false),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .find(|s| s.date_start == date_end && !s.is_empty_range()),
        };

        let next = match contiguous {
            Some(mut next) => {
                next.is_active = true;
                next
            }
            None => {
                let (community, record) = self
                    .build_explicit_community(
                        &subscriber,
                        subscription.account_id,
                        date_end,
                        SubscriptionAdjustmentMethod::DefaultCommunity,
                        today,
                        Some(subscription.subscription_id),
                    )
                    .await?;
                adjustments.push(record);
                community
            }
        };

        let mut planner =
            CreditPlanner::for_account(self.store.as_ref(), subscription.account_id).await?;
        planner.transfer_subscription_credits(&subscription, Some(&next), None)?;

        let change = SubscriptionChange {
            subscriptions: vec![subscription.clone(), next.clone()],
            adjustments,
            credit_postings: planner.into_postings(),
        };
        self.commit(&change).await?;

        let old_version = self.catalog.get_version(subscription.plan_version_id).await?;
        let new_version = self.catalog.get_version(next.plan_version_id).await?;
        let status = get_change_status(Some(&old_version), &new_version);
        info!(
            subscription_id = %subscription.subscription_id,
            next_subscription_id = %next.subscription_id,
            "Subscription deactivated"
        );
        self.downgrade_handler
            .apply(&subscriber.domain, &status.downgraded_privileges)
            .await;
        Ok(subscription)
    }

    // =========================================================================
    // Consistency warnings
    // =========================================================================

    /// Active subscriptions whose end date has passed.
    pub async fn warn_subscriptions_still_active(&self, today: NaiveDate) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                is_active: Some(true),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| s.date_end.is_some_and(|end| end <= today))
            .map(|s| s.subscription_id)
            .collect();
        for id in &ids {
            error!(subscription_id = %id, "Subscription is still active after its end date");
        }
        Ok(ids)
    }

    /// Inactive subscriptions that cover `today`.
    pub async fn warn_subscriptions_not_active(&self, today: NaiveDate) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                is_active: Some(false),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|s| s.covers(today))
            .map(|s| s.subscription_id)
            .collect();
        for id in &ids {
            error!(subscription_id = %id, "Subscription is not active");
        }
        Ok(ids)
    }

    /// Domains with more than one active subscription, or none at all.
    pub async fn warn_active_subscriptions_per_domain_not_one(&self) -> Result<Vec<String>> {
        let active = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                is_active: Some(true),
                ..Default::default()
            })
            .await?;
        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for subscription in &active {
            *counts.entry(subscription.subscriber_id).or_default() += 1;
        }

        let mut flagged = Vec::new();
        for subscriber in self.store.list_subscribers().await? {
            match counts.get(&subscriber.subscriber_id).copied().unwrap_or(0) {
                0 => {
                    warn!(domain = %subscriber.domain, "There is no active subscription for domain");
                    flagged.push(subscriber.domain);
                }
                1 => {}
                count => {
                    error!(
                        domain = %subscriber.domain,
                        count,
                        "Multiple active subscriptions found for domain"
                    );
                    flagged.push(subscriber.domain);
                }
            }
        }
        Ok(flagged)
    }
}

fn log_upgrades(domain: &str, from: Option<&PlanVersionDetail>, to: &PlanVersionDetail) {
    let status = get_change_status(from, to);
    if !status.upgraded_privileges.is_empty() {
        info!(
            domain = %domain,
            privileges = ?status.upgraded_privileges,
            "Privileges granted"
        );
    }
}
