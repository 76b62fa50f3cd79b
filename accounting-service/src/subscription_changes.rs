//! Side effects of gaining or losing plan privileges.

use crate::error::Result;
use crate::models::{PlanVersionDetail, RuleSelector, RuleWorkflow, SubscriptionAdjustmentReason};
use crate::privileges;
use crate::services::AccountingStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Outcome of moving a domain from one plan version to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeStatus {
    pub reason: SubscriptionAdjustmentReason,
    /// Every privilege the new version does not grant.
    pub downgraded_privileges: Vec<String>,
    /// Privileges the new version grants that the old one did not.
    pub upgraded_privileges: Vec<String>,
}

pub fn get_change_status(
    from: Option<&PlanVersionDetail>,
    to: &PlanVersionDetail,
) -> ChangeStatus {
    let to_privileges: BTreeSet<&str> = to.version.privileges.iter().map(String::as_str).collect();
    let from_privileges: BTreeSet<&str> = from
        .map(|f| f.version.privileges.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let downgraded_privileges = privileges::MAX_PRIVILEGES
        .iter()
        .filter(|p| !to_privileges.contains(*p))
        .map(|p| p.to_string())
        .collect();
    let upgraded_privileges = to_privileges
        .difference(&from_privileges)
        .map(|p| p.to_string())
        .collect();

    let reason = match from {
        None => SubscriptionAdjustmentReason::Create,
        Some(_) => {
            let lost = from_privileges.difference(&to_privileges).next().is_some();
            let gained = to_privileges.difference(&from_privileges).next().is_some();
            match (lost, gained) {
                (true, false) => SubscriptionAdjustmentReason::Downgrade,
                (false, true) => SubscriptionAdjustmentReason::Upgrade,
                _ => SubscriptionAdjustmentReason::Switch,
            }
        }
    };

    ChangeStatus {
        reason,
        downgraded_privileges,
        upgraded_privileges,
    }
}

fn lost(downgraded_privileges: &[String], privilege: &str) -> bool {
    downgraded_privileges.iter().any(|p| p == privilege)
}

/// Rules that must stop once `downgraded_privileges` are gone. Losing
/// inbound SMS only stops survey reminders; outbound reminders keep running
/// while outbound SMS is still granted.
pub fn rules_to_deactivate(downgraded_privileges: &[String]) -> Vec<RuleSelector> {
    let mut selectors = Vec::new();
    if lost(downgraded_privileges, privileges::DATA_CLEANUP) {
        selectors.push(RuleSelector::all(RuleWorkflow::CaseUpdate));
    }
    if lost(downgraded_privileges, privileges::OUTBOUND_SMS) {
        selectors.push(RuleSelector::all(RuleWorkflow::Scheduling));
    } else if lost(downgraded_privileges, privileges::INBOUND_SMS) {
        selectors.push(RuleSelector::surveys());
    }
    selectors
}

/// Applies the consequences of lost privileges to a domain.
#[derive(Clone)]
pub struct DowngradeActionHandler {
    store: Arc<dyn AccountingStore>,
}

impl DowngradeActionHandler {
    pub fn new(store: Arc<dyn AccountingStore>) -> Self {
        Self { store }
    }

    /// Returns true when every supported privilege was handled.
    #[instrument(skip(self, downgraded_privileges))]
    pub async fn apply(&self, domain: &str, downgraded_privileges: &[String]) -> bool {
        let mut all_ok = true;
        for selector in rules_to_deactivate(downgraded_privileges) {
            match self
                .store
                .deactivate_automatic_update_rules(domain, selector)
                .await
            {
                Ok(count) => {
                    if count > 0 {
                        info!(
                            domain = %domain,
                            workflow = selector.workflow.as_str(),
                            survey_only = selector.survey_only,
                            count,
                            "Deactivated automatic update rules"
                        );
                    }
                }
                Err(e) => {
                    error!(
                        domain = %domain,
                        workflow = selector.workflow.as_str(),
                        survey_only = selector.survey_only,
                        error = %e,
                        "Failed to deactivate automatic update rules"
                    );
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

/// Describes what a downgrade would take away, before it happens.
#[derive(Clone)]
pub struct DowngradeStatusHandler {
    store: Arc<dyn AccountingStore>,
}

impl DowngradeStatusHandler {
    pub fn new(store: Arc<dyn AccountingStore>) -> Self {
        Self { store }
    }

    pub async fn messages(
        &self,
        domain: &str,
        downgraded_privileges: &[String],
    ) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        for selector in rules_to_deactivate(downgraded_privileges) {
            let count = self.live_rule_count(domain, selector).await?;
            if count == 0 {
                continue;
            }
            messages.push(match (selector.workflow, selector.survey_only) {
                (RuleWorkflow::CaseUpdate, _) => case_update_rule_message(count),
                (RuleWorkflow::Scheduling, false) => reminder_rule_message(count),
                (RuleWorkflow::Scheduling, true) => survey_rule_message(count),
            });
        }
        Ok(messages)
    }

    async fn live_rule_count(&self, domain: &str, selector: RuleSelector) -> Result<usize> {
        Ok(self
            .store
            .list_automatic_update_rules(domain, Some(selector.workflow))
            .await?
            .iter()
            .filter(|r| r.is_live() && r.matches(selector))
            .count())
    }
}

fn case_update_rule_message(count: usize) -> String {
    if count == 1 {
        "You have 1 automatic case update rule configured in your project. \
         If you select this plan, this rule will be deactivated."
            .to_string()
    } else {
        format!(
            "You have {} automatic case update rules configured in your project. \
             If you select this plan, these rules will be deactivated.",
            count
        )
    }
}

fn reminder_rule_message(count: usize) -> String {
    if count == 1 {
        "You have 1 active Reminder Rule. Selecting this plan will deactivate it.".to_string()
    } else {
        format!(
            "You have {} active Reminder Rules. Selecting this plan will deactivate them.",
            count
        )
    }
}

fn survey_rule_message(count: usize) -> String {
    if count == 1 {
        "You have 1 active Reminder Rule which uses a Survey. \
         Selecting this plan will deactivate it."
            .to_string()
    } else {
        format!(
            "You have {} active Reminder Rules which use a Survey. \
             Selecting this plan will deactivate them.",
            count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductRate, SoftwarePlan, SoftwarePlanVersion};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn version(privs: &[&str]) -> PlanVersionDetail {
        let plan_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        PlanVersionDetail {
            plan: SoftwarePlan {
                plan_id,
                name: "Test".to_string(),
                description: None,
                edition: "standard".to_string(),
                created_utc: Utc::now(),
            },
            version: SoftwarePlanVersion {
                version_id,
                plan_id,
                version: 1,
                privileges: privs.iter().map(|p| p.to_string()).collect(),
                created_utc: Utc::now(),
            },
            product_rate: ProductRate {
                rate_id: Uuid::new_v4(),
                version_id,
                name: "Test".to_string(),
                monthly_fee: Decimal::ZERO,
            },
            feature_rates: Vec::new(),
        }
    }

    #[test]
    fn no_previous_version_is_a_create() {
        let status = get_change_status(None, &version(&[privileges::API_ACCESS]));
        assert_eq!(status.reason, SubscriptionAdjustmentReason::Create);
        assert_eq!(status.upgraded_privileges, vec![privileges::API_ACCESS]);
    }

    #[test]
    fn losing_privileges_is_a_downgrade() {
        let from = version(&[privileges::DATA_CLEANUP, privileges::API_ACCESS]);
        let to = version(&[privileges::API_ACCESS]);
        let status = get_change_status(Some(&from), &to);
        assert_eq!(status.reason, SubscriptionAdjustmentReason::Downgrade);
        assert!(status
            .downgraded_privileges
            .contains(&privileges::DATA_CLEANUP.to_string()));
        assert!(status.upgraded_privileges.is_empty());
    }

    #[test]
    fn gaining_privileges_is_an_upgrade() {
        let from = version(&[]);
        let to = version(&[privileges::OUTBOUND_SMS]);
        let status = get_change_status(Some(&from), &to);
        assert_eq!(status.reason, SubscriptionAdjustmentReason::Upgrade);
        assert_eq!(status.upgraded_privileges, vec![privileges::OUTBOUND_SMS]);
    }

    #[test]
    fn trading_privileges_is_a_switch() {
        let from = version(&[privileges::INBOUND_SMS]);
        let to = version(&[privileges::OUTBOUND_SMS]);
        assert_eq!(
            get_change_status(Some(&from), &to).reason,
            SubscriptionAdjustmentReason::Switch
        );
        assert_eq!(
            get_change_status(Some(&from), &from).reason,
            SubscriptionAdjustmentReason::Switch
        );
    }

    #[test]
    fn inbound_sms_alone_only_reaches_surveys() {
        let inbound = vec![privileges::INBOUND_SMS.to_string()];
        assert_eq!(rules_to_deactivate(&inbound), vec![RuleSelector::surveys()]);

        let both = vec![
            privileges::INBOUND_SMS.to_string(),
            privileges::OUTBOUND_SMS.to_string(),
            privileges::DATA_CLEANUP.to_string(),
        ];
        assert_eq!(
            rules_to_deactivate(&both),
            vec![
                RuleSelector::all(RuleWorkflow::CaseUpdate),
                RuleSelector::all(RuleWorkflow::Scheduling),
            ]
        );
        assert!(rules_to_deactivate(&[privileges::API_ACCESS.to_string()]).is_empty());
    }

    #[test]
    fn messages_pluralise() {
        assert!(case_update_rule_message(1).contains("this rule"));
        assert!(case_update_rule_message(3).starts_with("You have 3"));
        assert!(reminder_rule_message(2).contains("them"));
        assert!(survey_rule_message(1).contains("uses a Survey"));
    }
}
