//! Plan catalog: plans, immutable versions and per-edition defaults.

use crate::error::{AccountingError, Result};
use crate::models::{
    CreateFeatureRate, DefaultProductPlan, FeatureRate, FeatureType, PlanVersionDetail,
    ProductRate, PublishPlanVersion, SoftwarePlan, SoftwarePlanEdition, SoftwarePlanVersion,
};
use crate::privileges;
use crate::services::{AccountingStore, UsageSource};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn AccountingStore>,
    usage: Arc<dyn UsageSource>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn AccountingStore>, usage: Arc<dyn UsageSource>) -> Self {
        Self { store, usage }
    }

    #[instrument(skip(self, description))]
    pub async fn create_plan(
        &self,
        name: &str,
        edition: SoftwarePlanEdition,
        description: Option<String>,
    ) -> Result<SoftwarePlan> {
        if name.trim().is_empty() {
            return Err(AccountingError::Validation(
                "plan name must not be empty".to_string(),
            ));
        }
        let plan = SoftwarePlan {
            plan_id: Uuid::new_v4(),
            name: name.to_string(),
            description,
            edition: edition.as_str().to_string(),
            created_utc: Utc::now(),
        };
        self.store.insert_plan(&plan).await?;
        Ok(plan)
    }

    /// Publish the next version of a plan. Earlier versions are never
    /// touched; new pricing always means a new version.
    #[instrument(skip(self, input), fields(plan_id = %input.plan_id))]
    pub async fn publish_version(&self, input: PublishPlanVersion) -> Result<PlanVersionDetail> {
        let plan = self
            .store
            .get_plan(input.plan_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("plan", input.plan_id))?;

        validate_rates(&input)?;

        let next_version = match self.store.latest_plan_version(plan.plan_id).await? {
            Some(latest) => latest.version.version + 1,
            None => 1,
        };

        let version_id = Uuid::new_v4();
        let detail = PlanVersionDetail {
            version: SoftwarePlanVersion {
                version_id,
                plan_id: plan.plan_id,
                version: next_version,
                privileges: input.privileges.clone(),
                created_utc: Utc::now(),
            },
            product_rate: ProductRate {
                rate_id: Uuid::new_v4(),
                version_id,
                name: input.product_rate.name.clone(),
                monthly_fee: input.product_rate.monthly_fee,
            },
            feature_rates: input
                .feature_rates
                .iter()
                .map(|rate| feature_rate(version_id, rate))
                .collect(),
            plan,
        };

        self.store.insert_plan_version(&detail).await?;
        info!(
            version_id = %version_id,
            version = next_version,
            "Plan version published"
        );
        Ok(detail)
    }

    pub async fn get_version(&self, version_id: Uuid) -> Result<PlanVersionDetail> {
        self.store
            .get_plan_version(version_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("plan version", version_id))
    }

    pub async fn latest_version(&self, plan_id: Uuid) -> Result<PlanVersionDetail> {
        self.store
            .latest_plan_version(plan_id)
            .await?
            .ok_or_else(|| AccountingError::Catalog(format!("plan {} has no versions", plan_id)))
    }

    #[instrument(skip(self))]
    pub async fn set_default_plan(
        &self,
        edition: SoftwarePlanEdition,
        plan_id: Uuid,
    ) -> Result<()> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| AccountingError::not_found("plan", plan_id))?;
        if plan.parsed_edition() != edition {
            return Err(AccountingError::Catalog(format!(
                "plan {} is a {} plan, not {}",
                plan.name,
                plan.edition,
                edition.as_str()
            )));
        }
        self.store
            .set_default_plan(&DefaultProductPlan {
                edition: edition.as_str().to_string(),
                plan_id,
                created_utc: Utc::now(),
            })
            .await
    }

    /// Latest version of the default plan for `edition`.
    pub async fn default_plan_version(
        &self,
        edition: SoftwarePlanEdition,
    ) -> Result<PlanVersionDetail> {
        let default_plan = self.store.get_default_plan(edition).await?.ok_or_else(|| {
            AccountingError::Catalog(format!("no default plan for edition {}", edition.as_str()))
        })?;
        self.latest_version(default_plan.plan_id).await
    }

    pub async fn community_plan_version(&self) -> Result<PlanVersionDetail> {
        self.default_plan_version(SoftwarePlanEdition::Community).await
    }

    /// True when usage between `date_start` and `date_end` would put any
    /// feature of `version` over its monthly limit.
    #[instrument(skip(self, version), fields(version_id = %version.version_id()))]
    pub async fn feature_charges_exist_for_domain(
        &self,
        version: &PlanVersionDetail,
        domain: &str,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Result<bool> {
        for rate in &version.feature_rates {
            if rate.is_unlimited() {
                continue;
            }
            let limit = i64::from(rate.monthly_limit);
            let usage = match rate.parsed_feature_type() {
                Some(FeatureType::User) => self.usage.active_user_count(domain).await?,
                Some(FeatureType::Sms) => self
                    .usage
                    .sms_billables(&[domain.to_string()], date_start, date_end)
                    .await?
                    .iter()
                    .map(|b| i64::from(b.multipart_count))
                    .sum::<i64>(),
                None => continue,
            };
            if usage > limit {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn feature_rate(version_id: Uuid, input: &CreateFeatureRate) -> FeatureRate {
    FeatureRate {
        rate_id: Uuid::new_v4(),
        version_id,
        feature_name: input.feature_name.clone(),
        feature_type: input.feature_type.as_str().to_string(),
        monthly_fee: input.monthly_fee,
        monthly_limit: input.monthly_limit,
        per_excess_fee: input.per_excess_fee,
    }
}

fn validate_rates(input: &PublishPlanVersion) -> Result<()> {
    if input.product_rate.monthly_fee < Decimal::ZERO {
        return Err(AccountingError::Validation(
            "product monthly fee must not be negative".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for rate in &input.feature_rates {
        if !seen.insert(rate.feature_type) {
            return Err(AccountingError::Validation(format!(
                "more than one {} rate on a plan version",
                rate.feature_type
            )));
        }
        if rate.monthly_limit < -1 {
            return Err(AccountingError::Validation(format!(
                "{} monthly limit must be -1 (unlimited) or more",
                rate.feature_type
            )));
        }
        if rate.monthly_fee < Decimal::ZERO || rate.per_excess_fee < Decimal::ZERO {
            return Err(AccountingError::Validation(format!(
                "{} fees must not be negative",
                rate.feature_type
            )));
        }
    }

    if let Some(unknown) = input.privileges.iter().find(|p| !privileges::is_known(p)) {
        return Err(AccountingError::Validation(format!(
            "unknown privilege '{}'",
            unknown
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateProductRate;
    use rust_decimal_macros::dec;

    fn input(feature_rates: Vec<CreateFeatureRate>) -> PublishPlanVersion {
        PublishPlanVersion {
            plan_id: Uuid::new_v4(),
            product_rate: CreateProductRate {
                name: "Standard".to_string(),
                monthly_fee: dec!(100),
            },
            feature_rates,
            privileges: vec![privileges::DATA_CLEANUP.to_string()],
        }
    }

    fn user_rate(limit: i32) -> CreateFeatureRate {
        CreateFeatureRate {
            feature_name: "Users".to_string(),
            feature_type: FeatureType::User,
            monthly_fee: dec!(0),
            monthly_limit: limit,
            per_excess_fee: dec!(1),
        }
    }

    #[test]
    fn rejects_duplicate_feature_types() {
        let result = validate_rates(&input(vec![user_rate(10), user_rate(20)]));
        assert!(matches!(result, Err(AccountingError::Validation(_))));
    }

    #[test]
    fn rejects_limits_below_unlimited() {
        assert!(validate_rates(&input(vec![user_rate(-2)])).is_err());
        assert!(validate_rates(&input(vec![user_rate(-1)])).is_ok());
    }
}
