//! Software plan catalog models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Feature rates with this monthly limit never charge overage.
pub const UNLIMITED_FEATURE_USAGE: i32 = -1;

/// Plan edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftwarePlanEdition {
    Community,
    Standard,
    Pro,
    Advanced,
    Enterprise,
    Reseller,
    Managed,
}

impl SoftwarePlanEdition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoftwarePlanEdition::Community => "community",
            SoftwarePlanEdition::Standard => "standard",
            SoftwarePlanEdition::Pro => "pro",
            SoftwarePlanEdition::Advanced => "advanced",
            SoftwarePlanEdition::Enterprise => "enterprise",
            SoftwarePlanEdition::Reseller => "reseller",
            SoftwarePlanEdition::Managed => "managed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "standard" => SoftwarePlanEdition::Standard,
            "pro" => SoftwarePlanEdition::Pro,
            "advanced" => SoftwarePlanEdition::Advanced,
            "enterprise" => SoftwarePlanEdition::Enterprise,
            "reseller" => SoftwarePlanEdition::Reseller,
            "managed" => SoftwarePlanEdition::Managed,
            _ => SoftwarePlanEdition::Community,
        }
    }
}

/// Metered feature type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    User,
    Sms,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::User => "user",
            FeatureType::Sms => "sms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(FeatureType::User),
            "sms" => Some(FeatureType::Sms),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Software plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SoftwarePlan {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub edition: String,
    pub created_utc: DateTime<Utc>,
}

impl SoftwarePlan {
    pub fn parsed_edition(&self) -> SoftwarePlanEdition {
        SoftwarePlanEdition::from_string(&self.edition)
    }
}

/// One immutable pricing snapshot of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SoftwarePlanVersion {
    pub version_id: Uuid,
    pub plan_id: Uuid,
    pub version: i32,
    pub privileges: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

/// Flat monthly fee of a plan version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductRate {
    pub rate_id: Uuid,
    pub version_id: Uuid,
    pub name: String,
    pub monthly_fee: Decimal,
}

/// Metered feature pricing of a plan version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeatureRate {
    pub rate_id: Uuid,
    pub version_id: Uuid,
    pub feature_name: String,
    pub feature_type: String,
    pub monthly_fee: Decimal,
    pub monthly_limit: i32,
    pub per_excess_fee: Decimal,
}

impl FeatureRate {
    pub fn parsed_feature_type(&self) -> Option<FeatureType> {
        FeatureType::parse(&self.feature_type)
    }

    pub fn is_unlimited(&self) -> bool {
        self.monthly_limit == UNLIMITED_FEATURE_USAGE
    }
}

/// A plan version together with its plan and rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanVersionDetail {
    pub plan: SoftwarePlan,
    pub version: SoftwarePlanVersion,
    pub product_rate: ProductRate,
    pub feature_rates: Vec<FeatureRate>,
}

impl PlanVersionDetail {
    pub fn version_id(&self) -> Uuid {
        self.version.version_id
    }

    pub fn edition(&self) -> SoftwarePlanEdition {
        self.plan.parsed_edition()
    }

    pub fn is_community(&self) -> bool {
        self.edition() == SoftwarePlanEdition::Community
    }

    pub fn has_privilege(&self, privilege: &str) -> bool {
        self.version.privileges.iter().any(|p| p == privilege)
    }

    pub fn feature_rate(&self, feature_type: FeatureType) -> Option<&FeatureRate> {
        self.feature_rates
            .iter()
            .find(|r| r.parsed_feature_type() == Some(feature_type))
    }
}

/// Edition → plan used when a domain needs an implicit subscription.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DefaultProductPlan {
    pub edition: String,
    pub plan_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

/// Input for a product rate on a new version.
#[derive(Debug, Clone)]
pub struct CreateProductRate {
    pub name: String,
    pub monthly_fee: Decimal,
}

/// Input for a feature rate on a new version.
#[derive(Debug, Clone)]
pub struct CreateFeatureRate {
    pub feature_name: String,
    pub feature_type: FeatureType,
    pub monthly_fee: Decimal,
    pub monthly_limit: i32,
    pub per_excess_fee: Decimal,
}

/// Input for publishing a plan version.
#[derive(Debug, Clone)]
pub struct PublishPlanVersion {
    pub plan_id: Uuid,
    pub product_rate: CreateProductRate,
    pub feature_rates: Vec<CreateFeatureRate>,
    pub privileges: Vec<String>,
}
