//! Subscription model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of service a subscription pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Product,
    Implementation,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Product => "product",
            SubscriptionType::Implementation => "implementation",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "implementation" => SubscriptionType::Implementation,
            _ => SubscriptionType::Product,
        }
    }
}

/// Derived lifecycle state of a subscription on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Active,
    Ended,
    Renewed,
    Cancelled,
}

/// Why a subscription was adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAdjustmentReason {
    Create,
    Modify,
    Cancel,
    Upgrade,
    Downgrade,
    Switch,
    Renewal,
    Reactivate,
}

impl SubscriptionAdjustmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAdjustmentReason::Create => "create",
            SubscriptionAdjustmentReason::Modify => "modify",
            SubscriptionAdjustmentReason::Cancel => "cancel",
            SubscriptionAdjustmentReason::Upgrade => "upgrade",
            SubscriptionAdjustmentReason::Downgrade => "downgrade",
            SubscriptionAdjustmentReason::Switch => "switch",
            SubscriptionAdjustmentReason::Renewal => "renewal",
            SubscriptionAdjustmentReason::Reactivate => "reactivate",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "modify" => SubscriptionAdjustmentReason::Modify,
            "cancel" => SubscriptionAdjustmentReason::Cancel,
            "upgrade" => SubscriptionAdjustmentReason::Upgrade,
            "downgrade" => SubscriptionAdjustmentReason::Downgrade,
            "switch" => SubscriptionAdjustmentReason::Switch,
            "renewal" => SubscriptionAdjustmentReason::Renewal,
            "reactivate" => SubscriptionAdjustmentReason::Reactivate,
            _ => SubscriptionAdjustmentReason::Create,
        }
    }
}

/// Who or what triggered a subscription adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAdjustmentMethod {
    User,
    Internal,
    Task,
    Trial,
    AutomaticDowngrade,
    DefaultCommunity,
    Invoicing,
}

impl SubscriptionAdjustmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAdjustmentMethod::User => "user",
            SubscriptionAdjustmentMethod::Internal => "internal",
            SubscriptionAdjustmentMethod::Task => "task",
            SubscriptionAdjustmentMethod::Trial => "trial",
            SubscriptionAdjustmentMethod::AutomaticDowngrade => "automatic_downgrade",
            SubscriptionAdjustmentMethod::DefaultCommunity => "default_community",
            SubscriptionAdjustmentMethod::Invoicing => "invoicing",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "user" => SubscriptionAdjustmentMethod::User,
            "task" => SubscriptionAdjustmentMethod::Task,
            "trial" => SubscriptionAdjustmentMethod::Trial,
            "automatic_downgrade" => SubscriptionAdjustmentMethod::AutomaticDowngrade,
            "default_community" => SubscriptionAdjustmentMethod::DefaultCommunity,
            "invoicing" => SubscriptionAdjustmentMethod::Invoicing,
            _ => SubscriptionAdjustmentMethod::Internal,
        }
    }
}

/// Binds a subscriber to an account and a plan version for a date range.
///
/// `date_end` is exclusive: the subscription is terminated on that day.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub account_id: Uuid,
    pub subscriber_id: Uuid,
    pub plan_version_id: Uuid,
    pub date_start: NaiveDate,
    pub date_end: Option<NaiveDate>,
    pub is_active: bool,
    pub is_trial: bool,
    pub do_not_invoice: bool,
    pub auto_generate_credits: bool,
    pub skip_invoicing_if_no_feature_charges: bool,
    pub skip_auto_downgrade: bool,
    pub service_type: String,
    pub next_subscription_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn parsed_service_type(&self) -> SubscriptionType {
        SubscriptionType::from_string(&self.service_type)
    }

    /// True when `day` falls inside `[date_start, date_end)`.
    pub fn covers(&self, day: NaiveDate) -> bool {
        self.date_start <= day && self.date_end.map_or(true, |end| day < end)
    }

    /// True when the ranges `[date_start, date_end)` of both intersect.
    pub fn overlaps(&self, start: NaiveDate, end: Option<NaiveDate>) -> bool {
        let starts_before_other_ends = end.map_or(true, |e| self.date_start < e);
        let other_starts_before_end = self.date_end.map_or(true, |e| start < e);
        starts_before_other_ends && other_starts_before_end
    }

    /// A subscription whose end is not after its start never ran.
    pub fn is_empty_range(&self) -> bool {
        self.date_end.is_some_and(|end| end <= self.date_start)
    }
}

/// Audit row recording one subscription lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionAdjustment {
    pub adjustment_id: Uuid,
    pub subscription_id: Uuid,
    pub reason: String,
    pub method: String,
    pub note: Option<String>,
    pub web_user: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub related_subscription_id: Option<Uuid>,
    pub new_date_start: NaiveDate,
    pub new_date_end: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
}

impl SubscriptionAdjustment {
    pub fn parsed_reason(&self) -> SubscriptionAdjustmentReason {
        SubscriptionAdjustmentReason::from_string(&self.reason)
    }

    pub fn parsed_method(&self) -> SubscriptionAdjustmentMethod {
        SubscriptionAdjustmentMethod::from_string(&self.method)
    }
}

/// Optional knobs for a new subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub is_trial: bool,
    pub do_not_invoice: bool,
    pub auto_generate_credits: bool,
    pub skip_invoicing_if_no_feature_charges: bool,
    pub skip_auto_downgrade: bool,
    pub service_type: SubscriptionType,
    pub note: Option<String>,
    pub web_user: Option<String>,
    pub adjustment_method: SubscriptionAdjustmentMethod,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            is_trial: false,
            do_not_invoice: false,
            auto_generate_credits: false,
            skip_invoicing_if_no_feature_charges: false,
            skip_auto_downgrade: false,
            service_type: SubscriptionType::Product,
            note: None,
            web_user: None,
            adjustment_method: SubscriptionAdjustmentMethod::Internal,
        }
    }
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub subscriber_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub is_active: Option<bool>,
}
