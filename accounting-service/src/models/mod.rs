//! Domain models for accounting-service.

mod account;
mod credit;
mod invoice;
mod plan;
mod rule;
mod subscription;
mod usage;

pub use account::{BillingAccount, CreateBillingAccount, Subscriber};
pub use credit::{
    CreditAdjustment, CreditAdjustmentInput, CreditAdjustmentReason, CreditKind, CreditLine,
    CreditLineDiscrepancy, CreditPosting, CreditScope, ListCreditLinesFilter,
};
pub use invoice::{Invoice, InvoiceDraft, InvoiceRunSummary, LineItem, ListInvoicesFilter};
pub use plan::{
    CreateFeatureRate, CreateProductRate, DefaultProductPlan, FeatureRate, FeatureType,
    PlanVersionDetail, ProductRate, PublishPlanVersion, SoftwarePlan, SoftwarePlanEdition,
    SoftwarePlanVersion, UNLIMITED_FEATURE_USAGE,
};
pub use rule::{AutomaticUpdateRule, RuleSelector, RuleWorkflow};
pub use subscription::{
    ListSubscriptionsFilter, Subscription, SubscriptionAdjustment, SubscriptionAdjustmentMethod,
    SubscriptionAdjustmentReason, SubscriptionOptions, SubscriptionState, SubscriptionType,
};
pub use usage::SmsBillable;
