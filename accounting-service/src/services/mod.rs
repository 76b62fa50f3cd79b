//! Services module for accounting-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use memory::{InMemoryStore, InMemoryUsage};
pub use metrics::{
    get_metrics, init_metrics, record_credit_adjustment, record_error, record_invoice_created,
    record_subscription_adjustment, record_task_run,
};
pub use store::{AccountingStore, SubscriptionChange, UsageSource};
