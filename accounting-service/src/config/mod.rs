//! Configuration module for accounting-service.

use rust_decimal::Decimal;
use service_core::config::{self as core_config, env_or};
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct AccountingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub billing: BillingSettings,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Money thresholds and terms used by invoicing and the downgrade process.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingSettings {
    /// Invoices are given a due date once the domain owes more than this.
    pub small_invoice_threshold: Decimal,
    pub days_until_due: i64,
    /// Unpaid balance at which the downgrade process starts.
    pub unpaid_invoice_threshold: Decimal,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            small_invoice_threshold: Decimal::from(100),
            days_until_due: 30,
            unpaid_invoice_threshold: Decimal::from(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Days ahead of `date_end` at which ending reminders go out.
    pub reminder_days: Vec<i64>,
}

impl AccountingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = BillingSettings::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "accounting-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            billing: BillingSettings {
                small_invoice_threshold: env_or(
                    "SMALL_INVOICE_THRESHOLD",
                    defaults.small_invoice_threshold,
                ),
                days_until_due: env_or("DAYS_UNTIL_DUE", defaults.days_until_due),
                unpaid_invoice_threshold: env_or(
                    "UNPAID_INVOICE_THRESHOLD",
                    defaults.unpaid_invoice_threshold,
                ),
            },
            scheduler: SchedulerConfig {
                enabled: env_or("SCHEDULER_ENABLED", true),
                interval_secs: env_or("TASK_INTERVAL_SECS", 3600),
                reminder_days: vec![30, 10, 1],
            },
        })
    }
}
