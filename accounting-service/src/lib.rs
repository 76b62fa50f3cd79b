//! Accounting Service - plans, subscriptions, credits and invoicing for
//! multi-tenant billing.

pub mod catalog;
pub mod config;
pub mod credits;
pub mod downgrade;
pub mod engine;
pub mod error;
pub mod invoicing;
pub mod models;
pub mod notifications;
pub mod privileges;
pub mod services;
pub mod startup;
pub mod subscription_changes;
pub mod subscriptions;
pub mod tasks;
