//! Wiring of the accounting components over one store.

use crate::catalog::PlanCatalog;
use crate::config::BillingSettings;
use crate::credits::CreditLedger;
use crate::downgrade::DowngradeProcess;
use crate::invoicing::InvoiceGenerator;
use crate::notifications::Notifier;
use crate::services::{AccountingStore, UsageSource};
use crate::subscriptions::SubscriptionManager;
use std::sync::Arc;

/// Every component shares the same store, usage source and notifier.
#[derive(Clone)]
pub struct AccountingEngine {
    pub store: Arc<dyn AccountingStore>,
    pub usage: Arc<dyn UsageSource>,
    pub notifier: Arc<dyn Notifier>,
    pub catalog: PlanCatalog,
    pub subscriptions: SubscriptionManager,
    pub credits: CreditLedger,
    pub invoices: InvoiceGenerator,
    pub downgrades: DowngradeProcess,
}

impl AccountingEngine {
    pub fn new(
        store: Arc<dyn AccountingStore>,
        usage: Arc<dyn UsageSource>,
        notifier: Arc<dyn Notifier>,
        settings: BillingSettings,
    ) -> Self {
        let catalog = PlanCatalog::new(store.clone(), usage.clone());
        let subscriptions = SubscriptionManager::new(store.clone(), catalog.clone());
        let credits = CreditLedger::new(store.clone());
        let invoices = InvoiceGenerator::new(
            store.clone(),
            usage.clone(),
            catalog.clone(),
            subscriptions.clone(),
            notifier.clone(),
            settings.clone(),
        );
        let downgrades = DowngradeProcess::new(
            store.clone(),
            catalog.clone(),
            subscriptions.clone(),
            notifier.clone(),
            settings,
        );

        Self {
            store,
            usage,
            notifier,
            catalog,
            subscriptions,
            credits,
            invoices,
            downgrades,
        }
    }
}
