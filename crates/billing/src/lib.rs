#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pawcademy Billing Engine
//!
//! Reconciles asynchronous payment-processor webhook events onto durable
//! subscriber state exactly once, under redelivery, out-of-order arrival,
//! and partial failure.
//!
//! ## Pipeline
//!
//! processor -> endpoint -> verifier -> ledger (dedupe) -> router ->
//! {subscription reconciler | invoice recorder | trial tracker} ->
//! ledger (mark done)
//!
//! The idempotency ledger's atomic insert-if-absent is the only mutual
//! exclusion per event id; everything downstream assumes concurrent
//! deliveries of different event ids.

pub mod customer;
pub mod error;
pub mod events;
pub mod invoices;
pub mod pg_store;
pub mod storage;
pub mod subscriptions;
pub mod tiers;
pub mod trial;
pub mod webhooks;

// Customer
pub use customer::{HttpProcessorClient, ProcessorClient, ProcessorConfig, ProcessorCustomer};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{InvoiceObject, SubscriptionObject, WebhookEvent};

// Invoices
pub use invoices::{InvoiceOutcome, InvoiceRecorder};

// Storage
pub use pg_store::PgBillingStore;
pub use storage::{
    BillingStore, InvoiceRecord, LedgerEntry, MemoryBillingStore, ReconcileCommit, Subscriber,
    SubscriberProjection,
};

// Subscriptions
pub use subscriptions::{ReconcileOutcome, ReconcilePolicy, SubscriptionReconciler};

// Tiers
pub use tiers::{TierAssignment, BILLING_INTERVAL_METADATA_KEY, HALFYEAR_AMOUNT_BOUNDARY};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;

/// Main billing service wired against Postgres and the live processor
/// API.
pub struct BillingService {
    pub webhooks: WebhookHandler<PgBillingStore, HttpProcessorClient>,
}

impl BillingService {
    /// Create the billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ProcessorConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create the billing service with explicit config.
    pub fn new(config: ProcessorConfig, pool: PgPool) -> Self {
        let store = PgBillingStore::new(pool);
        let customers = HttpProcessorClient::new(&config);
        let webhooks = WebhookHandler::new(
            store,
            customers,
            config.webhook_secret.clone(),
            ReconcilePolicy::default(),
        );
        Self { webhooks }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::customer::{ProcessorClient, ProcessorCustomer};
    use crate::error::BillingResult;
    use crate::events::WebhookEvent;

    /// Stub processor client that returns a canned customer and counts
    /// lookups, so tests can assert side effects ran exactly once.
    #[derive(Clone, Default)]
    pub struct StubProcessorClient {
        email: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl StubProcessorClient {
        pub fn with_email(email: &str) -> Self {
            Self {
                email: Some(email.to_string()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn without_email() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessorClient for StubProcessorClient {
        async fn fetch_customer(&self, customer_id: &str) -> BillingResult<ProcessorCustomer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessorCustomer {
                id: customer_id.to_string(),
                email: self.email.clone(),
                name: None,
            })
        }
    }

    /// A `customer.subscription.updated` payload with one line item.
    pub fn subscription_payload(event_id: &str, status: &str, amount: i64, created: i64) -> Value {
        json!({
            "id": event_id,
            "type": "customer.subscription.updated",
            "created": created,
            "data": {
                "object": {
                    "id": format!("sub_{event_id}"),
                    "customer": "cus_test",
                    "status": status,
                    "current_period_start": created,
                    "cancel_at_period_end": false,
                    "items": {
                        "data": [
                            {"price": {"id": "price_test", "unit_amount": amount}}
                        ]
                    },
                    "metadata": {}
                }
            }
        })
    }

    pub fn subscription_event(
        event_id: &str,
        status: &str,
        amount: i64,
        created: i64,
    ) -> WebhookEvent {
        parse(subscription_payload(event_id, status, amount, created))
    }

    /// An `invoice.payment_succeeded` payload.
    pub fn invoice_payload(event_id: &str, invoice_id: &str, amount_paid: i64, status: &str) -> Value {
        json!({
            "id": event_id,
            "type": "invoice.payment_succeeded",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": invoice_id,
                    "customer": "cus_test",
                    "number": "PAW-0001",
                    "amount_paid": amount_paid,
                    "amount_due": amount_paid,
                    "currency": "usd",
                    "status": status,
                    "created": 1_700_000_000
                }
            }
        })
    }

    pub fn invoice_event(
        event_id: &str,
        invoice_id: &str,
        amount_paid: i64,
        status: &str,
    ) -> WebhookEvent {
        parse(invoice_payload(event_id, invoice_id, amount_paid, status))
    }

    #[allow(clippy::unwrap_used)]
    fn parse(value: Value) -> WebhookEvent {
        let bytes = serde_json::to_vec(&value).unwrap();
        WebhookEvent::from_payload(&bytes).unwrap()
    }
}
