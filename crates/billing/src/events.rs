//! Webhook event envelope and payload objects.
//!
//! Events are parsed only after signature verification, and only the
//! fields this engine consumes are modeled. `data.object` stays a raw
//! `serde_json::Value` in the envelope so the verbatim payload can be
//! stored in the ledger; handlers deserialize it into the typed objects
//! below on demand.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BillingError, BillingResult};

/// A verified webhook event as delivered by the payment processor.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Processor-assigned, globally unique event id.
    pub id: String,
    /// Declared event type, e.g. `customer.subscription.updated`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the processor created the event. Drives the
    /// last-writer-wins guard in the reconciler.
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    pub fn from_payload(payload: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook event envelope");
            BillingError::InvalidWebhookPayload(e.to_string())
        })
    }

    /// Deserialize `data.object` as a subscription.
    pub fn subscription_object(&self) -> BillingResult<SubscriptionObject> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::InvalidWebhookPayload(e.to_string()))
    }

    /// Deserialize `data.object` as an invoice.
    pub fn invoice_object(&self) -> BillingResult<InvoiceObject> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::InvalidWebhookPayload(e.to_string()))
    }
}

/// Subscription object carried on `customer.subscription.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    /// Processor customer reference. Events carry the id, not the email;
    /// the reconciler resolves it through the customer endpoint.
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    /// Unit amount of the first line item, in minor units.
    pub fn unit_amount(&self) -> BillingResult<i64> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.unit_amount)
            .ok_or(BillingError::MissingField("items.data[0].price.unit_amount"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub unit_amount: Option<i64>,
}

/// Invoice object carried on `invoice.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub status_transitions: Option<StatusTransitions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

fn default_currency() -> String {
    "usd".to_string()
}
