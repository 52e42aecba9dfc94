//! Webhook verification and event routing.
//!
//! The pipeline for every delivery is: verify the signature over the raw
//! bytes, claim the event in the idempotency ledger, route by declared
//! type, then mark the ledger row processed. A crash between claim and
//! mark leaves the row claimed but unprocessed; the claim dedupes on row
//! existence alone, so a redelivery is acknowledged without reprocessing
//! and the event's side effects are lost until the row is cleared by hand.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::customer::ProcessorClient;
use crate::error::{BillingError, BillingResult};
use crate::events::WebhookEvent;
use crate::invoices::InvoiceRecorder;
use crate::storage::BillingStore;
use crate::subscriptions::{ReconcilePolicy, SubscriptionReconciler};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed timestamp before the delivery is rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Outcome of a webhook delivery. All three map to HTTP 200: the
/// processor must never retry any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Routed to a handler and fully processed.
    Processed,
    /// Unknown or unhandled event type, acknowledged without action.
    Ignored,
    /// Ledger already holds this event id.
    AlreadyProcessed,
}

/// Webhook handler composing verifier, ledger, router and the two
/// handler families.
pub struct WebhookHandler<S, C> {
    store: S,
    webhook_secret: String,
    reconciler: SubscriptionReconciler<S, C>,
    invoices: InvoiceRecorder<S, C>,
}

impl<S, C> WebhookHandler<S, C>
where
    S: BillingStore + Clone,
    C: ProcessorClient + Clone,
{
    pub fn new(store: S, customers: C, webhook_secret: String, policy: ReconcilePolicy) -> Self {
        let reconciler = SubscriptionReconciler::new(store.clone(), customers.clone(), policy);
        let invoices = InvoiceRecorder::new(store.clone(), customers);
        Self {
            store,
            webhook_secret,
            reconciler,
            invoices,
        }
    }

    /// Full pipeline for one delivery: verify, dedupe, route, mark.
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        // Known-good JSON at this point; stored verbatim for replay/audit.
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| BillingError::InvalidWebhookPayload(e.to_string()))?;
        self.handle_event(event, raw).await
    }

    /// Verify the signature header against the exact raw request bytes.
    ///
    /// The digest is computed over `"{timestamp}.{payload}"`, never over
    /// a re-serialized form, which could change byte layout. Runs before
    /// any JSON parsing of untrusted content.
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        let parts = parse_signature_header(signature)?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        if (now - parts.timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = parts.timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);

        let mut signed_payload = parts.timestamp.to_string().into_bytes();
        signed_payload.push(b'.');
        signed_payload.extend_from_slice(payload);
        let expected = compute_signature(secret, &signed_payload)?;

        let provided = hex::decode(&parts.v1_signature)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        if expected.ct_eq(&provided).unwrap_u8() != 1 {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        WebhookEvent::from_payload(payload)
    }

    /// Handle a verified event with its verbatim payload.
    pub async fn handle_event(
        &self,
        event: WebhookEvent,
        raw_payload: Value,
    ) -> BillingResult<WebhookOutcome> {
        // Atomic claim: the ledger insert is the only mutual exclusion
        // per event id, so concurrent redeliveries cannot both pass.
        let is_new = self
            .store
            .record_if_new(&event.id, &event.event_type, &raw_payload)
            .await?;
        if !is_new {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, acknowledging without processing"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let outcome = match event.event_type.as_str() {
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                self.reconciler.reconcile(&event).await?;
                WebhookOutcome::Processed
            }
            "invoice.payment_succeeded" => {
                self.invoices.record_payment_succeeded(&event).await?;
                WebhookOutcome::Processed
            }
            "invoice.payment_failed" => {
                self.invoices.record_payment_failed(&event).await?;
                WebhookOutcome::Processed
            }
            "customer.subscription.trial_will_end" => {
                // Placeholder for future notification hooks.
                tracing::info!(event_id = %event.id, "Trial ending soon, no action configured");
                WebhookOutcome::Processed
            }
            other => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %other,
                    "Unhandled webhook event type, acknowledging"
                );
                WebhookOutcome::Ignored
            }
        };

        // Only reached when every handler side effect succeeded. Errors
        // above return 5xx, but the claimed row makes the redelivery
        // short-circuit; recovering such an event means clearing its row.
        self.store.mark_processed(&event.id).await?;

        Ok(outcome)
    }
}

struct SignatureParts {
    timestamp: i64,
    v1_signature: String,
}

/// Parse a `t=<unix>,v1=<hex>` signature header.
fn parse_signature_header(header: &str) -> BillingResult<SignatureParts> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            match key.trim() {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1_signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(BillingError::WebhookSignatureInvalid)?,
        v1_signature: v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?,
    })
}

fn compute_signature(secret: &str, payload: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBillingStore;
    use crate::test_support::{
        invoice_payload, subscription_payload, StubProcessorClient,
    };
    use pawcademy_shared::{SubscriptionStatus, SubscriptionTier};

    const SECRET: &str = "whsec_test_secret";

    fn handler(
        store: MemoryBillingStore,
        customers: StubProcessorClient,
    ) -> WebhookHandler<MemoryBillingStore, StubProcessorClient> {
        WebhookHandler::new(
            store,
            customers,
            SECRET.to_string(),
            ReconcilePolicy::default(),
        )
    }

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let secret = SECRET.strip_prefix("whsec_").unwrap();
        let mut signed = timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let digest = compute_signature(secret, &signed).unwrap();
        format!("t={},v1={}", timestamp, hex::encode(digest))
    }

    fn now_unix() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    #[test]
    fn test_verify_accepts_valid_signature() {
        let h = handler(MemoryBillingStore::new(), StubProcessorClient::default());
        let payload = serde_json::to_vec(&subscription_payload(
            "evt_1",
            "active",
            1990,
            1_700_000_000,
        ))
        .unwrap();
        let signature = sign(&payload, now_unix());

        let event = h.verify_event(&payload, &signature).unwrap();
        assert_eq!(event.id, "evt_1");
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let h = handler(MemoryBillingStore::new(), StubProcessorClient::default());
        let payload = serde_json::to_vec(&subscription_payload(
            "evt_1",
            "active",
            1990,
            1_700_000_000,
        ))
        .unwrap();
        let signature = sign(&payload, now_unix());

        let mut tampered = payload.clone();
        tampered[10] ^= 0x01;
        let err = h.verify_event(&tampered, &signature).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_verify_rejects_malformed_header() {
        let h = handler(MemoryBillingStore::new(), StubProcessorClient::default());
        for header in ["", "garbage", "t=notanumber,v1=abc", "v1=abc", "t=123"] {
            let err = h.verify_event(b"{}", header).unwrap_err();
            assert!(
                matches!(err, BillingError::WebhookSignatureInvalid),
                "header {header:?}"
            );
        }
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let h = handler(MemoryBillingStore::new(), StubProcessorClient::default());
        let payload = b"{}".to_vec();
        let stale = now_unix() - SIGNATURE_TOLERANCE_SECS - 10;
        let signature = sign(&payload, stale);
        let err = h.verify_event(&payload, &signature).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn test_signature_failure_never_touches_ledger() {
        let store = MemoryBillingStore::new();
        let h = handler(store.clone(), StubProcessorClient::with_email("a@b.c"));
        let payload = serde_json::to_vec(&subscription_payload(
            "evt_1",
            "active",
            1990,
            1_700_000_000,
        ))
        .unwrap();

        let err = h.process(&payload, "t=1,v1=deadbeef").await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(store.ledger_entry("evt_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_event_short_circuits_with_one_side_effect() {
        let store = MemoryBillingStore::new();
        let customers = StubProcessorClient::with_email("rex@example.com");
        let h = handler(store.clone(), customers.clone());

        let payload = subscription_payload("evt_1", "active", 1990, 1_700_000_000);
        let event = WebhookEvent::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();

        let first = h.handle_event(event.clone(), payload.clone()).await.unwrap();
        assert_eq!(first, WebhookOutcome::Processed);
        let second = h.handle_event(event, payload).await.unwrap();
        assert_eq!(second, WebhookOutcome::AlreadyProcessed);

        // Handler side effects ran exactly once.
        assert_eq!(customers.calls(), 1);
    }

    #[tokio::test]
    async fn test_claimed_but_unprocessed_event_is_not_reprocessed() {
        let store = MemoryBillingStore::new();
        let customers = StubProcessorClient::with_email("rex@example.com");
        let h = handler(store.clone(), customers.clone());

        let payload = subscription_payload("evt_1", "active", 1990, 1_700_000_000);
        let event = WebhookEvent::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();

        // A row claimed by an earlier delivery that died before marking.
        store
            .record_if_new("evt_1", "customer.subscription.updated", &payload)
            .await
            .unwrap();

        // The redelivery dedupes on row existence, not the processed flag.
        let outcome = h.handle_event(event, payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);
        assert_eq!(customers.calls(), 0);
        let entry = store.ledger_entry("evt_1").await.unwrap().unwrap();
        assert!(!entry.processed);
    }

    #[tokio::test]
    async fn test_replay_after_processed_is_noop() {
        let store = MemoryBillingStore::new();
        let h = handler(store.clone(), StubProcessorClient::with_email("rex@example.com"));

        let payload = subscription_payload("evt_1", "active", 1990, 1_700_000_000);
        let event = WebhookEvent::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();

        h.handle_event(event.clone(), payload.clone()).await.unwrap();
        let after_one = store
            .get_subscriber("rex@example.com")
            .await
            .unwrap()
            .unwrap();

        for _ in 0..5 {
            h.handle_event(event.clone(), payload.clone()).await.unwrap();
        }
        let after_many = store
            .get_subscriber("rex@example.com")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(after_one.tier, after_many.tier);
        assert_eq!(after_one.status, after_many.status);
        assert_eq!(after_one.billing_notes, after_many.billing_notes);
        assert_eq!(after_one.last_event_at, after_many.last_event_at);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let store = MemoryBillingStore::new();
        let h = handler(store.clone(), StubProcessorClient::default());

        let payload = serde_json::json!({
            "id": "evt_mystery",
            "type": "charge.dispute.created",
            "created": 1_700_000_000,
            "data": {"object": {}}
        });
        let event = WebhookEvent::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();

        let outcome = h.handle_event(event, payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        // Marked processed so a redelivery short-circuits.
        let entry = store.ledger_entry("evt_mystery").await.unwrap().unwrap();
        assert!(entry.processed);
    }

    #[tokio::test]
    async fn test_trial_will_end_is_a_noop_placeholder() {
        let store = MemoryBillingStore::new();
        let h = handler(store.clone(), StubProcessorClient::default());

        let payload = serde_json::json!({
            "id": "evt_trial_warn",
            "type": "customer.subscription.trial_will_end",
            "created": 1_700_000_000,
            "data": {"object": {}}
        });
        let event = WebhookEvent::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();

        let outcome = h.handle_event(event, payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert!(store
            .ledger_entry("evt_trial_warn")
            .await
            .unwrap()
            .unwrap()
            .processed);
    }

    #[tokio::test]
    async fn test_end_to_end_trialing_subscription() {
        let store = MemoryBillingStore::new();
        let h = handler(store.clone(), StubProcessorClient::with_email("rex@example.com"));

        let mut payload = subscription_payload("evt_1", "trialing", 990, now_unix());
        payload["type"] = serde_json::json!("customer.subscription.created");
        let bytes = serde_json::to_vec(&payload).unwrap();
        let signature = sign(&bytes, now_unix());

        let outcome = h.process(&bytes, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let sub = store
            .get_subscriber("rex@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.status, Some(SubscriptionStatus::Trialing));
        assert_eq!(sub.tier, Some(SubscriptionTier::Plan1));
        assert_eq!(sub.tier_limit, Some(1));
        assert!(sub.trial_used);

        let entry = store.ledger_entry("evt_1").await.unwrap().unwrap();
        assert!(entry.processed);
        assert!(entry.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_invoice_events_route_to_recorder() {
        let store = MemoryBillingStore::new();
        let h = handler(store.clone(), StubProcessorClient::with_email("rex@example.com"));

        let payload = invoice_payload("evt_inv", "in_1", 1990, "paid");
        let event = WebhookEvent::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();
        let outcome = h.handle_event(event, payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        assert!(store.get_invoice("in_1").await.unwrap().is_some());
    }
}
