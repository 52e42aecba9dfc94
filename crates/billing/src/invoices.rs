//! Invoice recording.
//!
//! Upserts invoice projections keyed by the processor's invoice id; the
//! unique key is its own idempotency layer, independent of the event
//! ledger. Zero-amount invoices (e.g. $0 trial invoices) are never
//! persisted. Payment failures annotate the subscriber but never change
//! `subscribed`/`tier`; dunning and suspension are a human process.

use time::OffsetDateTime;

use crate::customer::ProcessorClient;
use crate::error::BillingResult;
use crate::events::{InvoiceObject, WebhookEvent};
use crate::storage::{BillingStore, InvoiceRecord};

/// What the recorder did with an invoice event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceOutcome {
    Recorded,
    /// Zero paid amount: intentionally skipped regardless of status.
    SkippedZeroAmount,
    /// Draft/open invoices are not terminal and are not persisted.
    SkippedNonTerminal,
    /// Failure annotation appended to the subscriber.
    FailureNoted,
}

pub struct InvoiceRecorder<S, C> {
    store: S,
    customers: C,
}

impl<S: BillingStore, C: ProcessorClient> InvoiceRecorder<S, C> {
    pub fn new(store: S, customers: C) -> Self {
        Self { store, customers }
    }

    /// Handle `invoice.payment_succeeded`.
    pub async fn record_payment_succeeded(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<InvoiceOutcome> {
        let invoice = event.invoice_object()?;

        if invoice.amount_paid <= 0 {
            tracing::info!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                "Skipping zero-amount invoice"
            );
            return Ok(InvoiceOutcome::SkippedZeroAmount);
        }
        if matches!(invoice.status.as_deref(), Some("draft") | Some("open")) {
            tracing::info!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                status = ?invoice.status,
                "Skipping non-terminal invoice"
            );
            return Ok(InvoiceOutcome::SkippedNonTerminal);
        }

        let email = self.resolve_email(&invoice).await?;
        let user_id = match &email {
            Some(email) => self
                .store
                .get_subscriber(email)
                .await?
                .and_then(|s| s.user_id),
            None => None,
        };

        let record = InvoiceRecord {
            invoice_id: invoice.id.clone(),
            subscriber_email: email,
            user_id,
            number: invoice.number.clone(),
            amount_paid: invoice.amount_paid,
            currency: invoice.currency.clone(),
            status: invoice.status.clone(),
            invoice_pdf: invoice.invoice_pdf.clone(),
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            issued_at: from_unix(invoice.created),
            due_at: from_unix(invoice.due_date),
            paid_at: invoice
                .status_transitions
                .as_ref()
                .and_then(|t| from_unix(t.paid_at)),
        };
        self.store.upsert_invoice(&record).await?;

        tracing::info!(
            event_id = %event.id,
            invoice_id = %invoice.id,
            amount_paid = invoice.amount_paid,
            "Invoice recorded"
        );
        Ok(InvoiceOutcome::Recorded)
    }

    /// Handle `invoice.payment_failed`.
    pub async fn record_payment_failed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<InvoiceOutcome> {
        let invoice = event.invoice_object()?;

        let Some(email) = self.resolve_email(&invoice).await? else {
            tracing::warn!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                "Payment failure for invoice with no resolvable subscriber"
            );
            return Ok(InvoiceOutcome::FailureNoted);
        };

        let note = format!(
            "[payment_failed invoice={} amount_due={} at={}]",
            invoice.id, invoice.amount_due, event.created
        );
        self.store.append_billing_note(&email, &note).await?;

        tracing::warn!(
            event_id = %event.id,
            invoice_id = %invoice.id,
            email = %email,
            amount_due = invoice.amount_due,
            "Invoice payment failed, subscriber annotated"
        );
        Ok(InvoiceOutcome::FailureNoted)
    }

    /// Billing email, from the invoice itself or the customer object.
    async fn resolve_email(&self, invoice: &InvoiceObject) -> BillingResult<Option<String>> {
        if let Some(email) = &invoice.customer_email {
            return Ok(Some(email.clone()));
        }
        let Some(customer_id) = &invoice.customer else {
            return Ok(None);
        };
        let customer = self.customers.fetch_customer(customer_id).await?;
        Ok(customer.email)
    }
}

fn from_unix(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBillingStore;
    use crate::test_support::{invoice_event, StubProcessorClient};

    fn recorder(
        store: MemoryBillingStore,
    ) -> InvoiceRecorder<MemoryBillingStore, StubProcessorClient> {
        InvoiceRecorder::new(store, StubProcessorClient::with_email("rex@example.com"))
    }

    #[tokio::test]
    async fn test_paid_invoice_is_recorded() {
        let store = MemoryBillingStore::new();
        let r = recorder(store.clone());

        let event = invoice_event("evt_1", "in_100", 1990, "paid");
        let outcome = r.record_payment_succeeded(&event).await.unwrap();
        assert_eq!(outcome, InvoiceOutcome::Recorded);

        let invoice = store.get_invoice("in_100").await.unwrap().unwrap();
        assert_eq!(invoice.amount_paid, 1990);
        assert_eq!(invoice.subscriber_email.as_deref(), Some("rex@example.com"));
        assert_eq!(invoice.currency, "usd");
    }

    #[tokio::test]
    async fn test_zero_amount_invoice_is_never_written() {
        let store = MemoryBillingStore::new();
        let r = recorder(store.clone());

        for status in ["paid", "void", "draft"] {
            let event = invoice_event("evt_1", "in_0", 0, status);
            let outcome = r.record_payment_succeeded(&event).await.unwrap();
            assert_eq!(outcome, InvoiceOutcome::SkippedZeroAmount, "status {status}");
        }
        assert!(store.get_invoice("in_0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_invoice_is_not_persisted() {
        let store = MemoryBillingStore::new();
        let r = recorder(store.clone());

        let event = invoice_event("evt_1", "in_open", 1990, "open");
        let outcome = r.record_payment_succeeded(&event).await.unwrap();
        assert_eq!(outcome, InvoiceOutcome::SkippedNonTerminal);
        assert!(store.get_invoice("in_open").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_invoice_id() {
        let store = MemoryBillingStore::new();
        let r = recorder(store.clone());

        let event = invoice_event("evt_1", "in_100", 1990, "paid");
        r.record_payment_succeeded(&event).await.unwrap();
        let redelivered = invoice_event("evt_2", "in_100", 1990, "paid");
        r.record_payment_succeeded(&redelivered).await.unwrap();

        let invoice = store.get_invoice("in_100").await.unwrap().unwrap();
        assert_eq!(invoice.amount_paid, 1990);
    }

    #[tokio::test]
    async fn test_payment_failed_annotates_subscriber_without_touching_tier() {
        let store = MemoryBillingStore::new();
        store
            .ensure_subscriber("rex@example.com", "user_1", "cus_1")
            .await
            .unwrap();
        let r = recorder(store.clone());

        let event = invoice_event("evt_1", "in_fail", 0, "open");
        let outcome = r.record_payment_failed(&event).await.unwrap();
        assert_eq!(outcome, InvoiceOutcome::FailureNoted);

        let sub = store
            .get_subscriber("rex@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(sub.billing_notes.contains("payment_failed invoice=in_fail"));
        assert_eq!(sub.tier, None);
        assert!(!sub.subscribed);
    }
}
