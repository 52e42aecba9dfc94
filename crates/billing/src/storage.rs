//! Storage abstraction for the reconciliation engine.
//!
//! The durable store exposes three relations: the idempotency ledger, the
//! subscriber projection, and the invoice projection. [`BillingStore`]
//! wraps all three behind one trait so the engine can run against
//! Postgres in production and the in-memory store in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use pawcademy_shared::{BillingCycle, SubscriptionStatus, SubscriptionTier};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// A row in the idempotency ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event_id: String,
    pub event_type: String,
    pub processed: bool,
    pub processed_at: Option<OffsetDateTime>,
}

/// Subscriber projection row. Owned by this engine, read by the rest of
/// the product.
#[derive(Debug, Clone, Default)]
pub struct Subscriber {
    pub email: String,
    pub user_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub subscribed: bool,
    pub tier: Option<SubscriptionTier>,
    pub tier_limit: Option<i32>,
    pub status: Option<SubscriptionStatus>,
    pub subscription_end: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub billing_cycle: Option<BillingCycle>,
    pub trial_end: Option<OffsetDateTime>,
    pub trial_used: bool,
    pub billing_notes: String,
    pub last_event_at: Option<OffsetDateTime>,
}

/// The subscriber fields a reconciliation computes.
#[derive(Debug, Clone)]
pub struct SubscriberProjection {
    pub processor_customer_id: String,
    pub subscribed: bool,
    pub tier: Option<SubscriptionTier>,
    pub tier_limit: Option<i32>,
    pub status: SubscriptionStatus,
    pub subscription_end: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub billing_cycle: BillingCycle,
    pub trial_end: Option<OffsetDateTime>,
}

/// One atomic reconciliation commit: projection, trial flag, and audit
/// note land together or not at all.
#[derive(Debug, Clone)]
pub struct ReconcileCommit {
    pub projection: SubscriberProjection,
    /// One-way: the store ORs this into the existing flag, never clears it.
    pub mark_trial_used: bool,
    /// Appended to the subscriber's annotation field. Informational only,
    /// never parsed back.
    pub note: String,
    /// Processor event-creation time. The commit applies only if this is
    /// newer than the subscriber's `last_event_at`.
    pub event_time: OffsetDateTime,
}

/// Invoice projection row.
#[derive(Debug, Clone)]
pub struct InvoiceRecord {
    pub invoice_id: String,
    pub subscriber_email: Option<String>,
    pub user_id: Option<String>,
    pub number: Option<String>,
    /// Minor currency units, always non-negative. Never a float.
    pub amount_paid: i64,
    pub currency: String,
    pub status: Option<String>,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub issued_at: Option<OffsetDateTime>,
    pub due_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

/// Durable store consumed by the reconciliation engine.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Idempotency ledger

    /// Atomically insert a ledger row for `event_id` if none exists.
    ///
    /// Returns `true` when this call created the row (the caller holds
    /// exclusive processing rights), `false` when the event was already
    /// seen. This is the single source of mutual exclusion per event id;
    /// implementations must use an atomic insert-if-absent, never a
    /// read-then-write check.
    async fn record_if_new(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<bool>;

    /// Flip the ledger row to `processed = true`. Called only after every
    /// handler side effect for the event has completed.
    async fn mark_processed(&self, event_id: &str) -> BillingResult<()>;

    /// Fetch a ledger row.
    async fn ledger_entry(&self, event_id: &str) -> BillingResult<Option<LedgerEntry>>;

    // Subscriber projection

    /// Insert a minimal subscriber row if none exists for `email`, and
    /// backfill the customer id on an existing row that lacks one.
    async fn ensure_subscriber(
        &self,
        email: &str,
        user_id: &str,
        processor_customer_id: &str,
    ) -> BillingResult<()>;

    async fn get_subscriber(&self, email: &str) -> BillingResult<Option<Subscriber>>;

    /// Apply a reconciliation commit to the subscriber row.
    ///
    /// Conditional last-writer-wins: returns `false` (and writes nothing)
    /// when the stored `last_event_at` is at or after the commit's event
    /// time, or when no row exists for `email`.
    async fn apply_reconciliation(
        &self,
        email: &str,
        commit: &ReconcileCommit,
    ) -> BillingResult<bool>;

    /// Append a note to the subscriber's annotation field.
    async fn append_billing_note(&self, email: &str, note: &str) -> BillingResult<()>;

    // Invoice projection

    /// Insert or update an invoice keyed by its processor id. The unique
    /// key is the idempotency mechanism at this layer.
    async fn upsert_invoice(&self, invoice: &InvoiceRecord) -> BillingResult<()>;

    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<Option<InvoiceRecord>>;
}

/// In-memory [`BillingStore`] for tests and local development.
///
/// Single `Mutex` over all three relations, so a reconciliation commit is
/// trivially atomic.
#[derive(Clone, Default)]
pub struct MemoryBillingStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, (LedgerEntry, Value)>,
    subscribers: HashMap<String, Subscriber>,
    invoices: HashMap<String, InvoiceRecord>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn record_if_new(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<bool> {
        let mut state = self.lock();
        if state.events.contains_key(event_id) {
            return Ok(false);
        }
        state.events.insert(
            event_id.to_string(),
            (
                LedgerEntry {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    processed: false,
                    processed_at: None,
                },
                payload.clone(),
            ),
        );
        Ok(true)
    }

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        let mut state = self.lock();
        if let Some((entry, _)) = state.events.get_mut(event_id) {
            entry.processed = true;
            entry.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn ledger_entry(&self, event_id: &str) -> BillingResult<Option<LedgerEntry>> {
        Ok(self
            .lock()
            .events
            .get(event_id)
            .map(|(entry, _)| entry.clone()))
    }

    async fn ensure_subscriber(
        &self,
        email: &str,
        user_id: &str,
        processor_customer_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.lock();
        let subscriber = state
            .subscribers
            .entry(email.to_string())
            .or_insert_with(|| Subscriber {
                email: email.to_string(),
                user_id: Some(user_id.to_string()),
                ..Subscriber::default()
            });
        if subscriber.processor_customer_id.is_none() {
            subscriber.processor_customer_id = Some(processor_customer_id.to_string());
        }
        Ok(())
    }

    async fn get_subscriber(&self, email: &str) -> BillingResult<Option<Subscriber>> {
        Ok(self.lock().subscribers.get(email).cloned())
    }

    async fn apply_reconciliation(
        &self,
        email: &str,
        commit: &ReconcileCommit,
    ) -> BillingResult<bool> {
        let mut state = self.lock();
        let Some(subscriber) = state.subscribers.get_mut(email) else {
            return Ok(false);
        };
        if let Some(last) = subscriber.last_event_at {
            if last >= commit.event_time {
                return Ok(false);
            }
        }

        let p = &commit.projection;
        subscriber.processor_customer_id = Some(p.processor_customer_id.clone());
        subscriber.subscribed = p.subscribed;
        subscriber.tier = p.tier;
        subscriber.tier_limit = p.tier_limit;
        subscriber.status = Some(p.status);
        subscriber.subscription_end = p.subscription_end;
        subscriber.current_period_start = p.current_period_start;
        subscriber.current_period_end = p.current_period_end;
        subscriber.cancel_at_period_end = p.cancel_at_period_end;
        subscriber.billing_cycle = Some(p.billing_cycle);
        subscriber.trial_end = p.trial_end;
        subscriber.trial_used = subscriber.trial_used || commit.mark_trial_used;
        subscriber.billing_notes.push_str(&commit.note);
        subscriber.last_event_at = Some(commit.event_time);
        Ok(true)
    }

    async fn append_billing_note(&self, email: &str, note: &str) -> BillingResult<()> {
        let mut state = self.lock();
        if let Some(subscriber) = state.subscribers.get_mut(email) {
            subscriber.billing_notes.push_str(note);
        }
        Ok(())
    }

    async fn upsert_invoice(&self, invoice: &InvoiceRecord) -> BillingResult<()> {
        self.lock()
            .invoices
            .insert(invoice.invoice_id.clone(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<Option<InvoiceRecord>> {
        Ok(self.lock().invoices.get(invoice_id).cloned())
    }
}
