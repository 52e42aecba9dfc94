//! Postgres-backed [`BillingStore`].
//!
//! All idempotency-sensitive writes use atomic single-statement SQL:
//! `INSERT .. ON CONFLICT` for the ledger and invoices, and a guarded
//! `UPDATE` for reconciliation commits, so the projection, trial flag and
//! audit note land in one statement.

use async_trait::async_trait;
use pawcademy_shared::{BillingCycle, SubscriptionStatus, SubscriptionTier};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::storage::{
    BillingStore, InvoiceRecord, LedgerEntry, ReconcileCommit, Subscriber,
};

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    event_id: String,
    event_type: String,
    processed: bool,
    processed_at: Option<OffsetDateTime>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            event_id: row.event_id,
            event_type: row.event_type,
            processed: row.processed,
            processed_at: row.processed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriberRow {
    email: String,
    user_id: Option<String>,
    processor_customer_id: Option<String>,
    subscribed: bool,
    tier: Option<String>,
    tier_limit: Option<i32>,
    status: Option<String>,
    subscription_end: Option<OffsetDateTime>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    billing_cycle: Option<String>,
    trial_end: Option<OffsetDateTime>,
    trial_used: bool,
    billing_notes: String,
    last_event_at: Option<OffsetDateTime>,
}

impl TryFrom<SubscriberRow> for Subscriber {
    type Error = BillingError;

    fn try_from(row: SubscriberRow) -> Result<Self, Self::Error> {
        let tier = row
            .tier
            .map(|t| t.parse::<SubscriptionTier>())
            .transpose()
            .map_err(|e| BillingError::Database(e.to_string()))?;
        let status = row
            .status
            .map(|s| s.parse::<SubscriptionStatus>())
            .transpose()
            .map_err(|e| BillingError::Database(e.to_string()))?;
        let billing_cycle = row
            .billing_cycle
            .map(|c| c.parse::<BillingCycle>())
            .transpose()
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(Subscriber {
            email: row.email,
            user_id: row.user_id,
            processor_customer_id: row.processor_customer_id,
            subscribed: row.subscribed,
            tier,
            tier_limit: row.tier_limit,
            status,
            subscription_end: row.subscription_end,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            billing_cycle,
            trial_end: row.trial_end,
            trial_used: row.trial_used,
            billing_notes: row.billing_notes,
            last_event_at: row.last_event_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: String,
    subscriber_email: Option<String>,
    user_id: Option<String>,
    number: Option<String>,
    amount_paid: i64,
    currency: String,
    status: Option<String>,
    invoice_pdf: Option<String>,
    hosted_invoice_url: Option<String>,
    issued_at: Option<OffsetDateTime>,
    due_at: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
}

impl From<InvoiceRow> for InvoiceRecord {
    fn from(row: InvoiceRow) -> Self {
        InvoiceRecord {
            invoice_id: row.invoice_id,
            subscriber_email: row.subscriber_email,
            user_id: row.user_id,
            number: row.number,
            amount_paid: row.amount_paid,
            currency: row.currency,
            status: row.status,
            invoice_pdf: row.invoice_pdf,
            hosted_invoice_url: row.hosted_invoice_url,
            issued_at: row.issued_at,
            due_at: row.due_at,
            paid_at: row.paid_at,
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn record_if_new(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<bool> {
        // Atomic claim: only one concurrent delivery gets a returned row.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_events (event_id, event_type, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET processed = TRUE, processed_at = NOW()
            WHERE event_id = $1 AND NOT processed
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ledger_entry(&self, event_id: &str) -> BillingResult<Option<LedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, processed, processed_at
            FROM billing_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LedgerEntry::from))
    }

    async fn ensure_subscriber(
        &self,
        email: &str,
        user_id: &str,
        processor_customer_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (email, user_id, processor_customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE SET
                processor_customer_id = COALESCE(
                    subscribers.processor_customer_id,
                    EXCLUDED.processor_customer_id
                ),
                updated_at = NOW()
            "#,
        )
        .bind(email)
        .bind(user_id)
        .bind(processor_customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscriber(&self, email: &str) -> BillingResult<Option<Subscriber>> {
        let row: Option<SubscriberRow> = sqlx::query_as(
            r#"
            SELECT email, user_id, processor_customer_id, subscribed,
                   tier, tier_limit, status, subscription_end,
                   current_period_start, current_period_end,
                   cancel_at_period_end, billing_cycle, trial_end,
                   trial_used, billing_notes, last_event_at
            FROM subscribers
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscriber::try_from).transpose()
    }

    async fn apply_reconciliation(
        &self,
        email: &str,
        commit: &ReconcileCommit,
    ) -> BillingResult<bool> {
        let p = &commit.projection;
        // Guarded single-statement commit: projection, one-way trial flag
        // and audit note apply together, and only if this event is newer
        // than the last one applied.
        let result = sqlx::query(
            r#"
            UPDATE subscribers
            SET processor_customer_id = $2,
                subscribed = $3,
                tier = $4,
                tier_limit = $5,
                status = $6,
                subscription_end = $7,
                current_period_start = $8,
                current_period_end = $9,
                cancel_at_period_end = $10,
                billing_cycle = $11,
                trial_end = $12,
                trial_used = trial_used OR $13,
                billing_notes = billing_notes || $14,
                last_event_at = $15,
                updated_at = NOW()
            WHERE email = $1
              AND (last_event_at IS NULL OR last_event_at < $15)
            "#,
        )
        .bind(email)
        .bind(&p.processor_customer_id)
        .bind(p.subscribed)
        .bind(p.tier.map(|t| t.as_str()))
        .bind(p.tier_limit)
        .bind(p.status.as_str())
        .bind(p.subscription_end)
        .bind(p.current_period_start)
        .bind(p.current_period_end)
        .bind(p.cancel_at_period_end)
        .bind(p.billing_cycle.as_str())
        .bind(p.trial_end)
        .bind(commit.mark_trial_used)
        .bind(&commit.note)
        .bind(commit.event_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_billing_note(&self, email: &str, note: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscribers
            SET billing_notes = billing_notes || $2, updated_at = NOW()
            WHERE email = $1
            "#,
        )
        .bind(email)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_invoice(&self, invoice: &InvoiceRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                invoice_id, subscriber_email, user_id, number, amount_paid,
                currency, status, invoice_pdf, hosted_invoice_url,
                issued_at, due_at, paid_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (invoice_id) DO UPDATE SET
                subscriber_email = EXCLUDED.subscriber_email,
                user_id = EXCLUDED.user_id,
                number = EXCLUDED.number,
                amount_paid = EXCLUDED.amount_paid,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                invoice_pdf = EXCLUDED.invoice_pdf,
                hosted_invoice_url = EXCLUDED.hosted_invoice_url,
                issued_at = EXCLUDED.issued_at,
                due_at = EXCLUDED.due_at,
                paid_at = EXCLUDED.paid_at
            "#,
        )
        .bind(&invoice.invoice_id)
        .bind(invoice.subscriber_email.as_deref())
        .bind(invoice.user_id.as_deref())
        .bind(invoice.number.as_deref())
        .bind(invoice.amount_paid)
        .bind(&invoice.currency)
        .bind(invoice.status.as_deref())
        .bind(invoice.invoice_pdf.as_deref())
        .bind(invoice.hosted_invoice_url.as_deref())
        .bind(invoice.issued_at)
        .bind(invoice.due_at)
        .bind(invoice.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<Option<InvoiceRecord>> {
        let row: Option<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT invoice_id, subscriber_email, user_id, number, amount_paid,
                   currency, status, invoice_pdf, hosted_invoice_url,
                   issued_at, due_at, paid_at
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(InvoiceRecord::from))
    }
}
