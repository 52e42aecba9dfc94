//! Billing error types.
//!
//! Duplicate events and unknown event types are deliberately NOT errors:
//! both short-circuit to an acknowledgement so the processor never retries
//! them. Everything that should trigger processor redelivery surfaces as
//! `UpstreamLookup` or `Database`.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature header missing, malformed, stale, or wrong. Always a 400;
    /// the ledger is never touched for these.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Payload passed signature verification but is not a usable event.
    #[error("invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    /// A required field was absent from an otherwise well-formed payload.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Fetching the customer object from the processor failed. Propagated
    /// as a 5xx. The ledger row is already claimed at this point, so the
    /// resulting redelivery is acknowledged without reprocessing.
    #[error("upstream lookup failed: {0}")]
    UpstreamLookup(String),

    /// Ledger/subscriber/invoice write failed. Propagated as a 5xx, with
    /// the same claimed-row caveat as [`BillingError::UpstreamLookup`].
    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}
