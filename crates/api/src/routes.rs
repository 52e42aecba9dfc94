//! HTTP routes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use pawcademy_billing::{BillingError, WebhookOutcome};

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the webhook signature.
const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// `POST /webhook`: the processor's delivery endpoint.
///
/// 200 means "handled or already handled, do not retry"; 400 means the
/// signature or payload is unacceptable and a retry cannot help; 5xx asks
/// the processor to redeliver.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(BillingError::WebhookSignatureInvalid)?;

    let outcome = state.billing.webhooks.process(&body, signature).await?;

    let received = match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::Ignored => "ignored",
        WebhookOutcome::AlreadyProcessed => "duplicate",
    };
    Ok(Json(serde_json::json!({ "received": true, "outcome": received })))
}
