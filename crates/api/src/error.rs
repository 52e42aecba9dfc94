//! HTTP error mapping.
//!
//! The processor retries on 5xx and treats 400 as final, so the mapping
//! is load-bearing: signature and payload problems must never come back
//! as retryable, and upstream/storage problems always must.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pawcademy_billing::BillingError;

pub struct ApiError(pub BillingError);

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BillingError::WebhookSignatureInvalid => {
                (StatusCode::BAD_REQUEST, "invalid signature".to_string())
            }
            BillingError::InvalidWebhookPayload(_) | BillingError::MissingField(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            BillingError::UpstreamLookup(_) => {
                (StatusCode::BAD_GATEWAY, "upstream lookup failed".to_string())
            }
            BillingError::Database(_) | BillingError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Webhook request failed");
        } else {
            tracing::warn!(error = %self.0, "Webhook request rejected");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
