//! Payment-processor customer lookups.
//!
//! Subscription events only carry a customer reference; the billing email
//! lives on the customer object. [`ProcessorClient`] is the seam so the
//! engine can be tested with a stub, and [`HttpProcessorClient`] is the
//! live implementation.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{BillingError, BillingResult};

/// Processor credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// API key for customer lookups.
    pub secret_key: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// API base URL, overridable for tests.
    pub api_base: String,
}

impl ProcessorConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("PROCESSOR_SECRET_KEY")
            .map_err(|_| BillingError::Config("PROCESSOR_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("PROCESSOR_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("PROCESSOR_WEBHOOK_SECRET not set".to_string()))?;
        let api_base = std::env::var("PROCESSOR_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
        })
    }
}

/// Customer object as returned by the processor.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Read-only processor access used by the reconciliation engine.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Fetch the full customer object for a customer reference.
    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<ProcessorCustomer>;
}

/// Live HTTP client against the processor API.
#[derive(Clone)]
pub struct HttpProcessorClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl HttpProcessorClient {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        }
    }
}

#[async_trait]
impl ProcessorClient for HttpProcessorClient {
    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<ProcessorCustomer> {
        let url = format!("{}/v1/customers/{}", self.api_base, customer_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| BillingError::UpstreamLookup(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(
                customer_id = %customer_id,
                status = %status,
                "Customer lookup failed"
            );
            return Err(BillingError::UpstreamLookup(format!(
                "customer lookup returned {status}"
            )));
        }

        response
            .json::<ProcessorCustomer>()
            .await
            .map_err(|e| BillingError::UpstreamLookup(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(api_base: String) -> HttpProcessorClient {
        HttpProcessorClient::new(&ProcessorConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            api_base,
        })
    }

    #[tokio::test]
    async fn test_fetch_customer_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/customers/cus_123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "cus_123", "email": "fido@example.com", "name": "Fido's Human"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let customer = client.fetch_customer("cus_123").await.unwrap();
        assert_eq!(customer.id, "cus_123");
        assert_eq!(customer.email.as_deref(), Some("fido@example.com"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_customer_propagates_upstream_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/customers/cus_err")
            .with_status(500)
            .create_async()
            .await;

        let client = test_client(server.url());
        let err = client.fetch_customer("cus_err").await.unwrap_err();
        assert!(matches!(err, BillingError::UpstreamLookup(_)));
    }
}
