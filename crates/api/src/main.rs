#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Pawcademy Webhook API Server
//!
//! HTTP entry point for the billing-event reconciliation engine: exposes
//! the processor-facing `POST /webhook` endpoint and a health probe.

mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use pawcademy_billing::BillingService;
use pawcademy_shared::{create_pool, run_migrations};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pawcademy_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Pawcademy webhook server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let state = AppState {
        pool,
        config: config.clone(),
        billing,
    };

    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!(addr = %config.bind_addr, "Listening for webhook deliveries");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
