#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pawcademy Shared Types
//!
//! Domain enums and database helpers used by both the billing engine and
//! the API server.

mod db;
mod types;

pub use db::{create_pool, run_migrations};
pub use types::{BillingCycle, SubscriptionStatus, SubscriptionTier, UnknownValueError};
