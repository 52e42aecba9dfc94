//! Core billing domain enums.
//!
//! These are stored as lowercase text columns, so every enum here has a
//! stable `as_str` form and a strict parser. The status set mirrors what
//! the payment processor reports; this engine projects statuses, it never
//! invents them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when parsing an enum from a wire/database string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownValueError {
    pub kind: &'static str,
    pub value: String,
}

/// Subscription plan tier, ordered cheapest to most expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Plan1,
    Plan2,
    Plan3,
    Plan4,
    Plan5,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Plan1 => "plan1",
            SubscriptionTier::Plan2 => "plan2",
            SubscriptionTier::Plan3 => "plan3",
            SubscriptionTier::Plan4 => "plan4",
            SubscriptionTier::Plan5 => "plan5",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = UnknownValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan1" => Ok(SubscriptionTier::Plan1),
            "plan2" => Ok(SubscriptionTier::Plan2),
            "plan3" => Ok(SubscriptionTier::Plan3),
            "plan4" => Ok(SubscriptionTier::Plan4),
            "plan5" => Ok(SubscriptionTier::Plan5),
            other => Err(UnknownValueError {
                kind: "subscription tier",
                value: other.to_string(),
            }),
        }
    }
}

/// Subscription lifecycle status as reported by the payment processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            other => Err(UnknownValueError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Billing recurrence period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Halfyearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Halfyearly => "halfyearly",
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = UnknownValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "halfyearly" => Ok(BillingCycle::Halfyearly),
            other => Err(UnknownValueError {
                kind: "billing cycle",
                value: other.to_string(),
            }),
        }
    }
}
