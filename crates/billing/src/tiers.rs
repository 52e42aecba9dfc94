//! Tier resolution.
//!
//! Pure mapping from (amount, billing cycle, status) to a plan tier and
//! seat limit. No I/O, no shared state: the threshold table is a static,
//! ordered list evaluated highest-first.
//!
//! The resolver is fail-open: an amount that matches no threshold maps to
//! the cheapest tier instead of being rejected. Billing continuity beats
//! strictness here; an unexpected price point keeps the subscriber on
//! `plan1` rather than bouncing the event.

use std::collections::HashMap;

use pawcademy_shared::{BillingCycle, SubscriptionStatus, SubscriptionTier};

/// Amounts at or above this value (minor units) are assumed to be the
/// six-month cycle when the event carries no explicit interval.
pub const HALFYEAR_AMOUNT_BOUNDARY: i64 = 5000;

/// Metadata key that, when present, overrides amount-based cycle inference.
pub const BILLING_INTERVAL_METADATA_KEY: &str = "billing_interval";

/// Ordered threshold table: monthly-equivalent minor units, highest first.
/// The first row whose threshold is <= the normalized amount wins. Seat
/// limits live in [`limit_for`] only.
const TIER_THRESHOLDS: &[(i64, SubscriptionTier)] = &[
    (4990, SubscriptionTier::Plan5),
    (2990, SubscriptionTier::Plan4),
    (1990, SubscriptionTier::Plan3),
    (1490, SubscriptionTier::Plan2),
];

/// Fallback when no threshold matches.
const DEFAULT_TIER: SubscriptionTier = SubscriptionTier::Plan1;

/// A resolved tier and its seat limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierAssignment {
    pub tier: SubscriptionTier,
    pub limit: i32,
}

/// Resolve the tier for a subscription line amount.
///
/// Returns `None` when the subscription is canceled: a canceled
/// subscription carries no tier regardless of amount. Half-yearly amounts
/// are normalized to a monthly equivalent (integer division by 6) purely
/// for threshold comparison; the stored tier is not prorated.
pub fn resolve(
    amount: i64,
    cycle: BillingCycle,
    status: SubscriptionStatus,
) -> Option<TierAssignment> {
    if status == SubscriptionStatus::Canceled {
        return None;
    }

    let monthly_equivalent = match cycle {
        BillingCycle::Monthly => amount,
        BillingCycle::Halfyearly => amount / 6,
    };

    let tier = TIER_THRESHOLDS
        .iter()
        .find(|(threshold, _)| monthly_equivalent >= *threshold)
        .map(|(_, tier)| *tier)
        .unwrap_or(DEFAULT_TIER);

    Some(TierAssignment {
        tier,
        limit: limit_for(tier),
    })
}

/// Seat limit for a tier. `plan5` uses 999 as "effectively unlimited".
pub fn limit_for(tier: SubscriptionTier) -> i32 {
    match tier {
        SubscriptionTier::Plan1 => 1,
        SubscriptionTier::Plan2 => 2,
        SubscriptionTier::Plan3 => 4,
        SubscriptionTier::Plan4 => 8,
        SubscriptionTier::Plan5 => 999,
    }
}

/// Determine the billing cycle for a subscription line.
///
/// An explicit `billing_interval` metadata value always wins. Without it
/// we fall back to the amount heuristic: the upstream price configuration
/// does not always carry an interval, but half-year prices all sit at or
/// above [`HALFYEAR_AMOUNT_BOUNDARY`].
pub fn infer_cycle(amount: i64, metadata: &HashMap<String, String>) -> BillingCycle {
    if let Some(explicit) = metadata.get(BILLING_INTERVAL_METADATA_KEY) {
        if let Ok(cycle) = explicit.parse::<BillingCycle>() {
            return cycle;
        }
        tracing::warn!(
            billing_interval = %explicit,
            "Unrecognized billing_interval metadata, falling back to amount heuristic"
        );
    }

    if amount >= HALFYEAR_AMOUNT_BOUNDARY {
        BillingCycle::Halfyearly
    } else {
        BillingCycle::Monthly
    }
}
