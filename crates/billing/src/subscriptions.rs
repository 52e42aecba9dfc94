//! Subscription state reconciliation.
//!
//! Projects processor-reported subscription lifecycle events onto the
//! subscriber record. The reconciler never invents transitions: the
//! processor's status is projected as-is, subject to the write policy and
//! the last-writer-wins guard enforced by the store.

use std::collections::HashSet;

use pawcademy_shared::{BillingCycle, SubscriptionStatus};
use time::{Duration, OffsetDateTime};

use crate::customer::ProcessorClient;
use crate::error::{BillingError, BillingResult};
use crate::events::WebhookEvent;
use crate::storage::{BillingStore, ReconcileCommit, Subscriber, SubscriberProjection};
use crate::{tiers, trial};

/// Grace-inclusive period length added on top of the processor's period
/// start. The processor's own `current_period_end` is not trusted alone.
pub const MONTHLY_PERIOD_DAYS: i64 = 30;
pub const HALFYEAR_PERIOD_DAYS: i64 = 180;

/// Which reported statuses are allowed to commit a projection.
///
/// The historical behavior only persisted `active` and `trialing`: a
/// transient `past_due` never clobbers good state, but a real
/// cancellation also does not clear it on its own. That trade-off is
/// product policy, so it is configurable here rather than hard-coded.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub apply_on: HashSet<SubscriptionStatus>,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            apply_on: HashSet::from([SubscriptionStatus::Active, SubscriptionStatus::Trialing]),
        }
    }
}

impl ReconcilePolicy {
    /// Commit on every status, including cancellations.
    pub fn apply_all() -> Self {
        Self {
            apply_on: HashSet::from([
                SubscriptionStatus::Incomplete,
                SubscriptionStatus::IncompleteExpired,
                SubscriptionStatus::Trialing,
                SubscriptionStatus::Active,
                SubscriptionStatus::PastDue,
                SubscriptionStatus::Canceled,
                SubscriptionStatus::Unpaid,
            ]),
        }
    }

    pub fn applies_to(&self, status: SubscriptionStatus) -> bool {
        self.apply_on.contains(&status)
    }
}

/// What a reconciliation did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Projection committed to the subscriber record.
    Applied,
    /// Projection computed but the write gate skipped the commit.
    Gated(SubscriptionStatus),
    /// A newer event was already applied; this one was skipped.
    Stale,
}

pub struct SubscriptionReconciler<S, C> {
    store: S,
    customers: C,
    policy: ReconcilePolicy,
}

impl<S: BillingStore, C: ProcessorClient> SubscriptionReconciler<S, C> {
    pub fn new(store: S, customers: C, policy: ReconcilePolicy) -> Self {
        Self {
            store,
            customers,
            policy,
        }
    }

    /// Reconcile a `customer.subscription.*` event.
    pub async fn reconcile(&self, event: &WebhookEvent) -> BillingResult<ReconcileOutcome> {
        let subscription = event.subscription_object()?;
        let status: SubscriptionStatus =
            subscription
                .status
                .parse()
                .map_err(|e: pawcademy_shared::UnknownValueError| {
                    BillingError::InvalidWebhookPayload(e.to_string())
                })?;

        // Events carry only the customer reference; the billing email
        // lives on the customer object.
        let customer = self.customers.fetch_customer(&subscription.customer).await?;
        let email = customer.email.ok_or_else(|| {
            BillingError::UpstreamLookup(format!(
                "customer {} has no billing email",
                subscription.customer
            ))
        })?;

        // Placeholder identity until the product links a real user.
        let synthesized_user_id = format!("cus:{}", subscription.customer);
        self.store
            .ensure_subscriber(&email, &synthesized_user_id, &subscription.customer)
            .await?;

        let amount = subscription.unit_amount()?;
        let cycle = tiers::infer_cycle(amount, &subscription.metadata);
        let assignment = tiers::resolve(amount, cycle, status);

        let now = OffsetDateTime::now_utc();
        let period_start = subscription
            .current_period_start
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or(now);
        let period_days = match cycle {
            BillingCycle::Monthly => MONTHLY_PERIOD_DAYS,
            BillingCycle::Halfyearly => HALFYEAR_PERIOD_DAYS,
        };
        let period_end = period_start + Duration::days(period_days);

        let projection = SubscriberProjection {
            processor_customer_id: subscription.customer.clone(),
            subscribed: matches!(
                status,
                SubscriptionStatus::Active | SubscriptionStatus::Trialing
            ),
            tier: assignment.map(|a| a.tier),
            tier_limit: assignment.map(|a| a.limit),
            status,
            subscription_end: Some(period_end),
            current_period_start: Some(period_start),
            current_period_end: Some(period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            billing_cycle: cycle,
            trial_end: subscription
                .trial_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        };

        if !self.policy.applies_to(status) {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                status = %status,
                "Write gate: projection computed but not committed"
            );
            return Ok(ReconcileOutcome::Gated(status));
        }

        let subscriber = self
            .store
            .get_subscriber(&email)
            .await?
            .unwrap_or_else(|| Subscriber {
                email: email.clone(),
                ..Subscriber::default()
            });
        let mark_trial_used = trial::should_consume(&subscriber, status);

        let tier_str = projection.tier.map(|t| t.as_str()).unwrap_or("none");
        let note = format!(
            "[{} status={} tier={} amount={} at={}]",
            event.event_type, status, tier_str, amount, event.created
        );

        let event_time = OffsetDateTime::from_unix_timestamp(event.created).unwrap_or(now);
        let commit = ReconcileCommit {
            projection,
            mark_trial_used,
            note,
            event_time,
        };

        let applied = self.store.apply_reconciliation(&email, &commit).await?;
        if !applied {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                email = %email,
                "Skipping stale event: a newer event was already applied"
            );
            return Ok(ReconcileOutcome::Stale);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            email = %email,
            status = %status,
            tier = %tier_str,
            "Subscriber projection committed"
        );
        Ok(ReconcileOutcome::Applied)
    }
}
