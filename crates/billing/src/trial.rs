//! Trial usage tracking.
//!
//! The `trial_used` flag is one-way: set the first time a trialing event
//! is observed for a subscriber, never unset. Trial eligibility and trial
//! start are decided upstream of this engine.

use pawcademy_shared::SubscriptionStatus;

use crate::storage::Subscriber;

/// Whether this event consumes the subscriber's trial.
///
/// True only for the first trialing observation; the store ORs the flag
/// in, so repeated trialing events are harmless either way.
pub fn should_consume(subscriber: &Subscriber, status: SubscriptionStatus) -> bool {
    status == SubscriptionStatus::Trialing && !subscriber.trial_used
}
