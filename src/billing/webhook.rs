//! Billing webhook processor: the state machine over `Organization.plan`
//! driven by payment-processor events.
//!
//! Signature verification precedes all parsing and state lookups. Delivery
//! may duplicate or reorder events, so transitions are idempotent by
//! comparing the resolved target plan against the stored plan: a re-applied
//! `customer.subscription.updated` is a no-op, including its notification.
//! Events whose tenant cannot be resolved are acknowledged and skipped to
//! avoid redelivery storms.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde_json::{json, Value};

use crate::billing::plans::{Plan, PriceMap};
use crate::billing::stripe::{CheckoutSession, StripeEvent, Subscription};
use crate::core::errors::ApiError;
use crate::core::models::Organization;
use crate::core::schema::organizations;
use crate::core::state::AppState;

/// Target plan for a subscription state. Anything that is not an active
/// subscription on a known price resolves to free.
pub fn resolve_target_plan(price_map: &PriceMap, status: &str, price_id: Option<&str>) -> Plan {
    if status != "active" {
        return Plan::Free;
    }
    match price_id {
        Some(id) => price_map.resolve(id),
        None => Plan::Free,
    }
}

/// `Some((old, new))` when the stored plan differs from the target. This
/// comparison is the processor's only idempotency/ordering defense.
pub fn plan_transition(current: Plan, target: Plan) -> Option<(Plan, Plan)> {
    if current == target {
        None
    } else {
        Some((current, target))
    }
}

pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    let event = state.stripe.verify_webhook_signature(&body, signature)?;
    let event = state.stripe.parse_event(&event)?;

    match event {
        StripeEvent::CheckoutCompleted(session) => {
            apply_checkout_completed(&state, session)?;
        }
        StripeEvent::SubscriptionUpdated(subscription) => {
            apply_subscription_updated(&state, subscription)?;
        }
        StripeEvent::SubscriptionDeleted(subscription) => {
            apply_subscription_deleted(&state, subscription)?;
        }
        StripeEvent::InvoicePaymentSucceeded(invoice) => {
            if let Some(org) = org_by_customer(&state, &invoice.customer)? {
                state
                    .workflows
                    .payment_succeeded(org.id, invoice.amount_paid, &invoice.id);
            } else {
                tracing::warn!(customer = %invoice.customer, "payment succeeded for unknown customer, skipping");
            }
        }
        StripeEvent::InvoicePaymentFailed(invoice) => {
            if let Some(org) = org_by_customer(&state, &invoice.customer)? {
                state
                    .workflows
                    .payment_failed(org.id, &invoice.failure_reason());
            } else {
                tracing::warn!(customer = %invoice.customer, "payment failed for unknown customer, skipping");
            }
        }
        StripeEvent::Unknown(kind) => {
            tracing::debug!("unhandled Stripe webhook event: {kind}");
        }
    }

    Ok(Json(json!({ "received": true })))
}

fn apply_checkout_completed(state: &AppState, session: CheckoutSession) -> Result<(), ApiError> {
    let (Some(organization_id), Some(subscription_id)) =
        (session.organization_id(), session.subscription.clone())
    else {
        tracing::warn!(session = %session.id, "checkout completed without tenant/subscription refs, skipping");
        return Ok(());
    };

    let mut conn = state.conn.get()?;
    diesel::update(organizations::table.find(organization_id))
        .set((
            organizations::stripe_customer_id.eq(session.customer.clone()),
            organizations::stripe_subscription_id.eq(Some(subscription_id)),
            organizations::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)?;

    state
        .workflows
        .payment_succeeded(organization_id, session.amount_total.unwrap_or(0), &session.id);

    Ok(())
}

fn apply_subscription_updated(
    state: &AppState,
    subscription: Subscription,
) -> Result<(), ApiError> {
    let Some(org) = org_by_subscription(state, &subscription.id)? else {
        tracing::warn!(subscription = %subscription.id, "subscription update for unknown tenant, skipping");
        return Ok(());
    };

    let price_map = state.config.price_map();
    let target = resolve_target_plan(&price_map, &subscription.status, subscription.price_id());

    let Some((old_plan, new_plan)) = plan_transition(org.plan(), target) else {
        return Ok(());
    };

    // Plan and usage_limit always change together.
    let mut conn = state.conn.get()?;
    diesel::update(organizations::table.find(org.id))
        .set((
            organizations::plan.eq(new_plan.as_str()),
            organizations::usage_limit.eq(new_plan.credit_allowance().as_raw()),
            organizations::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)?;

    state.workflows.plan_upgraded(org.id, old_plan, new_plan);

    Ok(())
}

fn apply_subscription_deleted(
    state: &AppState,
    subscription: Subscription,
) -> Result<(), ApiError> {
    let mut conn = state.conn.get()?;
    let downgraded = diesel::update(
        organizations::table.filter(organizations::stripe_subscription_id.eq(&subscription.id)),
    )
    .set((
        organizations::plan.eq(Plan::Free.as_str()),
        organizations::usage_limit.eq(Plan::Free.credit_allowance().as_raw()),
        organizations::stripe_subscription_id.eq(None::<String>),
        organizations::updated_at.eq(Utc::now()),
    ))
    .execute(&mut conn)?;

    if downgraded == 0 {
        tracing::warn!(subscription = %subscription.id, "subscription deletion for unknown tenant, skipping");
    }

    Ok(())
}

fn org_by_subscription(
    state: &AppState,
    subscription_id: &str,
) -> Result<Option<Organization>, ApiError> {
    let mut conn = state.conn.get()?;
    Ok(organizations::table
        .filter(organizations::stripe_subscription_id.eq(subscription_id))
        .first(&mut conn)
        .optional()?)
}

fn org_by_customer(state: &AppState, customer_id: &str) -> Result<Option<Organization>, ApiError> {
    let mut conn = state.conn.get()?;
    Ok(organizations::table
        .filter(organizations::stripe_customer_id.eq(customer_id))
        .first(&mut conn)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_map() -> PriceMap {
        PriceMap::new("price_pro".to_string(), "price_ent".to_string())
    }

    #[test]
    fn active_subscription_resolves_by_price() {
        let map = price_map();
        assert_eq!(
            resolve_target_plan(&map, "active", Some("price_pro")),
            Plan::Pro
        );
        assert_eq!(
            resolve_target_plan(&map, "active", Some("price_ent")),
            Plan::Enterprise
        );
    }

    #[test]
    fn unknown_price_resolves_free() {
        assert_eq!(
            resolve_target_plan(&price_map(), "active", Some("price_legacy")),
            Plan::Free
        );
    }

    #[test]
    fn non_active_status_resolves_free() {
        let map = price_map();
        for status in ["past_due", "canceled", "unpaid", "trialing", "paused"] {
            assert_eq!(resolve_target_plan(&map, status, Some("price_pro")), Plan::Free);
        }
    }

    #[test]
    fn missing_price_resolves_free() {
        assert_eq!(resolve_target_plan(&price_map(), "active", None), Plan::Free);
    }

    #[test]
    fn transition_fires_once_for_duplicate_events() {
        // First delivery: free -> pro.
        assert_eq!(
            plan_transition(Plan::Free, Plan::Pro),
            Some((Plan::Free, Plan::Pro))
        );
        // Redelivered event after the plan was stored: no-op, no notification.
        assert_eq!(plan_transition(Plan::Pro, Plan::Pro), None);
    }

    #[test]
    fn downgrade_is_a_transition_too() {
        assert_eq!(
            plan_transition(Plan::Enterprise, Plan::Free),
            Some((Plan::Enterprise, Plan::Free))
        );
    }
}
