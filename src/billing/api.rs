//! Billing and usage endpoints for the authenticated tenant.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::auth::{require_role, AuthContext, Role};
use crate::billing::plans::Plan;
use crate::billing::stripe::CheckoutParams;
use crate::billing::usage::{
    check_usage_limit, crosses_threshold, month_to_date, track_usage, usage_percentage_after,
};
use crate::core::errors::ApiError;
use crate::core::models::NewUsageEvent;
use crate::core::schema::organizations;
use crate::core::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TrackUsageRequest {
    pub event_type: String,
    pub credits_used: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct TrackUsageResponse {
    pub success: bool,
    /// `-1` mirrors the unlimited marker used by `limit`.
    pub remaining: i64,
    pub limit: i64,
}

/// Record one credit-consuming event for the caller's organization.
///
/// The limit check and the append are separate operations; see
/// `billing::usage` for the documented race.
pub async fn track_usage_event(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Json(req): Json<TrackUsageRequest>,
) -> Result<Json<TrackUsageResponse>, ApiError> {
    if req.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("Event type required".to_string()));
    }
    let credits_used = req.credits_used.unwrap_or(1);
    if credits_used < 0 {
        return Err(ApiError::BadRequest(
            "credits_used must be non-negative".to_string(),
        ));
    }

    let organization = &ctx.organization;
    let mut conn = state.conn.get()?;

    let check = check_usage_limit(&mut conn, organization.id, credits_used as i64)?;
    if !check.allowed {
        return Err(ApiError::LimitExceeded {
            remaining: 0,
            limit: organization.usage_limit,
        });
    }

    track_usage(
        &mut conn,
        NewUsageEvent {
            organization_id: organization.id,
            user_id: Some(ctx.user.id),
            event_type: req.event_type,
            credits_used,
            metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
        },
    )?;

    if let Some(pct) = usage_percentage_after(check.limit, check.remaining, credits_used as i64) {
        if crosses_threshold(pct) {
            state
                .workflows
                .usage_threshold_reached(organization.id, pct);
        }
    }

    let remaining = if check.limit.is_unlimited() {
        -1
    } else {
        check.remaining - credits_used as i64
    };

    Ok(Json(TrackUsageResponse {
        success: true,
        remaining,
        limit: organization.usage_limit,
    }))
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
}

/// Month-to-date ledger readout for the caller's organization.
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
) -> Result<Json<UsageResponse>, ApiError> {
    let mut conn = state.conn.get()?;
    let used = month_to_date(&mut conn, ctx.organization.id)?;

    let limit = ctx.organization.usage_limit;
    let remaining = if ctx.organization.allowance().is_unlimited() {
        -1
    } else {
        (limit - used).max(0)
    };

    Ok(Json(UsageResponse {
        used,
        limit,
        remaining,
    }))
}

#[derive(Debug, Serialize)]
pub struct PlanListing {
    pub id: &'static str,
    pub name: &'static str,
    pub price_cents: i64,
    pub credits_per_month: i64,
    pub features: &'static [&'static str],
    pub price_id: Option<String>,
}

pub async fn list_plans(State(state): State<Arc<AppState>>) -> Json<Vec<PlanListing>> {
    let price_map = state.config.price_map();
    let plans = Plan::all()
        .into_iter()
        .map(|plan| PlanListing {
            id: plan.as_str(),
            name: plan.display_name(),
            price_cents: plan.monthly_price_cents(),
            credits_per_month: plan.credit_allowance().as_raw(),
            features: plan.features(),
            price_id: price_map.price_id(plan).map(str::to_string),
        })
        .collect();
    Json(plans)
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub price_id: String,
}

#[derive(Debug, Serialize)]
pub struct RedirectResponse {
    pub url: String,
}

/// Create a hosted checkout session for a subscription upgrade.
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<RedirectResponse>, ApiError> {
    require_role(&ctx, &[Role::Owner, Role::Admin])?;

    if req.price_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Price ID required".to_string()));
    }

    let organization = &ctx.organization;
    let customer = state
        .stripe
        .find_or_create_customer(&ctx.user.email, Some(&organization.name), organization.id)
        .await?;

    if organization.stripe_customer_id.is_none() {
        let mut conn = state.conn.get()?;
        diesel::update(organizations::table.find(organization.id))
            .set((
                organizations::stripe_customer_id.eq(Some(customer.id.clone())),
                organizations::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
    }

    let app_url = &state.config.app_url;
    let session = state
        .stripe
        .create_checkout_session(CheckoutParams {
            customer_id: customer.id,
            price_id: req.price_id,
            organization_id: organization.id,
            success_url: format!("{app_url}/dashboard/billing?success=true"),
            cancel_url: format!("{app_url}/dashboard/billing?canceled=true"),
        })
        .await?;

    let url = session
        .url
        .ok_or_else(|| ApiError::Unavailable("checkout session has no redirect URL".to_string()))?;

    Ok(Json(RedirectResponse { url }))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: Plan,
}

#[derive(Debug, Serialize)]
pub struct ChangePlanResponse {
    pub success: bool,
    pub plan: Plan,
}

/// Administrative plan change for an organization with a live subscription.
///
/// This only instructs the payment processor; the organization row itself is
/// mutated when the resulting `customer.subscription.updated` (or deleted)
/// webhook arrives, so plan and usage limit stay under a single writer.
pub async fn change_plan(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Json(req): Json<ChangePlanRequest>,
) -> Result<Json<ChangePlanResponse>, ApiError> {
    require_role(&ctx, &[Role::Owner])?;

    let subscription_id = ctx
        .organization
        .stripe_subscription_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("No active subscription".to_string()))?;

    match req.plan {
        Plan::Free => {
            // Downgrades run out the paid period rather than cutting it off.
            state
                .stripe
                .cancel_subscription(subscription_id, false)
                .await?;
        }
        plan => {
            let price_map = state.config.price_map();
            let price_id = price_map
                .price_id(plan)
                .ok_or_else(|| ApiError::BadRequest("Plan has no price".to_string()))?;
            state
                .stripe
                .update_subscription(subscription_id, price_id)
                .await?;
        }
    }

    Ok(Json(ChangePlanResponse {
        success: true,
        plan: req.plan,
    }))
}

/// Create a customer-portal session for self-service billing management.
pub async fn billing_portal(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
) -> Result<Json<RedirectResponse>, ApiError> {
    require_role(&ctx, &[Role::Owner, Role::Admin])?;

    let customer_id = ctx
        .organization
        .stripe_customer_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("No billing customer found".to_string()))?;

    let session = state
        .stripe
        .create_portal_session(
            customer_id,
            &format!("{}/dashboard/billing", state.config.app_url),
        )
        .await?;

    Ok(Json(RedirectResponse { url: session.url }))
}
