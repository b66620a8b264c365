use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth;
use crate::billing;
use crate::core::rate_limit::rate_limit_middleware;
use crate::core::state::AppState;
use crate::workflows;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/signup", post(auth::signup))
        .route("/api/usage", get(billing::api::get_usage))
        .route("/api/usage/track", post(billing::api::track_usage_event))
        .route("/api/billing/plans", get(billing::api::list_plans))
        .route(
            "/api/billing/create-checkout",
            post(billing::api::create_checkout),
        )
        .route("/api/billing/portal", post(billing::api::billing_portal))
        .route(
            "/api/billing/change-plan",
            post(billing::api::change_plan),
        )
        .route(
            "/api/webhooks/stripe",
            post(billing::webhook::stripe_webhook),
        )
        .route(
            "/api/webhooks/workflows",
            post(workflows::callbacks::workflow_callback),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness probe with a summary of the external backends.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let database = state.conn.get().is_ok();

    let cache = match &state.cache {
        Some(client) => {
            let ping = async {
                let mut conn = client.get_multiplexed_async_connection().await.ok()?;
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                pong.ok()
            };
            matches!(
                tokio::time::timeout(Duration::from_secs(2), ping).await,
                Ok(Some(_))
            )
        }
        None => false,
    };

    Json(json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "cache": cache,
    }))
}
