use anyhow::{bail, Context};

use crate::billing::plans::PriceMap;

/// Application configuration, resolved once at startup from the process
/// environment (`.env` is loaded by `main` before this runs).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    /// Backing store for rate-limit counters. When absent the gate runs in
    /// degraded fail-open mode.
    pub redis_url: Option<String>,
    /// Public base URL of the product, used for checkout/portal redirects.
    pub app_url: String,
    pub stripe: StripeConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_id_pro: String,
    pub price_id_enterprise: String,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub base_url: String,
    pub api_key: String,
    /// Shared secret for inbound callback signatures. Optional: without it
    /// every callback is rejected, which is logged at startup.
    pub webhook_secret: Option<String>,
}

fn required(key: &str) -> anyhow::Result<String> {
    let value = std::env::var(key).with_context(|| format!("{key} is not set"))?;
    if value.trim().is_empty() {
        bail!("{key} is set but empty");
    }
    Ok(value)
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let server = ServerConfig {
            host: optional("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: optional("SERVER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
        };

        let stripe = StripeConfig {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            price_id_pro: required("STRIPE_PRICE_ID_PRO")?,
            price_id_enterprise: required("STRIPE_PRICE_ID_ENTERPRISE")?,
        };

        let workflow = WorkflowConfig {
            base_url: required("N8N_WEBHOOK_URL")?,
            api_key: required("N8N_API_KEY")?,
            webhook_secret: optional("N8N_WEBHOOK_SECRET"),
        };

        Ok(Self {
            server,
            database_url: required("DATABASE_URL")?,
            redis_url: optional("REDIS_URL"),
            app_url: optional("APP_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            stripe,
            workflow,
        })
    }

    /// Stripe price id -> plan mapping used by the webhook processor.
    pub fn price_map(&self) -> PriceMap {
        PriceMap::new(
            self.stripe.price_id_pro.clone(),
            self.stripe.price_id_enterprise.clone(),
        )
    }
}
