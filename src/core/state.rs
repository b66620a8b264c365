use std::sync::Arc;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

use crate::billing::stripe::StripeClient;
use crate::config::AppConfig;
use crate::core::rate_limit::RateLimitService;
use crate::workflows::client::WorkflowClient;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Shared application state. All external clients are constructed here,
/// once, and injected into handlers through axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub cache: Option<Arc<redis::Client>>,
    pub stripe: Arc<StripeClient>,
    pub workflows: Arc<WorkflowClient>,
    pub rate_limits: Arc<RateLimitService>,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
        let conn = Pool::builder().max_size(10).build(manager)?;

        let cache = match &config.redis_url {
            Some(url) => match redis::Client::open(url.as_str()) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    tracing::warn!("invalid REDIS_URL, rate limiting disabled: {e}");
                    None
                }
            },
            None => {
                tracing::warn!("REDIS_URL not configured, rate limiting disabled");
                None
            }
        };

        let stripe = Arc::new(StripeClient::new(
            config.stripe.secret_key.clone(),
            config.stripe.webhook_secret.clone(),
        ));

        if config.workflow.webhook_secret.is_none() {
            tracing::warn!("N8N_WEBHOOK_SECRET not configured, workflow callbacks will be rejected");
        }
        let workflows = Arc::new(WorkflowClient::new(
            config.workflow.base_url.clone(),
            config.workflow.api_key.clone(),
            config.workflow.webhook_secret.clone(),
        ));

        let rate_limits = Arc::new(RateLimitService::new(cache.clone()));

        Ok(Self {
            config,
            conn,
            cache,
            stripe,
            workflows,
            rate_limits,
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cache", &self.cache.is_some())
            .field("conn", &"DbPool")
            .finish()
    }
}

/// Run embedded migrations against the pool.
pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migration error: {e}"))?;
    Ok(())
}
