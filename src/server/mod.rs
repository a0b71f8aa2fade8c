pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::crypto::CredentialStore;
use crate::platform::PlatformClient;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub credential_store: CredentialStore,
    pub platform_client: Arc<PlatformClient>,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig) -> Self {
        let credential_store = CredentialStore::from_secret(&config.token_encryption_key);
        let platform_client = PlatformClient::new(
            config.twitter_client_id.clone(),
            config.twitter_client_secret.clone(),
            config.mock_x_api,
        );

        Self {
            pool,
            config: Arc::new(config),
            credential_store,
            platform_client: Arc::new(platform_client),
        }
    }
}

pub fn configure_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/cron/publish", post(handlers::publish_cron))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
