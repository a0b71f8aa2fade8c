use std::env;

use chrono_tz::Tz;

/// Process-wide configuration loaded once at startup from the environment.
#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub token_encryption_key: String,
    pub twitter_client_id: Option<String>,
    pub twitter_client_secret: Option<String>,
    pub cron_secret: Option<String>,
    pub mock_x_api: bool,
    pub publisher_timezone: Tz,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the environment. Panics on a missing required
    /// variable — this runs once at process start.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let token_encryption_key =
            env::var("TOKEN_ENCRYPTION_KEY").expect("TOKEN_ENCRYPTION_KEY must be set");

        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let publisher_timezone = env::var("PUBLISHER_TIMEZONE")
            .ok()
            .and_then(|tz| tz.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC);

        let mock_x_api = env::var("MOCK_X_API")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            database_url,
            port,
            token_encryption_key,
            twitter_client_id: env::var("AUTH_TWITTER_ID").ok(),
            twitter_client_secret: env::var("AUTH_TWITTER_SECRET").ok(),
            cron_secret: env::var("CRON_SECRET").ok(),
            mock_x_api,
            publisher_timezone,
        }
    }
}
