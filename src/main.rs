use fleet_publisher::config::AppConfig;
use fleet_publisher::database;
use fleet_publisher::server::{configure_app, AppState};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter("fleet_publisher=debug,tower_http=debug")
        .init();

    let config = AppConfig::from_env();

    let pool = database::get_connection_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");
    database::migrate_database(&pool)
        .await
        .expect("Failed to run database migrations");

    let port = config.port;
    let state = AppState::new(pool, config);
    let app = configure_app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    info!("✨ Server ready:");
    info!("  🌎 http://{}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}
