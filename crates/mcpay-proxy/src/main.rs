use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcpay_proxy::{
    config::ProxyConfig, db::Database, metrics::register_metrics, routes, state::AppState,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ProxyConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let rate_limit_rpm = config.rate_limit_rpm;

    tracing::info!("Starting mcpay-proxy on port {}", port);
    tracing::info!("Facilitator URL: {}", config.facilitator_url);
    tracing::info!("Default network: {}", config.pipeline.default_network);
    tracing::info!(
        "HMAC auth: {}",
        if config.hmac_secret.is_some() {
            "enabled"
        } else {
            "disabled (dev mode)"
        }
    );
    tracing::info!(
        "Auto-signing: {}",
        if config.signer_url.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let db = match Database::new(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to initialize database: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("Database initialized at: {}", config.db_path);

    register_metrics();

    let state = match AppState::new(config, db) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to build application state: {e}");
            std::process::exit(1);
        }
    };
    let state_data = web::Data::new(state);

    let governor_conf = match GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm as u64)
        .finish()
    {
        Some(conf) => conf,
        None => {
            tracing::error!("Invalid RATE_LIMIT_RPM: {rate_limit_rpm}");
            std::process::exit(1);
        }
    };

    HttpServer::new(move || {
        let cors = mcpay_proxy::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(10 * 1024 * 1024)) // 10MB body limit
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Governor::new(&governor_conf))
            .configure(routes::health::configure)
            .configure(routes::analytics::configure)
            .configure(routes::proxy::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
