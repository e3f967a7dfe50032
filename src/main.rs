//! Payme Gateway - Main Application Entry Point
//!
//! This is a payment gateway service bridging the Payme payment provider and
//! the Billz billing system. It serves the provider's JSON-RPC callback
//! endpoint, creates checkout sessions, and dispatches paid orders to Billz
//! exactly once.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries)
//! - **Authentication**: merchant key check on the provider callback route
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Build external-system clients and the HTTP router
//! 5. Start server on configured port

mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use services::{
    billz_client::{BillzClient, BillzConfig},
    payme_service::PaymeService,
    sms::{SmsClient, SmsConfig},
    telegram::TelegramClient,
};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    // Long-lived clients for the external systems
    let billz = BillzClient::new(BillzConfig {
        auth_url: config.billz_auth_url.clone(),
        base_url: config.billz_base_url.clone(),
        api_secret_key: config.billz_api_secret_key.clone(),
        shop_id: config.billz_shop_id.clone(),
        cashbox_id: config.billz_cashbox_id.clone(),
        payment_type_id: config.billz_payment_type_id.clone(),
    });
    let telegram = TelegramClient::new(
        config.telegram_bot_token.clone(),
        config.telegram_admin_chat_id.clone(),
    );
    let sms = SmsClient::new(SmsConfig {
        base_url: config.sms_base_url.clone(),
        username: config.sms_username.clone(),
        password: config.sms_password.clone(),
        enabled: config.sms_enabled,
    });
    let payme = PaymeService::new(pool.clone(), billz.clone(), telegram.clone());

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        payme,
        billz,
        telegram,
        sms,
    };

    // Provider callback route behind the merchant authentication check
    let provider_routes = Router::new()
        .route("/payme/pay", post(handlers::payme::pay))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::payme_auth::payme_auth,
        ));

    let app = Router::new()
        // Public routes (no provider authentication required)
        .route("/health", get(handlers::health::health_check))
        .route("/api/v1/payme/checkout", post(handlers::payme::checkout))
        .route("/api/v1/orders", post(handlers::orders::create_cash_order))
        // Merge provider callback routes
        .merge(provider_routes)
        // Add distributed tracing middleware for observability
        .layer(TraceLayer::new_for_http())
        // Share state with all handlers via State extraction
        .with_state(state);

    // Bind to network address and start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Start serving HTTP requests
    // This blocks forever, handling requests concurrently with tokio
    axum::serve(listener, app).await?;

    Ok(())
}
