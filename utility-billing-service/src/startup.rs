//! Application startup and lifecycle management.

use crate::config::UtilityBillingConfig;
use crate::handlers;
use crate::services::{
    init_metrics, spawn_event_logger, BillingLedger, Database, LedgerEventPublisher,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<BillingLedger>,
}

/// Health, metrics and ledger routes over `state`.
pub fn router(state: AppState) -> Router {
    let ledger_routes = Router::new()
        .route(
            "/statements",
            post(handlers::create_statement).get(handlers::list_statements),
        )
        .route("/statements/import", post(handlers::import_statements))
        .route(
            "/statements/:statement_id",
            get(handlers::get_statement)
                .patch(handlers::update_statement)
                .delete(handlers::delete_statement),
        )
        .route("/summary", get(handlers::summarize_history));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/v1/owners/:owner_id", ledger_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    db: Arc<Database>,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: UtilityBillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: UtilityBillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: UtilityBillingConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let (publisher, events) = LedgerEventPublisher::channel(config.events.buffer);
        spawn_event_logger(events);

        let ledger = BillingLedger::new(db.clone()).with_events(publisher);
        let state = AppState {
            ledger: Arc::new(ledger),
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Utility billing listener bound");

        Ok(Self {
            http_port,
            http_listener,
            db,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let app = router(self.state);

        tracing::info!(
            service = "utility-billing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, app).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
