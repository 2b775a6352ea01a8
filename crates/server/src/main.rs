//! Postbox server entry point.

use std::sync::Arc;

use axum::{Router, routing::get};
use postbox_api::{AppState, health, router as api_router};
use postbox_common::Config;
use postbox_core::{EmailService, RetryConfig, TemplateEngine, build_provider};
use postbox_db::repositories::{EmailJobRepository, UserRepository};
use postbox_queue::{ProcessorSupervisor, SupervisorConfig};
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Largest accepted request body; template data is small.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "postbox=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(config.logging.json);

    info!("Starting postbox server...");

    let db = Arc::new(postbox_db::init(&config).await?);
    info!("Connected to database");

    info!("Running database migrations...");
    postbox_db::migrate(&db).await?;
    info!("Migrations completed");

    let provider = build_provider(&config.email)?;
    info!(provider = provider.name(), "Email provider ready");

    let mut email_service = EmailService::new(
        EmailJobRepository::new(Arc::clone(&db)),
        UserRepository::new(Arc::clone(&db)),
        Arc::new(TemplateEngine::from_config(&config.email)),
        provider,
    );
    email_service.set_retry_config(RetryConfig::from(&config.retry));
    email_service.set_stale_claim_timeout(config.processor.stale_claim_timeout());
    let email_service = Arc::new(email_service);

    let supervisor = ProcessorSupervisor::new(
        email_service.clone(),
        SupervisorConfig::from(&config.processor),
    );
    if config.processor.autostart {
        supervisor.start_processor().await;
    } else {
        info!("Email processor autostart disabled; start it through the admin endpoint");
    }

    let state = AppState::new(email_service, supervisor.clone());

    let app = Router::new()
        .route("/healthz", get(health))
        .nest("/api", api_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight ticks get the configured grace period before being aborted.
    supervisor.stop_processor().await;

    info!("Server shutdown complete");
    Ok(())
}
