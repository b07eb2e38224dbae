//! Kazari server entry point.

mod admin;
mod workers;

use std::net::SocketAddr;
use std::sync::Arc;

use kazari_common::Config;
use kazari_db::repositories::JobRepository;
use kazari_queue::{EventBus, QueueOrchestrator};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workers::Queues;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kazari=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting kazari server...");

    // Load configuration
    let config = Config::load()?;

    // Connect to database
    let db = kazari_db::init(&config).await?;
    info!("Connected to database");

    // Run migrations
    info!("Running database migrations...");
    kazari_db::migrate(&db).await?;
    info!("Migrations completed");

    let db = Arc::new(db);
    let repo = JobRepository::new(db.clone());

    // Cluster event bus
    let event_bus = EventBus::new(db.clone());
    let listener_shutdown = CancellationToken::new();
    if config.events.listener {
        let bus = event_bus.clone();
        let token = listener_shutdown.clone();
        tokio::spawn(async move { bus.listen(token).await });
    } else {
        info!("Cluster event listener disabled; this node only publishes events");
    }

    // Queues and orchestrator
    let queues = Queues::build(&repo, &config.queue);
    let orchestrator = Arc::new(QueueOrchestrator::new(
        repo,
        config.queue.clone(),
        queues.controls(),
    ));
    orchestrator.start().await?;

    // Build router
    let app = admin::router(orchestrator.clone()).layer(TraceLayer::new_for_http());

    // Start server with graceful shutdown
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Two-phase queue shutdown after the HTTP surface drains
    listener_shutdown.cancel();
    orchestrator.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
