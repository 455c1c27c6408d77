//! Process bootstrap: parse configuration, wire up tracing, open the
//! Postgres pool, run migrations, recover the fleet's mid-flight instances,
//! and serve the HTTP surface until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use whatsapp_fleet::api::{self, AppState};
use whatsapp_fleet::config::FleetConfig;
use whatsapp_fleet::fleet::Fleet;
use whatsapp_fleet::protocol::ProtocolClient;
use whatsapp_fleet::store::registry::PostgresInstanceRegistry;
use whatsapp_fleet::store::session_repo::PostgresSessionRepository;
use whatsapp_fleet::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FleetConfig::parse();
    telemetry::init(config.environment);

    tracing::info!(
        port = config.port,
        max_instances = config.max_instances,
        "starting whatsapp-fleet"
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(config.database_url.expose_secret())
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let registry = Arc::new(PostgresInstanceRegistry::new(pool.clone()));
    let session_repo = Arc::new(PostgresSessionRepository::new(pool));
    let protocol: Arc<dyn ProtocolClient> = production_protocol_client();

    let fleet = Fleet::new(
        registry,
        session_repo.clone(),
        protocol,
        config.max_instances,
        Duration::from_millis(config.staggered_boot_delay_ms),
    );

    tracing::info!("starting cold-start recovery");
    if let Err(err) = fleet.recover().await {
        tracing::error!(error = %err, "boot recovery failed");
    }

    let state = AppState {
        fleet: fleet.clone(),
        session_repo,
    };
    let router = api::router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("http server stopped, flushing fleet state");
    fleet.shutdown().await;
    tracing::info!("good night");
    Ok(())
}

#[cfg(feature = "full")]
fn production_protocol_client() -> Arc<dyn ProtocolClient> {
    Arc::new(whatsapp_fleet::protocol::real::RealProtocolClient::default())
}

/// Without the `full` feature, the real Noise/binary-protocol transport
/// isn't compiled in; fall back to the in-memory double so the binary still
/// runs (e.g. for local smoke-testing against a fake WhatsApp endpoint).
#[cfg(not(feature = "full"))]
fn production_protocol_client() -> Arc<dyn ProtocolClient> {
    tracing::warn!("built without the `full` feature: using the in-memory fake protocol client");
    Arc::new(whatsapp_fleet::protocol::fake::FakeProtocolClient::new())
}

/// Waits for Ctrl+C or SIGTERM (spec.md §5's shutdown protocol).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received sigterm"),
    }
}
