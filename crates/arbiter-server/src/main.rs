use std::sync::Arc;

use arbiter_server::cli::{Cli, Command};
use arbiter_server::config::{AppConfig, LogFormat};
use arbiter_server::metrics::Metrics;
use arbiter_server::rest;
use arbiter_server::service::{AuthzService, Timeouts};
use arbiter_storage::{InMemoryStoreFactory, SnapshotManager};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    match cli.command {
        Some(Command::Serve) | None => run_serve(config).await,
    }
}

async fn run_serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = config.http_addr().parse()?;
    tracing::info!(%addr, "starting arbiter server");

    let factory = Arc::new(InMemoryStoreFactory::new());
    let snapshots = Arc::new(SnapshotManager::new(
        Arc::clone(&factory),
        config.to_snapshot_config(),
    ));
    snapshots.start().await?;

    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(
        AuthzService::new(
            Arc::clone(&factory),
            Arc::clone(&snapshots),
            config.to_engine_config(),
            config.to_schema_limits(),
        )
        .with_timeouts(Timeouts {
            default: config.default_timeout(),
            max: config.max_timeout(),
        })
        .with_metrics(Arc::clone(&metrics)),
    );

    let state = rest::AppState {
        service,
        metrics: Arc::clone(&metrics),
    };
    let router = rest::create_router(state, config.http.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "REST server listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server => {
            report_exit(result);
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            let grace = config.grace_period();
            tracing::info!(grace_ms = grace.as_millis() as u64, "draining in-flight requests");
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => report_exit(result),
                Err(_) => {
                    tracing::warn!("grace period elapsed, aborting remaining requests");
                    server.abort();
                }
            }
        }
    }

    snapshots.stop();
    tracing::info!("server shut down");
    Ok(())
}

fn report_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "REST server error"),
        Err(e) => tracing::error!(error = %e, "REST server task failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { tracing::info!("received SIGINT"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT");
        }
    }
}
