use anyhow::{Context, Result};
use metrics::describe_counter;
use snapvault_storage::api::{start_api_server, AppState};
use snapvault_storage::{Config, ObjectBroker};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting SnapVault object broker"
    );

    // Missing backend credentials are fatal: never serve traffic without them
    let backend_config = config
        .backend
        .resolve()
        .context("Object storage backend is not configured")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let broker = Arc::new(ObjectBroker::from_config(&backend_config, config.cache_ttl()));

    let api_state = AppState::new(broker, &config.api).context("Invalid API configuration")?;

    // Spawn API server task
    let api_config = config.api.clone();
    let mut api_handle =
        tokio::spawn(async move { start_api_server(api_state, &api_config).await });
    let api_abort = api_handle.abort_handle();

    info!(
        container = %backend_config.container,
        "Object broker started successfully"
    );

    // Run until a shutdown signal, or until the server stops on its own
    tokio::select! {
        received = shutdown_signal() => {
            info!(signal = received, "Shutting down object broker");
            api_abort.abort();
        }
        result = &mut api_handle => {
            let served = result.context("API server task failed")?;
            if let Err(e) = served {
                error!(error = %e, "API server error");
                return Err(e);
            }
            info!("API server exited");
        }
    }

    info!("Object broker stopped");

    Ok(())
}

/// JSON logs; `RUST_LOG` overrides the configured level
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},tower_http=info")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_current_span(true))
        .init();
}

/// Install the Prometheus exporter and register the broker counters
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    describe_counter!("broker.credentials.issued", "Upload credentials issued");
    describe_counter!("broker.policies.attached", "ACL policies written to objects");
    describe_counter!("broker.downloads.served", "Object downloads streamed");
    describe_counter!("broker.downloads.denied", "Object downloads refused by policy");
    describe_counter!("broker.downloads.not_found", "Object downloads for missing objects");

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, returning the signal name.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
