use impressions_relay::config::Config;
use impressions_relay::{HttpExporter, WorkerPool, listener};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("SPLIT_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid SPLIT_RELAY_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        error!("a rustls crypto provider was already installed");
    }
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));
    info!(
        sdk_url = %config.sdk_url,
        events_url = %config.events_url,
        listener_port = config.listener_port,
        "impressions relay starting"
    );

    let exporter =
        HttpExporter::new(&config).unwrap_or_else(|e| fatal("failed to build exporter", &e));
    info!(url = %exporter.url(), "posting impressions upstream");

    let listener = TcpListener::bind(("0.0.0.0", config.listener_port))
        .await
        .unwrap_or_else(|e| fatal("failed to bind impressions listener", &e));

    let (ingestor, pool) = WorkerPool::initialize(config.pipeline(), exporter);
    let cancel = CancellationToken::new();
    let server = tokio::spawn(listener::serve(listener, ingestor, cancel.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!(pending = pool.pending(), "shutting down, draining impressions");

    cancel.cancel();
    if let Err(e) = server.await {
        error!(error = %e, "impressions listener task panicked");
    }
    pool.shutdown().await;
}
