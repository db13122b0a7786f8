use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use genserve::config::{Args, ServerConfig};
use genserve::engine::{EchoEngine, GenerationEngine};
use genserve::http_server;
use genserve::logging;
use genserve::registry::RequestRegistry;

#[tokio::main]
async fn main() {
    logging::init("info");

    let args = Args::parse();
    let config = ServerConfig::from_args(&args);

    info!("=== genserve: streaming generation demo ===");
    info!(
        "max_concurrent={}, timeout={}s, on_capacity={:?}",
        config.max_concurrent,
        config.timeout.as_secs(),
        config.on_capacity
    );

    let engine: Arc<dyn GenerationEngine> =
        Arc::new(EchoEngine::new(Duration::from_millis(args.token_delay_ms)));
    let registry = RequestRegistry::new(config.max_concurrent, config.on_capacity);

    let app = http_server::build_app(
        Arc::clone(&registry),
        engine,
        config,
        &args.static_dir,
    );

    let addr = format!("0.0.0.0:{}", args.port);
    info!("Server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Controlled teardown: release engine-side work held by any request that
    // was still streaming when the listener stopped.
    registry.shutdown();
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
