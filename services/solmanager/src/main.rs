// solmanager: Mesh edge gateway.
// Attaches to a SmartMesh Manager, normalizes its notification stream
// into SOL objects, and publishes them to a backup file and the
// aggregation server.

use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "solmanager starting");

    // TLS for the control API and the upstream publisher.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cfg = match std::env::args().nth(1) {
        Some(path) => solmanager::config::load_config_from_path(&PathBuf::from(path)),
        None => solmanager::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                mode = ?cfg.manager.mode,
                solserver = %cfg.solserver.host,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let code = solmanager::supervisor::run(cfg, shutdown_rx).await;
    info!(code, "solmanager exiting");
    std::process::exit(code);
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
