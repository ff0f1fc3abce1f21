use anyhow::Result;
use axum::serve;
use fulcrum_http_core::{
    config::AppConfig,
    p2p::{BlockSource, P2pPeer},
    proxy::ProxyEngine,
    upstream::{ElectrumConnector, PoolManager},
};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use server::router;
use std::{sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long the P2P supervisor gets to wind down after the HTTP server stops.
const P2P_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const WORKSPACE_TARGETS: &[&str] = &["fulcrum_http_core", "server"];

/// Initializes logging from `RUST_LOG`, falling back to the configured level for the
/// workspace crates and `warn` for dependencies.
fn init_logging(config: &AppConfig) {
    let scoped = |level: &str| {
        let directives: Vec<String> =
            WORKSPACE_TARGETS.iter().map(|target| format!("{target}={level}")).collect();
        EnvFilter::new(format!("warn,{}", directives.join(",")))
    };

    let filter = match std::env::var("RUST_LOG") {
        Ok(level) if level == "debug" || level == "trace" => scoped(&level),
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| scoped(&config.logging.level)),
        Err(_) => scoped(&config.logging.level),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("Failed to install crypto provider: {e:?}"))?;

    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration loading failed: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!("Starting Fulcrum HTTP gateway");
    debug!(
        default_server = %config.upstream.default_server,
        idle_timeout_seconds = config.upstream.idle_timeout_seconds,
        p2p_enabled = config.p2p.enabled,
        p2p_peer = %format!("{}:{}", config.p2p.host, config.p2p.port),
        "Configuration loaded"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let peer = Arc::new(
        P2pPeer::new(config.p2p.clone())
            .map_err(|e| anyhow::anyhow!("P2P peer initialization failed: {e}"))?,
    );
    let peer_handle = tokio::spawn(Arc::clone(&peer).run(shutdown_tx.subscribe()));

    let pool = Arc::new(PoolManager::new(
        Arc::new(ElectrumConnector::new(config.upstream.clone())),
        config.upstream.idle_timeout(),
    ));
    let proxy_engine = Arc::new(ProxyEngine::new(
        Arc::clone(&pool),
        peer as Arc<dyn BlockSource>,
        config.upstream.default_server.clone(),
    ));

    let app = router::create_app(proxy_engine, &config.server);
    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "RPC server listening");

    if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server error occurred");
    }

    let _ = shutdown_tx.send(());
    pool.shutdown().await;

    match tokio::time::timeout(P2P_SHUTDOWN_TIMEOUT, peer_handle).await {
        Ok(Ok(())) => debug!("P2P supervisor stopped"),
        Ok(Err(e)) => warn!(error = %e, "P2P supervisor task failed"),
        Err(_) => warn!("P2P supervisor did not stop in time"),
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight requests");
}
