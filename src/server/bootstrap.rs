use crate::{config, server};
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. `None` keeps the config file's value.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
    pub workers: server::runtime::WorkerThreads,
}

/// Gateway lifecycle: init → load → build → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    tracing::info!(
        "server: runtime started, worker_threads={}, source={}",
        args.workers.count,
        args.workers.source
    );

    // Phase 1: configuration.
    let mut gateway = config::GatewayConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        gateway.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        gateway.admin_listen = admin_listen;
    }
    gateway.validate()?;

    // Phase 2: registry, breakers, router; probers start here.
    let state = server::GatewayState::new(gateway)?;
    let listen = state.config.listen.clone();
    let admin_listen = state.config.admin_listen.clone();

    // Phase 3: listeners.
    let shutdown = CancellationToken::new();
    start_admin_server(&state, &admin_listen, &shutdown);

    tracing::info!("server: starting gateway, listen={}", listen);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            let result = server::run_proxy_server(&listen, state, shutdown.clone()).await;
            shutdown.cancel();
            result
        }
    });

    // Phase 4: block until signal (or the proxy dies), then clean up.
    tokio::select! {
        _ = wait_for_signal() => {}
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    state.shutdown().await;
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_admin_server(state: &server::GatewayState, admin_listen: &str, shutdown: &CancellationToken) {
    let s = state.clone();
    let addr = admin_listen.to_string();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&addr, s, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: failed to listen for SIGINT, error={}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
