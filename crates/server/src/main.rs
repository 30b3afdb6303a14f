mod backend;
mod cli;
mod gateway;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadgate_engine::SingleflightCache;

use crate::backend::{BuildBackend, CommandBackend, DemoBackend};
use crate::cli::Cli;
use crate::gateway::{AppState, GatewayConfig, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let backend: Arc<dyn BuildBackend> = if cli.demo {
        info!("serving built-in demo builds");
        Arc::new(DemoBackend::default())
    } else {
        let program = cli
            .build_cmd
            .clone()
            .context("--build-cmd is required unless --demo is set")?;
        info!(driver = %program.display(), "using external build driver");
        Arc::new(CommandBackend::new(program, cli.build_args.clone()))
    };

    let state = AppState {
        cache: SingleflightCache::new(),
        backend,
        config: Arc::new(GatewayConfig {
            progress_queue_capacity: cli.progress_queue_capacity as usize,
            disconnect_poll_interval: Duration::from_millis(cli.disconnect_poll_ms),
            allowed_groups: cli.allowed_groups.clone(),
        }),
    };

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// First CTRL+C: stop accepting, cancel the in-flight build, let open
/// streams drain their terminal events. Second CTRL+C: exit immediately.
async fn shutdown_signal(state: AppState) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("stop requested — cancelling the in-flight build (press CTRL+C again to exit immediately)");
    state.cache.cancel_current();

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}
