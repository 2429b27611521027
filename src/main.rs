use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ytdlstem::api::{self, AppState};
use ytdlstem::config::Config;
use ytdlstem::handlers::{HandlerRegistry, register_builtin_handlers};
use ytdlstem::media::MediaTools;
use ytdlstem::worker::{JobRegistry, Reaper, Scheduler, spawn_reaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);
    for setting in &config.rejected {
        tracing::warn!(
            key = %setting.key,
            value = %setting.value,
            "Ignoring malformed configuration value"
        );
    }

    eprintln!("🎵 YTDLStem v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api", config.bind_addr());
    eprintln!("   Workers: {}", config.queue.max_workers);
    eprintln!("   Temp dir: {}", config.queue.temp_dir.display());
    eprintln!(
        "   Cleanup: after {}s, every {}s\n",
        config.queue.retention.as_secs(),
        config.queue.cleanup_interval.as_secs()
    );

    tokio::fs::create_dir_all(&config.queue.temp_dir)
        .await
        .with_context(|| format!("creating {}", config.queue.temp_dir.display()))?;

    // ── Job system ──────────────────────────────────────────────────────
    let media = Arc::new(MediaTools::new(&config.tools));
    let handlers = Arc::new(HandlerRegistry::new());
    register_builtin_handlers(&handlers, &media);

    let jobs = Arc::new(JobRegistry::new(&config.queue.temp_dir));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&jobs), handlers));

    let cancel = CancellationToken::new();
    let pool = scheduler.start_workers(config.queue.max_workers, cancel.clone())?;
    let reaper = spawn_reaper(
        Reaper::new(Arc::clone(&jobs), config.queue.retention),
        config.queue.cleanup_interval,
        cancel.clone(),
    );

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api::router(AppState { scheduler, media }, &config);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // ── Shutdown ────────────────────────────────────────────────────────
    tracing::info!("Server stopped accepting connections, draining workers");
    cancel.cancel();
    pool.shutdown(config.queue.shutdown_grace).await;
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Reaper task ended abnormally");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Console logging, plus a daily rolling file when `LOG_DIR` is set.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ytdlstem.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
