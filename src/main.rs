use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use attemptd::config::{Args, OrchestratorConfig};
use attemptd::events::Scope;
use attemptd::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = OrchestratorConfig::load(args)?;
    let _log_guard = init_tracing(&config);
    info!(
        repo = %config.repo.display(),
        data_dir = %config.data_dir.display(),
        "attemptd starting"
    );
    std::fs::create_dir_all(&config.data_dir).context("create data directory")?;

    let ctx = AppContext::new(config);

    // Mirror the change feed into the logs at debug level.
    let (snapshot, mut feed) = ctx.store.subscribe(Scope::All);
    debug!(seq = snapshot.seq, "initial state snapshot taken");
    tokio::spawn(async move {
        while let Some(patch) = feed.recv().await {
            debug!(seq = patch.seq, ops = patch.ops.len(), "state patch");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown requested; stopping running processes");
    ctx.coordinator.shutdown().await;
    info!("bye");
    Ok(())
}

fn init_tracing(config: &OrchestratorConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,attemptd=debug"));
    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "attemptd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if config.json_logs {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if config.json_logs {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}
