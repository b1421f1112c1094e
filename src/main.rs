use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use sysmetrics_logger::config::{self, Config, LogFormat};
use sysmetrics_logger::telemetry::{Collector, Persister, Pipeline, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Sample host CPU, memory and disk usage on an interval and store each
/// sample in the database named by DATABASE_URL.
#[derive(Debug, Parser)]
#[command(name = "sysmetrics-logger", version, about)]
struct Cli {
    /// Config file (default: <config dir>/sysmetrics-logger/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Dotenv file loaded before reading DATABASE_URL.
    #[arg(long, value_name = "PATH", default_value = config::DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Seconds between samples; overrides the config file.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Take a single sample, store it and exit.
    #[arg(long)]
    once: bool,

    /// Log output format; overrides the config file.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested, letting the current tick finish");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_loaded = config::load_env_file(&cli.env_file).context("loading env file")?;
    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(secs) = cli.interval {
        config.interval_secs = secs;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }

    init_tracing(config.log_format);
    tracing::debug!(path = %cli.env_file.display(), loaded = env_loaded, "env file");

    // Both the sysinfo baseline and the store handshake block.
    let mount = config.disk_mount.clone();
    let pipeline = tokio::task::spawn_blocking(move || -> Result<Pipeline> {
        let persister = Persister::from_env().context("opening store")?;
        tracing::info!(backend = persister.backend(), "store ready");
        Ok(Pipeline::new(Collector::system(&mount), persister))
    })
    .await
    .context("startup task failed")??;

    let scheduler = Scheduler::new(pipeline, config.interval());

    if cli.once {
        let outcome = scheduler.tick().await;
        scheduler.close().await;
        anyhow::ensure!(outcome.is_stored(), "tick did not store a sample: {outcome}");
        return Ok(());
    }

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let summary = scheduler.start(token).await?;
    scheduler.close().await;
    tracing::info!(
        ticks = summary.ticks,
        stored = summary.stored,
        failed = summary.failed,
        "exiting"
    );
    Ok(())
}
