mod bootstrap;
mod health;
mod metrics;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tas_core::config::{AppConfig, ConfigOverrides, LoadOptions, LogFormat};
use tas_core::ClusterClient;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "tas-server", version, about = "Telemetry-driven policy enforcement service")]
struct Args {
    /// Config file; defaults to ./tas.toml or ./config/tas.toml when present.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "SECS")]
    interval_secs: Option<u64>,
    #[arg(long, value_name = "SECS")]
    call_timeout_secs: Option<u64>,
    #[arg(long, value_name = "PORT")]
    health_check_port: Option<u16>,
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

impl Args {
    fn load_options(self) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config,
            overrides: ConfigOverrides {
                interval_secs: self.interval_secs,
                call_timeout_secs: self.call_timeout_secs,
                health_check_port: self.health_check_port,
                log_level: self.log_level,
                log_format: self.log_format,
            },
        }
    }
}

fn init_logging(config: &AppConfig) {
    use tas_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.load_options())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let node_count = app.cluster.list_nodes().await?.len();

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::AppState { enforcer: app.enforcer.clone(), cache: app.cache.clone() },
    )
    .await?;

    let cancel = CancellationToken::new();
    let enforcement = tokio::spawn({
        let enforcer = app.enforcer.clone();
        let cache = app.cache.clone();
        let cancel = cancel.clone();
        let ticker = tokio::time::interval(app.config.enforcer.interval());
        async move {
            enforcer.enforce_registered_strategies(cache.as_ref(), ticker, cancel).await;
        }
    });

    tracing::info!(
        event_name = "system.server.started",
        interval_secs = app.config.enforcer.interval_secs,
        node_count,
        "tas-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "tas-server stopping");

    cancel.cancel();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, enforcement).await {
        Ok(joined) => joined?,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            grace_secs = grace.as_secs(),
            "enforcement loop did not stop within the grace period"
        ),
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tas_core::config::LogFormat;

    use crate::Args;

    #[test]
    fn command_line_flags_become_overrides() {
        let args = Args::parse_from([
            "tas-server",
            "--config",
            "deploy/tas.toml",
            "--interval-secs",
            "30",
            "--log-format",
            "json",
        ]);

        let options = args.load_options();

        assert!(options.require_file);
        assert_eq!(options.config_path.as_deref(), Some(std::path::Path::new("deploy/tas.toml")));
        assert_eq!(options.overrides.interval_secs, Some(30));
        assert_eq!(options.overrides.log_format, Some(LogFormat::Json));
        assert_eq!(options.overrides.health_check_port, None);
    }

    #[test]
    fn config_file_is_optional_without_the_flag() {
        let options = Args::parse_from(["tas-server"]).load_options();

        assert!(!options.require_file);
        assert!(options.config_path.is_none());
    }
}
