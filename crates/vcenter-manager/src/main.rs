//! vcenter-manager daemon entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vcenter_manager::config::{LogFormat, ManagerConfig, DEFAULT_CONFIG_PATH};
use vcenter_manager::Clients;

/// Reconciles vCenter VMs into the SDN controller and the dataplane agent
#[derive(Parser, Debug)]
#[command(name = "vcenter-manager")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).json())
            .init(),
        LogFormat::Compact => registry
            .with(fmt::layer().with_target(true).compact())
            .init(),
    }
}

fn load_config(args: &Args) -> Result<ManagerConfig> {
    let config = ManagerConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Connects to the three external systems.
async fn connect_clients(config: &ManagerConfig) -> Result<Option<Clients>> {
    // TODO: wire the vSphere session client once the SOAP binding crate lands,
    // together with the controller REST and dataplane agent clients.
    warn!(
        server = %config.hypervisor.server,
        "No hypervisor client is linked into this build"
    );
    Ok(None)
}

fn shutdown_on_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down");
            token.cancel();
        }
    });
    shutdown
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, config.logging.format);

    if args.check_config {
        info!(path = %args.config.display(), "Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        hypervisor = %config.hypervisor.server,
        host = %config.hypervisor.local_host,
        controller = %config.controller.server,
        project = %config.controller.project,
        "Starting vcenter-manager"
    );

    let Some(clients) = connect_clients(&config).await? else {
        return Ok(ExitCode::FAILURE);
    };

    let shutdown = shutdown_on_signal();
    vcenter_manager::run(&config, clients, shutdown)
        .await
        .context("manager stopped")?;

    info!("vcenter-manager stopped");
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            // Logging may not be up yet when the configuration is broken.
            eprintln!("vcenter-manager: {:#}", e);
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["vcenter-manager"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.log_level.is_none());
        assert!(!args.check_config);
    }

    #[test]
    fn test_args_check_config() {
        let args = Args::parse_from(["vcenter-manager", "-c", "/tmp/vcm.yaml", "--check-config"]);
        assert_eq!(args.config, PathBuf::from("/tmp/vcm.yaml"));
        assert!(args.check_config);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sync:\n  vlan_start: 200\n  vlan_end: 100\n").unwrap();
        let args = Args::parse_from(["vcenter-manager", "-c", path.to_str().unwrap()]);
        assert!(load_config(&args).is_err());
    }
}
