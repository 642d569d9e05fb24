mod agent;
mod cli;
mod config;
mod control;
mod dps;
mod hub;
mod setup;
mod update;
mod util;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::agent::RunOutcome;
use crate::cli::{Cli, Command, SetupArgs};
use crate::config::{EnvironmentCredentials, ProvisioningConfig};
use crate::setup::{build_config, read_device_serial, verify_and_save, SetupInput};
use crate::update::{BlobRepository, BuildVersion, UpdateSettings};

fn initialize_tracing(log_path: &Path) {
    // Initialize tracing subscriber for human-readable logs
    let filter = EnvFilter::try_from_default_env().unwrap_or(
        EnvFilter::default()
            .add_directive("info".parse().unwrap())
            .add_directive("hyper=error".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap()),
    );

    let registry = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .event_format(fmt::format().compact().with_target(false).without_time()),
    );

    // Duplicate logs into the service log file; stderr alone still works
    // on machines where the file is not writable
    match std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_path)
    {
        Ok(file) => registry
            .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
            .init(),
        Err(e) => {
            registry.init();
            warn!("not logging to {}: {e}", log_path.display());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();
    initialize_tracing(&cli.log_path);

    match cli.command.clone().unwrap_or(Command::Run) {
        Command::Run => run_agent(&cli).await,
        Command::Setup(args) => run_setup(&cli, args).await,
        Command::CheckUpdate => run_check_update(&cli).await,
    }
}

async fn run_agent(cli: &Cli) -> Result<()> {
    info!("service started");

    // A missing or unreadable config is fatal: the supervisor will restart
    // us into the same failure until an operator re-provisions the device
    let config = ProvisioningConfig::load(&cli.config_path)
        .context("cannot start without a provisioning config; run `nexus-agent setup` first")?;

    match agent::run(config, cli.settings()).await? {
        RunOutcome::Shutdown => info!("service stopped"),
        RunOutcome::Restart { reason } => info!("exiting for restart: {reason}"),
    }
    Ok(())
}

async fn run_setup(cli: &Cli, args: SetupArgs) -> Result<()> {
    let credentials = EnvironmentCredentials::load(&args.env_file)
        .with_context(|| format!("failed to load {}", args.env_file.display()))?;

    let serial = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|cpuinfo| read_device_serial(&cpuinfo))
        .unwrap_or_else(|| "unknown".to_owned());
    debug!("device serial: {serial}");

    let config = build_config(SetupInput {
        credentials,
        device_id: args.device_id,
        site_name: args.site_name,
        truck_number: args.truck_number,
        serial,
    })?;

    // Prove the credential against the provisioning broker before anything
    // lands on disk; a failed verification leaves no partial config behind
    let assignment =
        verify_and_save(&config, &cli.config_path, cli.settings().request_timeout).await?;

    info!(
        "device {} assigned to {}",
        assignment.device_id, assignment.assigned_hub
    );
    Ok(())
}

async fn run_check_update(cli: &Cli) -> Result<()> {
    let config = ProvisioningConfig::load(&cli.config_path)?;
    let update_config = config
        .device_update
        .as_ref()
        .ok_or_else(|| anyhow!("provisioning config has no deviceUpdate settings"))?;

    let repo = BlobRepository::new(update_config)?;
    let settings = cli.settings();
    let current = BuildVersion::parse_lenient(&update_config.current_version);

    let staged = update::check_once(
        &repo,
        current,
        &UpdateSettings {
            interval: settings.update_interval,
            max_jitter: settings.update_max_jitter,
            destination: settings.update_destination.clone(),
            config_path: cli.config_path.clone(),
        },
    )
    .await?;

    match staged {
        Some(build) => info!("staged build {build}; restart the service to run it"),
        None => info!("already up to date at {current}"),
    }
    Ok(())
}
