use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::agent::Settings;
use crate::config::{DEFAULT_CONFIG_PATH, DEFAULT_LOG_PATH, DEFAULT_UPDATE_DESTINATION};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Provisioning config location
    #[arg(
        env = "NEXUS_CONFIG_PATH",
        long = "config-path",
        value_name = "path",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config_path: PathBuf,

    /// Log file written in addition to stderr
    #[arg(
        env = "NEXUS_LOG_PATH",
        long = "log-path",
        value_name = "path",
        default_value = DEFAULT_LOG_PATH
    )]
    pub log_path: PathBuf,

    /// Heartbeat period in milliseconds
    #[arg(
        env = "NEXUS_HEARTBEAT_PERIOD_MS",
        long = "heartbeat-period-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "60000"
    )]
    pub heartbeat_period: Duration,

    /// How long a method inbox poll may be held open, in milliseconds
    #[arg(
        env = "NEXUS_METHOD_POLL_WAIT_MS",
        long = "method-poll-wait-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "25000"
    )]
    pub method_poll_wait: Duration,

    /// Timeout for a single request to the broker or hub, in milliseconds
    #[arg(
        env = "NEXUS_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub request_timeout: Duration,

    /// Initial reconnection backoff in milliseconds
    #[arg(
        env = "NEXUS_RECONNECT_MIN_BACKOFF_MS",
        long = "reconnect-min-backoff-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    pub reconnect_min_backoff: Duration,

    /// Reconnection backoff ceiling in milliseconds
    #[arg(
        env = "NEXUS_RECONNECT_MAX_BACKOFF_MS",
        long = "reconnect-max-backoff-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "300000"
    )]
    pub reconnect_max_backoff: Duration,

    /// Background update check interval in milliseconds
    #[arg(
        env = "NEXUS_UPDATE_INTERVAL_MS",
        long = "update-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "600000"
    )]
    pub update_interval: Duration,

    /// Update check max jitter in milliseconds
    #[arg(
        env = "NEXUS_UPDATE_MAX_JITTER_MS",
        long = "update-max-jitter-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "60000"
    )]
    pub update_max_jitter: Duration,

    /// Where staged device payloads are installed
    #[arg(
        env = "NEXUS_UPDATE_DESTINATION",
        long = "update-destination",
        value_name = "path",
        default_value = DEFAULT_UPDATE_DESTINATION
    )]
    pub update_destination: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Run the device agent (the default when no command is given)
    Run,

    /// Generate and verify the device provisioning configuration
    Setup(SetupArgs),

    /// Check object storage for a newer build and stage it
    CheckUpdate,
}

#[derive(Clone, Debug, Args)]
pub struct SetupArgs {
    /// Pre-provisioning credentials file (env.json)
    #[arg(env = "NEXUS_ENV_FILE", long = "env-file", value_name = "path")]
    pub env_file: PathBuf,

    /// Deployment site name, eg. "Warehouse_A"
    #[arg(long = "site-name", value_name = "str")]
    pub site_name: String,

    /// Truck or unit number, eg. "Truck_001"
    #[arg(long = "truck-number", value_name = "str")]
    pub truck_number: String,

    /// Registration id override; defaults to nexus-<device serial>
    #[arg(long = "device-id", value_name = "id")]
    pub device_id: Option<String>,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            config_path: self.config_path.clone(),
            heartbeat_period: self.heartbeat_period,
            method_poll_wait: self.method_poll_wait,
            request_timeout: self.request_timeout,
            reconnect_min_backoff: self.reconnect_min_backoff,
            reconnect_max_backoff: self.reconnect_max_backoff,
            update_interval: self.update_interval,
            update_max_jitter: self.update_max_jitter,
            update_destination: self.update_destination.clone(),
        }
    }
}

pub fn parse() -> Cli {
    Parser::parse()
}
