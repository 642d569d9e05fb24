use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::{
    DeviceTags, DeviceUpdateConfig, EnvironmentCredentials, ProvisioningConfig, SaveConfigError,
    Tags, DEFAULT_GLOBAL_ENDPOINT,
};
use crate::dps::{self, HubAssignment, ProvisioningError};
use crate::util::crypto::{derive_device_key, KeyError};

/// Default location of the build artifacts inside the storage container
const DEFAULT_BLOB_BASE_PATH: &str = "builds";

/// Version baseline for a freshly provisioned device; any published build
/// orders above it
const INITIAL_VERSION: &str = "0";

/// Typed input to the configuration builder.
///
/// Gathered from `env.json` plus the per-unit identity arguments; the
/// builder itself performs no I/O and no prompting.
#[derive(Clone, Debug)]
pub struct SetupInput {
    pub credentials: EnvironmentCredentials,
    /// Registration id override; defaults to `nexus-<serial>`
    pub device_id: Option<String>,
    pub site_name: String,
    pub truck_number: String,
    pub serial: String,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),

    #[error("cannot derive device key: {0}")]
    DeriveKey(#[from] KeyError),
}

/// Build a validated provisioning configuration from typed inputs.
///
/// The device key is derived from the enrollment-group key and the
/// registration id; the storage credentials are carried over into the
/// `deviceUpdate` block for the background updater.
pub fn build_config(input: SetupInput) -> Result<ProvisioningConfig, SetupError> {
    let SetupInput {
        credentials,
        device_id,
        site_name,
        truck_number,
        serial,
    } = input;

    require("group_key", &credentials.group_key)?;
    require("idScope", &credentials.id_scope)?;
    require("storageAccount", &credentials.storage_account)?;
    require("containerName", &credentials.container_name)?;
    require("sasToken", &credentials.sas_token)?;
    require("site name", &site_name)?;
    require("truck number", &truck_number)?;

    let registration_id = match device_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_owned(),
        _ => format!("nexus-{serial}"),
    };

    let symmetric_key = derive_device_key(&credentials.group_key, &registration_id)?;

    Ok(ProvisioningConfig {
        global_endpoint: DEFAULT_GLOBAL_ENDPOINT.to_owned(),
        id_scope: credentials.id_scope.trim().to_owned(),
        group_key: credentials.group_key.trim().to_owned(),
        registration_id,
        symmetric_key,
        tags: Tags {
            nexus_locate: DeviceTags {
                site_name,
                truck_number,
                device_serial: serial,
            },
        },
        device_update: Some(DeviceUpdateConfig {
            storage_account: credentials.storage_account,
            container_name: credentials.container_name,
            blob_base_path: DEFAULT_BLOB_BASE_PATH.to_owned(),
            current_version: INITIAL_VERSION.to_owned(),
            sas_token: credentials.sas_token,
        }),
    })
}

fn require(name: &'static str, value: &str) -> Result<(), SetupError> {
    if value.trim().is_empty() {
        return Err(SetupError::MissingField(name));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ProvisionSetupError {
    #[error("provisioning verification failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Save(#[from] SaveConfigError),
}

/// Prove the new configuration against the provisioning broker and only
/// then persist it.
///
/// Ordering is the point: a rejected credential or an unreachable broker
/// leaves no partial config file behind, and the save itself is atomic.
pub async fn verify_and_save(
    config: &ProvisioningConfig,
    path: &Path,
    timeout: Duration,
) -> Result<HubAssignment, ProvisionSetupError> {
    info!(
        "verifying registration {} against {}",
        config.registration_id, config.global_endpoint
    );
    let assignment = dps::register(config, timeout).await?;

    config.save(path)?;
    info!("configuration saved to {}", path.display());

    Ok(assignment)
}

/// Extract the board serial from `/proc/cpuinfo` contents.
///
/// Leading zeroes are stripped the same way the fleet's device ids were
/// originally assigned. Returns None when no serial line is present
/// (non-Pi hardware, containers).
pub fn read_device_serial(cpuinfo: &str) -> Option<String> {
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("Serial") {
            let serial = rest
                .trim_start()
                .strip_prefix(':')?
                .trim()
                .trim_start_matches('0');
            if !serial.is_empty() {
                return Some(serial.to_owned());
            }
        }
    }
    None
}
