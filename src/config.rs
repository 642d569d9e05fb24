use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::util::fs::safe_write_all_with_mode;

/// Where the device provisioning configuration lives on a provisioned unit
pub const DEFAULT_CONFIG_PATH: &str = "/etc/azureiotpnp/provisioning_config.json";

/// Agent log file, duplicated alongside the journal output
pub const DEFAULT_LOG_PATH: &str = "/var/log/azure-iot-service.log";

/// Global device provisioning broker host
pub const DEFAULT_GLOBAL_ENDPOINT: &str = "global.azure-devices-provisioning.net";

/// Device payload location managed by the background updater
pub const DEFAULT_UPDATE_DESTINATION: &str = "/home/NexusRFIDReader";

/// The provisioning configuration generated once by `setup` and read by the
/// agent on every start.
///
/// The file is owned by the service account with mode 600; the agent treats
/// it as read-only except for `deviceUpdate.currentVersion`, which the
/// updater advances after staging a build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(rename = "globalEndpoint")]
    pub global_endpoint: String,

    #[serde(rename = "idScope")]
    pub id_scope: String,

    /// Enrollment-group primary key the device key was derived from
    #[serde(rename = "group_key")]
    pub group_key: String,

    #[serde(rename = "registrationId")]
    pub registration_id: String,

    /// Per-device key, `base64(HMAC-SHA256(group_key, registrationId))`
    #[serde(rename = "symmetricKey")]
    pub symmetric_key: String,

    pub tags: Tags,

    #[serde(rename = "deviceUpdate", skip_serializing_if = "Option::is_none")]
    pub device_update: Option<DeviceUpdateConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(rename = "nexusLocate")]
    pub nexus_locate: DeviceTags,
}

/// Deployment metadata reported as device tags
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceTags {
    #[serde(rename = "siteName")]
    pub site_name: String,

    #[serde(rename = "truckNumber")]
    pub truck_number: String,

    #[serde(rename = "deviceSerial")]
    pub device_serial: String,
}

/// Object-storage coordinates for the background updater
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdateConfig {
    #[serde(rename = "storageAccount")]
    pub storage_account: String,

    #[serde(rename = "containerName")]
    pub container_name: String,

    #[serde(rename = "blobBasePath")]
    pub blob_base_path: String,

    #[serde(rename = "currentVersion")]
    pub current_version: String,

    #[serde(rename = "sasToken")]
    pub sas_token: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provisioning config not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read provisioning config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse provisioning config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SaveConfigError {
    #[error("failed to write provisioning config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode provisioning config: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProvisioningConfig {
    /// Load the provisioning config from `path`.
    ///
    /// A missing file and a file that fails to parse are distinct errors;
    /// both are fatal to the caller. The agent must not attempt provisioning
    /// with a config it could not fully decode.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("reading provisioning config from {}", path.display());
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persist the config at `path` with mode 600, creating the parent
    /// directory if needed. The write is atomic; a failed save leaves no
    /// partial file behind.
    pub fn save(&self, path: &Path) -> Result<(), SaveConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let buf = serde_json::to_vec_pretty(self)?;
        safe_write_all_with_mode(path, &buf, 0o600)?;
        debug!("stored provisioning config at {}", path.display());
        Ok(())
    }
}

/// Pre-provisioning secrets consumed once by `setup` and never read by the
/// running agent.
#[derive(Clone, Debug, Deserialize)]
pub struct EnvironmentCredentials {
    pub group_key: String,

    #[serde(rename = "idScope")]
    pub id_scope: String,

    #[serde(rename = "storageAccount")]
    pub storage_account: String,

    #[serde(rename = "containerName")]
    pub container_name: String,

    #[serde(rename = "sasToken")]
    pub sas_token: String,
}

impl EnvironmentCredentials {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }
}
