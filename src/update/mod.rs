/*
Background build updater.

On a fixed period (or on demand via the `checkUpdate` direct method) the
agent lists the builds published to object storage, compares the newest
against the version recorded in the provisioning config, and stages any
newer payload: download to a temporary sibling, set the executable bit,
atomically swap into place, record the new version, then ask the run loop
for a controlled restart. The running payload is never touched until a
complete replacement is on disk.
*/

mod blob;
mod version;

pub use blob::BlobRepository;
pub use version::BuildVersion;

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::ProvisioningConfig;
use crate::control::Control;
use crate::util::crypto::{pseudorandom_string, ALPHA_NUM};
use crate::util::http::{ClientError, InvalidUriError, StatusCode};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid storage location: {0}")]
    InvalidLocation(#[from] InvalidUriError),

    #[error("storage request failed: {0}")]
    Transport(#[from] ClientError),

    #[error("storage replied with status {0}")]
    Status(StatusCode),

    #[error("no artifact published for build {0}")]
    MissingArtifact(String),

    #[error("failed to stage build: {0}")]
    Stage(#[from] std::io::Error),

    #[error("failed to record staged version: {0}")]
    Record(String),
}

/// Injected storage capability.
///
/// Listing and fetching are separate so the periodic check stays cheap
/// when nothing new has been published, and so tests can drive the loop
/// without a network.
pub trait BuildRepository {
    /// Build numbers published under the configured base path
    fn list_builds(&self) -> impl Future<Output = Result<Vec<String>, UpdateError>> + Send;

    /// Download the device payload for `build` into `dest`
    fn fetch_build(
        &self,
        build: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<(), UpdateError>> + Send;
}

#[derive(Clone, Debug)]
pub struct UpdateSettings {
    pub interval: Duration,
    pub max_jitter: Duration,
    /// Where the staged payload is swapped into
    pub destination: PathBuf,
    /// Provisioning config to record the new currentVersion in
    pub config_path: PathBuf,
}

/// Periodic update check. Runs until the control channel closes.
///
/// Check failures are logged and retried on the next cycle; only a
/// successfully staged build escalates into a restart request.
#[instrument(name = "update", skip_all)]
pub async fn start_update_check<R: BuildRepository>(
    repo: R,
    current_version: String,
    settings: UpdateSettings,
    control_tx: mpsc::Sender<Control>,
    mut trigger_rx: mpsc::Receiver<()>,
) {
    let mut current = BuildVersion::parse_lenient(&current_version);
    info!(
        "checking for builds newer than {current} every {:#?}",
        settings.interval
    );

    loop {
        let jitter_ms = rand::random_range(0..=settings.max_jitter.as_millis() as u64);
        let pause = settings.interval + Duration::from_millis(jitter_ms);

        tokio::select! {
            _ = sleep(pause) => {}
            triggered = trigger_rx.recv() => {
                if triggered.is_none() {
                    break;
                }
                info!("update check requested");
            }
        }

        match check_once(&repo, current, &settings).await {
            Ok(Some(staged)) => {
                current = staged;
                let restart = Control::Restart {
                    reason: format!("staged build {staged}"),
                };
                if control_tx.send(restart).await.is_err() {
                    break;
                }
            }
            Ok(None) => debug!("no build newer than {current}"),
            Err(e) => warn!("update check failed: {e}"),
        }
    }
}

/// One pass over storage: list, compare, stage. Returns the staged build
/// when an update was applied.
pub async fn check_once<R: BuildRepository>(
    repo: &R,
    current: BuildVersion,
    settings: &UpdateSettings,
) -> Result<Option<BuildVersion>, UpdateError> {
    let available = repo.list_builds().await?;

    // builds that don't parse as version stamps are not candidates
    let latest = available
        .iter()
        .filter_map(|name| {
            name.parse::<BuildVersion>()
                .ok()
                .map(|version| (version, name.as_str()))
        })
        .max_by_key(|(version, _)| *version);

    let Some((latest, build_name)) = latest else {
        return Ok(None);
    };
    if latest <= current {
        return Ok(None);
    }

    info!("staging build {latest} over {current}");
    stage_build(repo, build_name, &settings.destination).await?;
    record_staged_version(&settings.config_path, build_name)?;

    Ok(Some(latest))
}

/// Download into a temporary sibling and swap it into place, so the
/// destination always holds either the old payload or a complete new one.
async fn stage_build<R: BuildRepository>(
    repo: &R,
    build: &str,
    destination: &Path,
) -> Result<(), UpdateError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let staging_ext = "staged-".to_owned() + &pseudorandom_string(ALPHA_NUM, 6);
    let staging = destination.with_extension(staging_ext);

    if let Err(e) = repo.fetch_build(build, &staging).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }

    let mut perms = tokio::fs::metadata(&staging).await?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    tokio::fs::set_permissions(&staging, perms).await?;

    tokio::fs::rename(&staging, destination).await?;
    debug!("staged {build} at {}", destination.display());
    Ok(())
}

fn record_staged_version(config_path: &Path, build: &str) -> Result<(), UpdateError> {
    let mut config =
        ProvisioningConfig::load(config_path).map_err(|e| UpdateError::Record(e.to_string()))?;

    match config.device_update.as_mut() {
        Some(update) => update.current_version = build.to_owned(),
        None => return Err(UpdateError::Record("missing deviceUpdate settings".into())),
    }

    config
        .save(config_path)
        .map_err(|e| UpdateError::Record(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{DeviceTags, DeviceUpdateConfig, Tags};

    struct FakeRepository {
        builds: Vec<String>,
        artifact: Vec<u8>,
        fail_listing: bool,
        fail_fetch: bool,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeRepository {
        fn new(builds: &[&str]) -> Self {
            Self {
                builds: builds.iter().map(|s| s.to_string()).collect(),
                artifact: b"#!/bin/true\n".to_vec(),
                fail_listing: false,
                fail_fetch: false,
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    impl BuildRepository for FakeRepository {
        async fn list_builds(&self) -> Result<Vec<String>, UpdateError> {
            if self.fail_listing {
                return Err(UpdateError::Status(StatusCode::SERVICE_UNAVAILABLE));
            }
            Ok(self.builds.clone())
        }

        async fn fetch_build(&self, build: &str, dest: &Path) -> Result<(), UpdateError> {
            if self.fail_fetch {
                return Err(UpdateError::MissingArtifact(build.to_owned()));
            }
            self.fetched.lock().unwrap().push(build.to_owned());
            tokio::fs::write(dest, &self.artifact).await?;
            Ok(())
        }
    }

    fn test_settings(dir: &Path) -> UpdateSettings {
        UpdateSettings {
            interval: Duration::from_millis(5),
            max_jitter: Duration::ZERO,
            destination: dir.join("payload").join("NexusRFIDReader"),
            config_path: dir.join("provisioning_config.json"),
        }
    }

    fn write_test_config(settings: &UpdateSettings, current_version: &str) {
        let config = ProvisioningConfig {
            global_endpoint: "global.example.net".into(),
            id_scope: "0ne0012345".into(),
            group_key: "Zm9vYmFy".into(),
            registration_id: "nexus-1".into(),
            symmetric_key: "c2VjcmV0".into(),
            tags: Tags {
                nexus_locate: DeviceTags {
                    site_name: "A".into(),
                    truck_number: "T".into(),
                    device_serial: "1".into(),
                },
            },
            device_update: Some(DeviceUpdateConfig {
                storage_account: "nexusbuilds".into(),
                container_name: "artifacts".into(),
                blob_base_path: "builds".into(),
                current_version: current_version.into(),
                sas_token: "sig=abc".into(),
            }),
        };
        config.save(&settings.config_path).unwrap();
    }

    #[tokio::test]
    async fn it_stages_a_newer_build_and_records_the_version() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_test_config(&settings, "20250101.1");

        let repo = FakeRepository::new(&["20250101.1", "20250102.1"]);
        let staged = check_once(&repo, BuildVersion::parse_lenient("20250101.1"), &settings)
            .await
            .unwrap();

        assert_eq!(staged, Some("20250102.1".parse().unwrap()));
        assert_eq!(repo.fetched.lock().unwrap().as_slice(), ["20250102.1"]);

        // payload is on disk and executable
        let metadata = std::fs::metadata(&settings.destination).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o111, 0o111);

        // and the config now carries the staged version
        let config = ProvisioningConfig::load(&settings.config_path).unwrap();
        assert_eq!(config.device_update.unwrap().current_version, "20250102.1");
    }

    #[tokio::test]
    async fn nothing_happens_when_already_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_test_config(&settings, "20250102.1");

        let repo = FakeRepository::new(&["20250101.1", "20250102.1"]);
        let staged = check_once(&repo, BuildVersion::parse_lenient("20250102.1"), &settings)
            .await
            .unwrap();

        assert_eq!(staged, None);
        assert!(!settings.destination.exists());
    }

    #[tokio::test]
    async fn builds_with_invalid_stamps_are_not_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());

        let repo = FakeRepository::new(&["garbage", "latest", ".DS_Store"]);
        let staged = check_once(&repo, BuildVersion::parse_lenient("0"), &settings)
            .await
            .unwrap();

        assert_eq!(staged, None);
    }

    #[tokio::test]
    async fn a_failed_download_leaves_the_current_payload_intact() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_test_config(&settings, "20250101.1");

        // an existing payload from the previous build
        std::fs::create_dir_all(settings.destination.parent().unwrap()).unwrap();
        std::fs::write(&settings.destination, b"old payload").unwrap();

        let mut repo = FakeRepository::new(&["20250102.1"]);
        repo.fail_fetch = true;

        let err = check_once(&repo, BuildVersion::parse_lenient("20250101.1"), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::MissingArtifact(_)));

        // destination untouched, no staging leftovers
        assert_eq!(
            std::fs::read(&settings.destination).unwrap(),
            b"old payload"
        );
        let leftovers: Vec<_> = std::fs::read_dir(settings.destination.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "NexusRFIDReader")
            .collect();
        assert!(leftovers.is_empty());

        // recorded version is unchanged
        let config = ProvisioningConfig::load(&settings.config_path).unwrap();
        assert_eq!(config.device_update.unwrap().current_version, "20250101.1");
    }

    #[tokio::test]
    async fn the_periodic_loop_requests_a_restart_after_staging() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_test_config(&settings, "20250101.1");

        let repo = FakeRepository::new(&["20250102.1"]);
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let (_trigger_tx, trigger_rx) = mpsc::channel(1);

        let updater = tokio::spawn(start_update_check(
            repo,
            "20250101.1".into(),
            settings,
            control_tx,
            trigger_rx,
        ));

        let control = control_rx.recv().await.expect("a control message");
        assert!(
            matches!(&control, Control::Restart { reason } if reason.contains("20250102.1"))
        );

        updater.abort();
    }

    #[tokio::test]
    async fn a_trigger_runs_the_check_ahead_of_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let settings = UpdateSettings {
            // effectively never fires on its own
            interval: Duration::from_secs(3600),
            ..test_settings(dir.path())
        };
        write_test_config(&settings, "20250101.1");

        let repo = FakeRepository::new(&["20250102.1"]);
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let updater = tokio::spawn(start_update_check(
            repo,
            "20250101.1".into(),
            settings,
            control_tx,
            trigger_rx,
        ));

        trigger_tx.send(()).await.unwrap();

        let control = tokio::time::timeout(Duration::from_secs(5), control_rx.recv())
            .await
            .expect("triggered check should not wait for the schedule")
            .expect("a control message");
        assert!(matches!(control, Control::Restart { .. }));

        updater.abort();
    }

    #[tokio::test]
    async fn listing_failures_are_retried_on_the_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());

        let mut repo = FakeRepository::new(&["20250102.1"]);
        repo.fail_listing = true;

        let (control_tx, mut control_rx) = mpsc::channel(4);
        let (_trigger_tx, trigger_rx) = mpsc::channel(1);

        let updater = tokio::spawn(start_update_check(
            repo,
            "20250101.1".into(),
            settings,
            control_tx,
            trigger_rx,
        ));

        // several cycles pass without the loop dying or escalating
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(control_rx.try_recv().is_err());
        assert!(!updater.is_finished());

        updater.abort();
    }
}
