use std::fmt::Display;
use std::future;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::config::{ProvisioningConfig, DEFAULT_CONFIG_PATH, DEFAULT_UPDATE_DESTINATION};
use crate::control::Control;
use crate::dps::{self, ProvisioningError};
use crate::hub::{
    start_heartbeat, start_method_listener, start_sender, start_supervisor, HubSession,
    MethodRegistry, SessionConfig, SessionError,
};
use crate::update::{self, BlobRepository, UpdateSettings};
use crate::util::crypto::unix_timestamp;

/// Where the agent is in its lifecycle. Observable through a watch
/// channel; the `status` direct method reports it upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Unconfigured,
    Provisioning,
    Connected,
    Reconnecting,
    FatalExit,
}

impl Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Unconfigured => "unconfigured",
            AgentState::Provisioning => "provisioning",
            AgentState::Connected => "connected",
            AgentState::Reconnecting => "reconnecting",
            AgentState::FatalExit => "fatal",
        };
        name.fmt(f)
    }
}

/// Why the run loop returned
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// A shutdown signal arrived
    Shutdown,
    /// A controlled restart was requested; exiting cleanly lets the
    /// service supervisor relaunch us (with the staged payload, if any)
    Restart { reason: String },
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub config_path: PathBuf,
    pub heartbeat_period: Duration,
    pub method_poll_wait: Duration,
    pub request_timeout: Duration,
    pub reconnect_min_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub update_interval: Duration,
    pub update_max_jitter: Duration,
    pub update_destination: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            heartbeat_period: Duration::from_secs(60),
            method_poll_wait: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
            reconnect_min_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(300),
            update_interval: Duration::from_secs(600),
            update_max_jitter: Duration::from_secs(60),
            update_destination: PathBuf::from(DEFAULT_UPDATE_DESTINATION),
        }
    }
}

const DEVICE_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("hub session failed: {0}")]
    Session(#[from] SessionError),
}

/// Provision against the broker, open the hub session and run the agent's
/// concurrent activities until a shutdown or restart.
///
/// Heartbeat emission, method listening and update checking all run in one
/// `select!` over the same session; the serialized sender is the only task
/// that actually publishes upstream.
#[instrument(name = "agent", skip_all, err)]
pub async fn run(config: ProvisioningConfig, settings: Settings) -> Result<RunOutcome, FatalError> {
    let (state_tx, state_rx) = watch::channel(AgentState::Provisioning);

    info!("provisioning device {}", config.registration_id);
    let assignment = match dps::register(&config, settings.request_timeout).await {
        Ok(assignment) => assignment,
        Err(e) => {
            state_tx.send_replace(AgentState::FatalExit);
            return Err(e.into());
        }
    };

    let session = match HubSession::new(SessionConfig {
        hub: assignment.assigned_hub.clone(),
        device_id: assignment.device_id.clone(),
        device_key: config.symmetric_key.clone(),
        request_timeout: settings.request_timeout,
        token_ttl: DEVICE_TOKEN_TTL,
    }) {
        Ok(session) => session,
        Err(e) => {
            state_tx.send_replace(AgentState::FatalExit);
            return Err(e.into());
        }
    };

    state_tx.send_replace(AgentState::Connected);
    info!("connected to hub {}", assignment.assigned_hub);

    // Serialized publishes, control messages from methods/updater, drop
    // reports to the reconnection supervisor, on-demand update triggers
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    let (control_tx, mut control_rx) = mpsc::channel(4);
    let (drop_tx, drop_rx) = mpsc::channel(4);
    let (update_trigger_tx, update_trigger_rx) = mpsc::channel(1);

    let registry = MethodRegistry::new(control_tx.clone(), state_rx.clone());

    // Run the main loop until one activity asks to stop
    let outcome = tokio::select! {
        // Drain the outbound queue onto the transport
        _ = start_sender(
            session.clone(),
            outbound_rx,
            state_rx.clone(),
            drop_tx.clone(),
        ) => RunOutcome::Shutdown,

        // Answer direct method invocations
        _ = start_method_listener(
            session.clone(),
            registry,
            outbound_tx.clone(),
            state_rx.clone(),
            drop_tx.clone(),
            settings.method_poll_wait,
            settings.reconnect_min_backoff,
        ) => RunOutcome::Shutdown,

        // Ride out transport gaps
        _ = start_supervisor(
            drop_rx,
            state_tx,
            settings.reconnect_min_backoff,
            settings.reconnect_max_backoff,
        ) => RunOutcome::Shutdown,

        // Periodic liveness telemetry
        _ = start_heartbeat(
            assignment.device_id.clone(),
            settings.heartbeat_period,
            outbound_tx.clone(),
        ) => RunOutcome::Shutdown,

        // Background build updates, when configured
        _ = maybe_update(&config, &settings, control_tx.clone(), update_trigger_rx)
            => RunOutcome::Shutdown,

        // Restart requests and update triggers from methods/updater
        outcome = handle_control(&mut control_rx, update_trigger_tx) => outcome,

        _ = shutdown_signal() => {
            info!("shutdown signal received");
            RunOutcome::Shutdown
        }
    };

    // All activities are stopped at this point; say goodbye on our own
    let mut session = session;
    let notice = json!({
        "deviceId": assignment.device_id,
        "timestamp": unix_timestamp(),
        "status": "disconnecting",
    });
    if let Err(e) = session.send_telemetry(&notice).await {
        debug!("disconnect notice failed: {e}");
    }

    Ok(outcome)
}

async fn handle_control(
    control_rx: &mut mpsc::Receiver<Control>,
    update_trigger_tx: mpsc::Sender<()>,
) -> RunOutcome {
    while let Some(message) = control_rx.recv().await {
        match message {
            Control::CheckUpdate => {
                // lossy: a trigger already in flight covers this request
                let _ = update_trigger_tx.try_send(());
            }
            Control::Restart { reason } => {
                info!("restart requested: {reason}");
                return RunOutcome::Restart { reason };
            }
        }
    }
    RunOutcome::Shutdown
}

/// Run the update-check loop when the config carries update settings,
/// otherwise park forever so the `select!` keeps its shape
async fn maybe_update(
    config: &ProvisioningConfig,
    settings: &Settings,
    control_tx: mpsc::Sender<Control>,
    trigger_rx: mpsc::Receiver<()>,
) {
    let Some(update_config) = &config.device_update else {
        warn!("no update settings in provisioning config, update checks disabled");
        return future::pending().await;
    };

    let repo = match BlobRepository::new(update_config) {
        Ok(repo) => repo,
        Err(e) => {
            warn!("update checks disabled: {e}");
            return future::pending().await;
        }
    };

    update::start_update_check(
        repo,
        update_config.current_version.clone(),
        UpdateSettings {
            interval: settings.update_interval,
            max_jitter: settings.update_max_jitter,
            destination: settings.update_destination.clone(),
            config_path: settings.config_path.clone(),
        },
        control_tx,
        trigger_rx,
    )
    .await
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use crate::config::{DeviceTags, Tags};

    use super::*;

    fn test_config(endpoint: String) -> ProvisioningConfig {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        ProvisioningConfig {
            global_endpoint: endpoint,
            id_scope: "0ne0012345".into(),
            group_key: STANDARD.encode([1u8; 32]),
            registration_id: "nexus-1".into(),
            symmetric_key: STANDARD.encode([2u8; 32]),
            tags: Tags {
                nexus_locate: DeviceTags {
                    site_name: "A".into(),
                    truck_number: "T".into(),
                    device_serial: "1".into(),
                },
            },
            device_update: None,
        }
    }

    fn test_settings(config_path: PathBuf) -> Settings {
        Settings {
            config_path,
            heartbeat_period: Duration::from_millis(50),
            method_poll_wait: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            reconnect_min_backoff: Duration::from_millis(10),
            reconnect_max_backoff: Duration::from_millis(100),
            update_interval: Duration::from_secs(3600),
            update_max_jitter: Duration::ZERO,
            update_destination: PathBuf::from("/nonexistent"),
        }
    }

    /// Point DPS registration at the same local server that plays the hub
    async fn mock_registration(server: &mut Server) -> mockito::Mock {
        let hub = server.url();
        server
            .mock("PUT", "/0ne0012345/registrations/nexus-1/register")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": {"assignedHub": hub, "deviceId": "nexus-1"}
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    #[tokio::test]
    async fn provisioning_rejection_is_fatal() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("PUT", "/0ne0012345/registrations/nexus-1/register")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(server.url());
        let err = run(config, test_settings(dir.path().join("config.json")))
            .await
            .unwrap_err();

        assert!(matches!(err, FatalError::Provisioning(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_restart_method_ends_the_run_with_a_restart_outcome() {
        let mut server = Server::new_async().await;
        let registration = mock_registration(&mut server).await;

        // first inbox poll delivers restartService, later polls are empty
        let invocation = server
            .mock("GET", "/devices/nexus-1/methods/inbox")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"requestId": "req-1", "methodName": "restartService", "payload": {}})
                    .to_string(),
            )
            .create_async()
            .await;
        let _empty_inbox = server
            .mock("GET", "/devices/nexus-1/methods/inbox")
            .match_query(Matcher::Any)
            .with_status(204)
            .expect_at_least(0)
            .create_async()
            .await;

        // heartbeats, the method response and the disconnect notice
        let _telemetry = server
            .mock("POST", "/devices/nexus-1/messages/events")
            .match_query(Matcher::Any)
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;
        let _response = server
            .mock("POST", "/devices/nexus-1/methods/inbox/req-1/response")
            .match_query(Matcher::Any)
            .with_status(204)
            .expect_at_least(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(server.url());
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            run(config, test_settings(dir.path().join("config.json"))),
        )
        .await
        .expect("run should return after the restart request")
        .unwrap();

        assert!(matches!(outcome, RunOutcome::Restart { .. }));
        registration.assert_async().await;
        invocation.assert_async().await;
    }
}
