use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

use crate::agent::AgentState;
use crate::control::Control;

use super::session::{HubSession, Outbound};

/// A direct method invocation delivered by the hub
#[derive(Clone, Debug, Deserialize)]
pub struct MethodInvocation {
    #[serde(rename = "requestId")]
    pub request_id: String,

    #[serde(rename = "methodName")]
    pub method_name: String,

    #[serde(default)]
    pub payload: Value,
}

/// Structured result reported back for an invocation
#[derive(Clone, Debug, PartialEq)]
pub struct MethodOutcome {
    pub status: u16,
    pub payload: Value,
}

/// The bounded set of operations a device accepts remotely.
///
/// Anything outside this set gets a structured "not implemented" response;
/// arbitrary command execution is deliberately not available.
pub struct MethodRegistry {
    control: mpsc::Sender<Control>,
    state_rx: watch::Receiver<AgentState>,
    started_at: Instant,
}

impl MethodRegistry {
    pub fn new(control: mpsc::Sender<Control>, state_rx: watch::Receiver<AgentState>) -> Self {
        Self {
            control,
            state_rx,
            started_at: Instant::now(),
        }
    }

    /// Execute a named operation and produce its upstream response.
    ///
    /// Never fails: unknown names and unavailable operations come back as
    /// structured error outcomes so the session stays open.
    pub async fn dispatch(&self, invocation: &MethodInvocation) -> MethodOutcome {
        match invocation.method_name.as_str() {
            "ping" => MethodOutcome {
                status: 200,
                payload: json!({"status": "success", "message": "pong"}),
            },
            "status" => MethodOutcome {
                status: 200,
                payload: json!({
                    "status": "success",
                    "state": self.state_rx.borrow().to_string(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptimeSeconds": self.started_at.elapsed().as_secs(),
                }),
            },
            "checkUpdate" => match self.control.try_send(Control::CheckUpdate) {
                Ok(()) => MethodOutcome {
                    status: 202,
                    payload: json!({"status": "success", "message": "update check scheduled"}),
                },
                Err(_) => MethodOutcome {
                    status: 503,
                    payload: json!({"status": "error", "message": "update check unavailable"}),
                },
            },
            "restartService" => {
                let restart = Control::Restart {
                    reason: "requested by direct method".into(),
                };
                match self.control.try_send(restart) {
                    Ok(()) => MethodOutcome {
                        status: 200,
                        payload: json!({"status": "success", "message": "restarting"}),
                    },
                    Err(_) => MethodOutcome {
                        status: 503,
                        payload: json!({"status": "error", "message": "restart unavailable"}),
                    },
                }
            }
            other => {
                info!("ignoring unsupported method \"{other}\"");
                MethodOutcome {
                    status: 501,
                    payload: json!({
                        "status": "error",
                        "message": format!("method not implemented: {other}"),
                    }),
                }
            }
        }
    }
}

/// Poll the hub's method inbox and answer invocations.
///
/// Responses go through the serialized outbound channel. While the
/// reconnection supervisor is riding out a gap the listener parks instead
/// of hammering a dead transport; response-level errors back off by
/// `retry_delay` so a misbehaving hub cannot spin this loop hot.
#[instrument(name = "methods", skip_all)]
pub async fn start_method_listener(
    mut session: HubSession,
    registry: MethodRegistry,
    outbound_tx: mpsc::Sender<Outbound>,
    mut state_rx: watch::Receiver<AgentState>,
    drop_tx: mpsc::Sender<()>,
    wait: Duration,
    retry_delay: Duration,
) {
    info!("listening for direct methods");
    loop {
        if *state_rx.borrow_and_update() != AgentState::Connected {
            // park until the supervisor restores the session
            if state_rx
                .wait_for(|s| *s == AgentState::Connected)
                .await
                .is_err()
            {
                break;
            }
        }

        match session.receive_method(wait).await {
            Ok(Some(invocation)) => {
                let outcome = registry.dispatch(&invocation).await;
                let response = Outbound::MethodResponse {
                    request_id: invocation.request_id,
                    status: outcome.status,
                    payload: outcome.payload,
                };
                if outbound_tx.send(response).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("method poll failed: {e}");
                if e.is_transport() {
                    let _ = drop_tx.try_send(());
                }
                sleep(retry_delay).await;
            }
        }
    }
}
