use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::agent::AgentState;
use crate::util::crypto::{sas_token, KeyError};
use crate::util::http::{Client, ClientError, InvalidUriError, Method, StatusCode, Uri};

use super::methods::MethodInvocation;

const API_VERSION: &str = "2021-04-12";

/// Renew device tokens when less than this much lifetime remains
const TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(300);

/// If a session stays healthy this long after a reconnect, the next gap
/// starts over from the minimum backoff
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Assigned hub, a bare hostname or a full URI
    pub hub: String,
    pub device_id: String,
    /// Device symmetric key, base64
    pub device_key: String,
    pub request_timeout: Duration,
    pub token_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid hub endpoint: {0}")]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error("failed to build session auth: {0}")]
    Auth(#[from] KeyError),

    #[error("hub request failed: {0}")]
    Transport(#[from] ClientError),

    #[error("hub replied with status {0}")]
    Status(StatusCode),
}

impl SessionError {
    /// Whether this failure indicates a dropped transport rather than a
    /// response-level problem
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(e) if e.is_transport())
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    value: String,
    renew_at: Instant,
}

/// An authenticated session with the assigned hub.
///
/// Clones share the underlying connection pool; the serialization of
/// upstream publishes is the sender task's job, not this type's.
#[derive(Clone, Debug)]
pub struct HubSession {
    client: Client,
    base: Uri,
    config: SessionConfig,
    token: Option<CachedToken>,
}

/// An upstream publish waiting its turn on the serialized sender
#[derive(Clone, Debug)]
pub enum Outbound {
    Telemetry(Value),
    MethodResponse {
        request_id: String,
        status: u16,
        payload: Value,
    },
}

impl HubSession {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let base = endpoint_uri(&config.hub)?;
        Ok(Self {
            // per-request timeouts vary with the long-poll wait
            client: Client::new(None),
            base,
            config,
            token: None,
        })
    }

    /// Current SAS authorization header value, renewing it when close to
    /// expiry
    fn authorization(&mut self) -> Result<String, SessionError> {
        let now = Instant::now();
        if let Some(token) = &self.token {
            if now < token.renew_at {
                return Ok(token.value.clone());
            }
        }

        let host = self
            .base
            .host()
            .map(str::to_owned)
            .unwrap_or_else(|| self.config.hub.clone());
        let resource = format!("{host}/devices/{}", self.config.device_id);
        let value = sas_token(&resource, &self.config.device_key, None, self.config.token_ttl)?;

        trace!("renewed device token");
        self.token = Some(CachedToken {
            value: value.clone(),
            renew_at: now + self.config.token_ttl.saturating_sub(TOKEN_RENEWAL_MARGIN),
        });
        Ok(value)
    }

    /// Publish one device-to-cloud telemetry message
    #[instrument(level = "debug", skip_all)]
    pub async fn send_telemetry(&mut self, payload: &Value) -> Result<(), SessionError> {
        let uri = Uri::from_parts(
            self.base.clone(),
            &format!("/devices/{}/messages/events", self.config.device_id),
            Some(&format!("api-version={API_VERSION}")),
        )?;
        let auth = self.authorization()?;
        let timeout = self.config.request_timeout;

        let response = self
            .client
            .request(Method::POST, &uri, |request| {
                request
                    .header("Authorization", auth)
                    .timeout(timeout)
                    .json(payload)
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(SessionError::Status(status)),
        }
    }

    /// Long-poll the method inbox for up to `wait`.
    ///
    /// Returns None when the hub had nothing for us within the window.
    pub async fn receive_method(
        &mut self,
        wait: Duration,
    ) -> Result<Option<MethodInvocation>, SessionError> {
        let uri = Uri::from_parts(
            self.base.clone(),
            &format!("/devices/{}/methods/inbox", self.config.device_id),
            Some(&format!(
                "api-version={API_VERSION}&timeout={}",
                wait.as_secs()
            )),
        )?;
        let auth = self.authorization()?;
        // leave the hub room to respond after the wait window closes
        let timeout = wait + self.config.request_timeout;

        let response = self
            .client
            .request(Method::GET, &uri, |request| {
                request.header("Authorization", auth).timeout(timeout)
            })
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(SessionError::Status(status)),
        }
    }

    /// Report the result of a direct method invocation back to the hub
    #[instrument(level = "debug", skip_all, fields(request_id))]
    pub async fn respond_to_method(
        &mut self,
        request_id: &str,
        status: u16,
        payload: &Value,
    ) -> Result<(), SessionError> {
        let uri = Uri::from_parts(
            self.base.clone(),
            &format!(
                "/devices/{}/methods/inbox/{request_id}/response",
                self.config.device_id
            ),
            Some(&format!("api-version={API_VERSION}")),
        )?;
        let auth = self.authorization()?;
        let timeout = self.config.request_timeout;
        let body = serde_json::json!({ "status": status, "payload": payload });

        let response = self
            .client
            .request(Method::POST, &uri, |request| {
                request
                    .header("Authorization", auth)
                    .timeout(timeout)
                    .json(&body)
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(SessionError::Status(status)),
        }
    }
}

/// Accept both a bare hub hostname and a full URI (the latter is used by
/// tests pointing at a local server)
fn endpoint_uri(endpoint: &str) -> Result<Uri, InvalidUriError> {
    let src = if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("https://{endpoint}")
    };
    src.try_into()
}

/// Drain the outbound queue, publishing messages upstream one at a time.
///
/// This task is the only publisher on the session, which keeps concurrent
/// senders (heartbeat, method responses, disconnect notice) from
/// interleaving on the transport. Failed telemetry is dropped — the next
/// heartbeat tick produces a fresh message — while transport-level
/// failures are reported to the reconnection supervisor.
pub async fn start_sender(
    mut session: HubSession,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    state_rx: watch::Receiver<AgentState>,
    drop_tx: mpsc::Sender<()>,
) {
    while let Some(message) = outbound_rx.recv().await {
        match message {
            Outbound::Telemetry(payload) => {
                if *state_rx.borrow() != AgentState::Connected {
                    debug!("holding telemetry while reconnecting");
                    continue;
                }
                if let Err(e) = session.send_telemetry(&payload).await {
                    warn!("telemetry publish failed: {e}");
                    if e.is_transport() {
                        let _ = drop_tx.try_send(());
                    }
                }
            }
            Outbound::MethodResponse {
                request_id,
                status,
                payload,
            } => {
                if let Err(e) = session.respond_to_method(&request_id, status, &payload).await {
                    warn!("method response publish failed: {e}");
                    if e.is_transport() {
                        let _ = drop_tx.try_send(());
                    }
                }
            }
        }
    }
    trace!("outbound channel closed");
}

/// Ride out transport gaps.
///
/// Each reported drop starts exactly one reconnection sequence: the state
/// moves to Reconnecting, the backoff delay passes, any drops reported
/// during the wait are collapsed, and the state returns to Connected. If
/// the transport is still down the next failed request reports a new drop
/// and the backoff doubles, up to `max_backoff`; a session that stays
/// healthy resets the backoff to `min_backoff`.
#[instrument(name = "reconnect", skip_all)]
pub async fn start_supervisor(
    mut drop_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<AgentState>,
    min_backoff: Duration,
    max_backoff: Duration,
) {
    let mut backoff = min_backoff;
    let mut connected_since = Instant::now();

    while drop_rx.recv().await.is_some() {
        if connected_since.elapsed() >= BACKOFF_RESET_AFTER {
            backoff = min_backoff;
        }

        state_tx.send_replace(AgentState::Reconnecting);
        warn!("hub transport dropped, resuming in {backoff:#?}");
        sleep(backoff).await;

        // collapse drops reported while we were already waiting
        while drop_rx.try_recv().is_ok() {}

        backoff = std::cmp::min(backoff * 2, max_backoff);
        connected_since = Instant::now();
        state_tx.send_replace(AgentState::Connected);
        info!("resuming hub session");
    }
}
