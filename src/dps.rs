/*
Device provisioning against the DPS broker.

A device registers with (idScope, registrationId, derived symmetric key)
and receives its assigned hub hostname and device identity. Registration
is a one-shot operation per agent start: any failure here is fatal for the
run and the service supervision layer is the retry mechanism.
*/

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::util::crypto::{sas_token, KeyError};
use crate::util::http::{Client, ClientError, InvalidUriError, Method, Response, StatusCode, Uri};

const API_VERSION: &str = "2019-03-31";

/// Fallback delay between operation-status polls when the broker does not
/// suggest one
const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on operation-status polls before giving up on the run
const MAX_STATUS_POLLS: u32 = 30;

const REGISTRATION_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Result of a successful registration: where the hub session goes next
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubAssignment {
    pub assigned_hub: String,
    pub device_id: String,
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("invalid provisioning endpoint: {0}")]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error("failed to build registration auth: {0}")]
    Auth(#[from] KeyError),

    #[error("provisioning request failed: {0}")]
    Transport(#[from] ClientError),

    #[error("registration rejected: ({0}) {1}")]
    Rejected(StatusCode, String),

    #[error("registration ended in state \"{0}\"")]
    NotAssigned(String),

    #[error("registration assigned without a hub")]
    IncompleteAssignment,
}

/*
    response {
        operationId,
        status: assigning | assigned | failed | disabled,
        registrationState?: {
            assignedHub?,
            deviceId?,
            errorMessage?,
        }
    }
*/
#[derive(Debug, Deserialize)]
struct RegistrationOperation {
    #[serde(rename = "operationId")]
    operation_id: Option<String>,

    status: Option<String>,

    #[serde(rename = "registrationState")]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
struct RegistrationState {
    #[serde(rename = "assignedHub")]
    assigned_hub: Option<String>,

    #[serde(rename = "deviceId")]
    device_id: Option<String>,

    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// Register this device with the provisioning broker and return the hub
/// assignment.
///
/// Blocks through the broker's asynchronous assignment flow: an accepted
/// registration is polled until it leaves the pending state, honoring any
/// server-suggested retry delay.
pub async fn register(
    config: &ProvisioningConfig,
    timeout: Duration,
) -> Result<HubAssignment, ProvisioningError> {
    let base = endpoint_uri(&config.global_endpoint)?;
    let resource = format!("{}/registrations/{}", config.id_scope, config.registration_id);
    let token = sas_token(
        &resource,
        &config.symmetric_key,
        Some("registration"),
        REGISTRATION_TOKEN_TTL,
    )?;

    let client = Client::new(Some(timeout));

    let register_uri = Uri::from_parts(
        base.clone(),
        &format!(
            "/{}/registrations/{}/register",
            config.id_scope, config.registration_id
        ),
        Some(&format!("api-version={API_VERSION}")),
    )?;

    debug!("calling provisioning broker at {register_uri}");
    let payload = json!({ "registrationId": config.registration_id });
    let response = client
        .request(Method::PUT, &register_uri, |request| {
            request
                .header("Authorization", token.clone())
                .json(&payload)
        })
        .await?;

    let status = response.status();
    if !(status.is_success() || status == StatusCode::ACCEPTED) {
        let body = response.text().await.unwrap_or_default();
        warn!("broker rejected registration: ({status}) {body}");
        return Err(ProvisioningError::Rejected(status, body));
    }

    let mut poll_delay = parse_retry_after(&response).unwrap_or(DEFAULT_POLL_DELAY);
    let mut operation: RegistrationOperation = response.json().await?;

    // An accepted registration resolves asynchronously; poll the operation
    // until the broker reaches a decision
    let mut polls = 0;
    while matches!(operation.status.as_deref(), None | Some("assigning")) {
        let Some(operation_id) = operation.operation_id.as_deref() else {
            return Err(ProvisioningError::NotAssigned("unknown".into()));
        };

        polls += 1;
        if polls > MAX_STATUS_POLLS {
            return Err(ProvisioningError::NotAssigned(
                "timed out waiting for assignment".into(),
            ));
        }

        sleep(poll_delay).await;

        let operation_uri = Uri::from_parts(
            base.clone(),
            &format!(
                "/{}/registrations/{}/operations/{operation_id}",
                config.id_scope, config.registration_id
            ),
            Some(&format!("api-version={API_VERSION}")),
        )?;

        let response = client
            .request(Method::GET, &operation_uri, |request| {
                request.header("Authorization", token.clone())
            })
            .await?;

        let status = response.status();
        poll_delay = parse_retry_after(&response).unwrap_or(DEFAULT_POLL_DELAY);
        if status == StatusCode::ACCEPTED {
            // still pending; keep the current operation id and poll again
            continue;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisioningError::Rejected(status, body));
        }

        operation = response.json().await?;
    }

    into_assignment(operation)
}

fn into_assignment(operation: RegistrationOperation) -> Result<HubAssignment, ProvisioningError> {
    let status = operation.status.unwrap_or_else(|| "unknown".into());
    if status != "assigned" {
        let detail = operation
            .registration_state
            .and_then(|s| s.error_message)
            .map(|msg| format!("{status}: {msg}"))
            .unwrap_or(status);
        return Err(ProvisioningError::NotAssigned(detail));
    }

    let state = operation
        .registration_state
        .ok_or(ProvisioningError::IncompleteAssignment)?;
    let (Some(assigned_hub), Some(device_id)) = (state.assigned_hub, state.device_id) else {
        return Err(ProvisioningError::IncompleteAssignment);
    };

    info!("provisioned to hub {assigned_hub} as {device_id}");
    Ok(HubAssignment {
        assigned_hub,
        device_id,
    })
}

/// Accept both a bare broker host and a full URI (the latter is used by
/// tests pointing at a local server)
fn endpoint_uri(endpoint: &str) -> Result<Uri, InvalidUriError> {
    let src = if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("https://{endpoint}")
    };
    src.try_into()
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
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

    #[tokio::test]
    async fn it_registers_when_the_broker_assigns_directly() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("PUT", "/0ne0012345/registrations/nexus-1/register")
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                API_VERSION.into(),
            ))
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature sr=.*&skn=registration$".into()),
            )
            .match_body(Matcher::Json(json!({"registrationId": "nexus-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": {
                        "assignedHub": "hub-west.example.net",
                        "deviceId": "nexus-1"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = test_config(server.url());
        let assignment = register(&config, Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            assignment,
            HubAssignment {
                assigned_hub: "hub-west.example.net".into(),
                device_id: "nexus-1".into(),
            }
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_polls_the_operation_until_assignment() {
        let mut server = Server::new_async().await;

        let register_mock = server
            .mock("PUT", "/0ne0012345/registrations/nexus-1/register")
            .match_query(Matcher::Any)
            .with_status(202)
            .with_header("content-type", "application/json")
            .with_header("retry-after", "0")
            .with_body(json!({"operationId": "op-9", "status": "assigning"}).to_string())
            .create_async()
            .await;

        let pending_mock = server
            .mock("GET", "/0ne0012345/registrations/nexus-1/operations/op-9")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("retry-after", "0")
            .with_body(json!({"operationId": "op-9", "status": "assigning"}).to_string())
            .create_async()
            .await;

        let assigned_mock = server
            .mock("GET", "/0ne0012345/registrations/nexus-1/operations/op-9")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "operationId": "op-9",
                    "status": "assigned",
                    "registrationState": {
                        "assignedHub": "hub-east.example.net",
                        "deviceId": "nexus-1"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = test_config(server.url());
        let assignment = register(&config, Duration::from_secs(5)).await.unwrap();

        assert_eq!(assignment.assigned_hub, "hub-east.example.net");

        register_mock.assert_async().await;
        pending_mock.assert_async().await;
        assigned_mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_rejected_credential_is_fatal() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("PUT", "/0ne0012345/registrations/nexus-1/register")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let config = test_config(server.url());
        let err = register(&config, Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(
            err,
            ProvisioningError::Rejected(StatusCode::UNAUTHORIZED, _)
        ));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_failed_registration_state_is_not_assigned() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("PUT", "/0ne0012345/registrations/nexus-1/register")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "operationId": "op-2",
                    "status": "failed",
                    "registrationState": {"errorMessage": "device disabled"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = test_config(server.url());
        let err = register(&config, Duration::from_secs(5)).await.unwrap_err();

        match err {
            ProvisioningError::NotAssigned(detail) => {
                assert!(detail.contains("failed"));
                assert!(detail.contains("device disabled"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn an_unreachable_broker_is_a_transport_error() {
        // nothing listens on this port
        let config = test_config("http://127.0.0.1:9".into());
        let err = register(&config, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Transport(_)));
    }

    #[test]
    fn bare_hosts_become_https_endpoints() {
        let uri = endpoint_uri("global.azure-devices-provisioning.net").unwrap();
        assert!(uri
            .to_string()
            .starts_with("https://global.azure-devices-provisioning.net"));

        let uri = endpoint_uri("http://127.0.0.1:1234").unwrap();
        assert!(uri.to_string().starts_with("http://127.0.0.1:1234"));
    }
}
