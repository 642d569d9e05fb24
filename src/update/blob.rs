use std::path::Path;

use futures_lite::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::DeviceUpdateConfig;
use crate::util::crypto::percent_encode;
use crate::util::http::{Client, InvalidUriError, Method, StatusCode, Uri};

use super::{BuildRepository, UpdateError};

/// Device payload file expected inside each published build
const ARTIFACT_RELATIVE_PATH: &str = "RaspberryPi/NexusRFIDReader";

/// Build repository backed by an object-storage container, authenticated
/// with the SAS token from the provisioning config.
pub struct BlobRepository {
    client: Client,
    base: Uri,
    container: String,
    base_path: String,
    sas: String,
}

impl BlobRepository {
    pub fn new(config: &DeviceUpdateConfig) -> Result<Self, InvalidUriError> {
        let base = format!(
            "https://{}.blob.core.windows.net",
            config.storage_account.trim()
        )
        .try_into()?;
        Ok(Self::with_endpoint(base, config))
    }

    /// Point the repository at an explicit endpoint; used by tests running
    /// against a local server
    pub fn with_endpoint(base: Uri, config: &DeviceUpdateConfig) -> Self {
        Self {
            client: Client::default(),
            base,
            container: config.container_name.clone(),
            base_path: config.blob_base_path.trim_matches('/').to_owned(),
            // the token may or may not carry a leading '?'
            sas: config.sas_token.trim_start_matches('?').to_owned(),
        }
    }

    fn prefix(&self) -> String {
        if self.base_path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.base_path)
        }
    }
}

impl BuildRepository for BlobRepository {
    async fn list_builds(&self) -> Result<Vec<String>, UpdateError> {
        let query = format!(
            "restype=container&comp=list&prefix={}&{}",
            percent_encode(&self.prefix()),
            self.sas
        );
        let uri = Uri::from_parts(self.base.clone(), &format!("/{}", self.container), Some(&query))?;

        let response = self.client.request(Method::GET, &uri, |request| request).await?;
        if !response.status().is_success() {
            return Err(UpdateError::Status(response.status()));
        }

        let listing = response.text().await?;
        let mut builds: Vec<String> = Vec::new();
        for name in extract_tag_values(&listing, "Name") {
            if let Some(build) = build_segment(&name, &self.base_path) {
                if !builds.contains(&build) {
                    builds.push(build);
                }
            }
        }

        debug!("storage lists {} build(s)", builds.len());
        Ok(builds)
    }

    async fn fetch_build(&self, build: &str, dest: &Path) -> Result<(), UpdateError> {
        let blob = format!("{}{build}/{ARTIFACT_RELATIVE_PATH}", self.prefix());
        let uri = Uri::from_parts(
            self.base.clone(),
            &format!("/{}/{blob}", self.container),
            Some(&self.sas),
        )?;

        debug!("downloading {blob}");
        let response = self.client.request(Method::GET, &uri, |request| request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(UpdateError::MissingArtifact(build.to_owned())),
            status if !status.is_success() => return Err(UpdateError::Status(status)),
            _ => {}
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(())
    }
}

/// Pull the text content of every `<tag>` element out of a storage
/// listing. The listing format is a flat element-per-blob document and
/// blob names cannot contain markup, so positional extraction is
/// sufficient here.
fn extract_tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else { break };
        values.push(rest[..end].to_owned());
        rest = &rest[end + close.len()..];
    }
    values
}

/// The build number is the path segment immediately after the base path
fn build_segment(blob_name: &str, base_path: &str) -> Option<String> {
    let rest = if base_path.is_empty() {
        blob_name
    } else {
        blob_name.strip_prefix(base_path)?.strip_prefix('/')?
    };
    let segment = rest.split('/').next()?;
    (!segment.is_empty()).then(|| segment.to_owned())
}
