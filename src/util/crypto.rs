use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const ALPHA_NUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Characters that survive URI-component encoding unescaped
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("key has an invalid length")]
    InvalidLength,
}

pub fn sha256_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

pub fn pseudorandom_string(alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rand::random_range(0..alphabet.len())] as char)
        .collect()
}

pub fn percent_encode(src: &str) -> String {
    utf8_percent_encode(src, URI_COMPONENT).to_string()
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| KeyError::InvalidLength)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the per-device symmetric key from an enrollment-group key.
///
/// The device key is the HMAC-SHA256 of the registration id under the
/// base64-decoded group key, re-encoded as base64. This must match the key
/// the provisioning broker derives for the same enrollment group, or
/// registration will be rejected.
pub fn derive_device_key(group_key: &str, registration_id: &str) -> Result<String, KeyError> {
    let key = BASE64.decode(group_key.trim())?;
    let digest = hmac_sha256(&key, registration_id.as_bytes())?;
    Ok(BASE64.encode(digest))
}

/// Build a shared-access signature for `resource_uri`, valid for `ttl`.
///
/// The signature is computed over `"{url-encoded resource}\n{expiry}"` with
/// the base64-decoded key. `policy` becomes the `skn` field when present
/// (registration tokens use `registration`, device tokens carry none).
pub fn sas_token(
    resource_uri: &str,
    key: &str,
    policy: Option<&str>,
    ttl: Duration,
) -> Result<String, KeyError> {
    let expiry = unix_timestamp() + ttl.as_secs();
    let encoded_resource = percent_encode(resource_uri);

    let key = BASE64.decode(key.trim())?;
    let to_sign = format!("{encoded_resource}\n{expiry}");
    let signature = BASE64.encode(hmac_sha256(&key, to_sign.as_bytes())?);

    let mut token = format!(
        "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}",
        percent_encode(&signature)
    );
    if let Some(policy) = policy {
        token.push_str(&format!("&skn={policy}"));
    }
    Ok(token)
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
