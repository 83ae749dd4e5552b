//! AWS Signature Version 4 presigning for MQTT over WebSocket
//!
//! AWS IoT accepts the signature as query parameters on the upgrade request
//! (`GET /mqtt?X-Amz-...`). The session token, when present, is appended
//! after signing and is not part of the canonical request.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::TransportError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "iotdevicegateway";

/// AWS credentials used to sign WebSocket connections
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Percent-encode everything except RFC 3986 unreserved characters
pub fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, TransportError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TransportError::Signing(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the signing key for one day, region and service
pub fn signing_key(
    secret_access_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, TransportError> {
    let k_date = hmac(format!("AWS4{}", secret_access_key).as_bytes(), date)?;
    let k_region = hmac(&k_date, region)?;
    let k_service = hmac(&k_region, service)?;
    hmac(&k_service, "aws4_request")
}

/// Build the presigned query string for `GET {path}` on `host`
pub fn presign_query(
    host: &str,
    path: &str,
    region: &str,
    credentials: &AwsCredentials,
    now: DateTime<Utc>,
) -> Result<String, TransportError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);

    // Parameters are already in canonical (sorted) order
    let query = format!(
        "X-Amz-Algorithm={}&X-Amz-Credential={}&X-Amz-Date={}&X-Amz-SignedHeaders=host",
        ALGORITHM,
        uri_encode(&format!("{}/{}", credentials.access_key_id, scope)),
        amz_date,
    );

    let payload_hash = hex::encode(Sha256::digest(b""));
    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
        path, query, host, payload_hash
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, SERVICE)?;
    let signature = hex::encode(hmac(&key, &string_to_sign)?);

    let mut signed = format!("{}&X-Amz-Signature={}", query, signature);
    if let Some(ref token) = credentials.session_token {
        signed.push_str("&X-Amz-Security-Token=");
        signed.push_str(&uri_encode(token));
    }
    Ok(signed)
}

/// Region of an AWS IoT endpoint such as `xxx-ats.iot.eu-west-1.amazonaws.com`
pub fn region_from_host(host: &str) -> Option<String> {
    let rest = host.split_once(".iot.")?.1;
    let (region, suffix) = rest.split_once('.')?;
    if region.is_empty() || !suffix.starts_with("amazonaws.com") {
        return None;
    }
    Some(region.to_string())
}
