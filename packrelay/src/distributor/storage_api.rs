//! Object-storage API abstraction.
//!
//! The trait keeps the distributor testable without a live bucket; the real
//! client speaks the storage provider's v1 signing scheme directly —
//! HMAC-SHA1 over a canonical string, sent as an `Authorization` header for
//! API calls and as an `Expires`/key-id/`Signature` query triplet for
//! presigned download URLs. Presigning is pure computation; only metadata
//! probes and object fetches touch the network.

use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LAST_MODIFIED};
use sha1::Sha1;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::BoxFuture;

type HmacSha1 = Hmac<Sha1>;

/// Errors from the storage API layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Http(String),

    #[error("storage returned HTTP {status} for `{key}`")]
    Status { status: u16, key: String },

    #[error("storage response missing `{0}` header")]
    MissingHeader(&'static str),

    #[error("malformed `{header}` header: {value}")]
    MalformedHeader {
        header: &'static str,
        value: String,
    },

    #[error("storage URL could not be built: {0}")]
    Url(#[from] url::ParseError),

    #[error("request signing failed: {0}")]
    Signing(String),
}

/// Metadata of one stored object, from a HEAD probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
}

/// The slice of the storage API this crate needs.
pub trait StorageApi: Send + Sync {
    /// Fetch an object's metadata without its body.
    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<ObjectMetadata, StorageError>>;

    /// Fetch an object's bytes. Used only to compute content hashes.
    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, StorageError>>;

    /// Mint a time-limited signed GET URL for an object.
    fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        valid_for: Duration,
    ) -> Result<Url, StorageError>;
}

/// Real storage client using v1 HMAC-SHA1 request signing.
pub struct HmacV1Client {
    http: reqwest::Client,
    endpoint: String,
    access_key_id: String,
    access_key_secret: String,
}

impl HmacV1Client {
    pub fn new(
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        })
    }

    /// Virtual-hosted object address: `https://{bucket}.{endpoint}/{key}`.
    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, StorageError> {
        Ok(Url::parse(&format!(
            "https://{}.{}/{}",
            bucket, self.endpoint, key
        ))?)
    }

    fn sign(&self, string_to_sign: &str) -> Result<String, StorageError> {
        let mut mac = HmacSha1::new_from_slice(self.access_key_secret.as_bytes())
            .map_err(|e| StorageError::Signing(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        bucket: &str,
        key: &str,
    ) -> Result<reqwest::Response, StorageError> {
        let url = self.object_url(bucket, key)?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resource = canonical_resource(bucket, key);
        let signature = self.sign(&string_to_sign(method.as_str(), &date, &resource))?;

        let response = self
            .http
            .request(method, url)
            .header("Date", date)
            .header(
                AUTHORIZATION,
                format!("OSS {}:{}", self.access_key_id, signature),
            )
            .send()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Status {
                status: response.status().as_u16(),
                key: key.to_string(),
            });
        }
        Ok(response)
    }
}

impl StorageApi for HmacV1Client {
    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<ObjectMetadata, StorageError>> {
        Box::pin(async move {
            let response = self.signed_request(reqwest::Method::HEAD, bucket, key).await?;

            let content_type = header_str(&response, CONTENT_TYPE.as_str(), "content-type")?;
            let last_modified_raw = header_str(&response, LAST_MODIFIED.as_str(), "last-modified")?;
            let last_modified = DateTime::parse_from_rfc2822(&last_modified_raw)
                .map_err(|_| StorageError::MalformedHeader {
                    header: "last-modified",
                    value: last_modified_raw.clone(),
                })?
                .with_timezone(&Utc);

            debug!(bucket, key, %content_type, %last_modified, "probed object metadata");
            Ok(ObjectMetadata {
                content_type,
                last_modified,
            })
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move {
            let response = self.signed_request(reqwest::Method::GET, bucket, key).await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| StorageError::Http(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }

    fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        valid_for: Duration,
    ) -> Result<Url, StorageError> {
        let expires = Utc::now().timestamp() + valid_for.as_secs() as i64;
        let resource = canonical_resource(bucket, key);
        let signature = self.sign(&string_to_sign("GET", &expires.to_string(), &resource))?;

        let mut url = self.object_url(bucket, key)?;
        url.query_pairs_mut()
            .append_pair("Expires", &expires.to_string())
            .append_pair("OSSAccessKeyId", &self.access_key_id)
            .append_pair("Signature", &signature);
        Ok(url)
    }
}

fn header_str(
    response: &reqwest::Response,
    header: &str,
    label: &'static str,
) -> Result<String, StorageError> {
    let value = response
        .headers()
        .get(header)
        .ok_or(StorageError::MissingHeader(label))?;
    let value = value.to_str().map_err(|_| StorageError::MalformedHeader {
        header: label,
        value: format!("{value:?}"),
    })?;
    Ok(value.to_string())
}

/// `/{bucket}/{key}` — the resource component of the canonical string.
fn canonical_resource(bucket: &str, key: &str) -> String {
    format!("/{bucket}/{key}")
}

/// The v1 canonical string: verb, empty content-md5, empty content-type,
/// date (or expiry timestamp for presigning), canonicalized resource.
fn string_to_sign(verb: &str, date_or_expires: &str, resource: &str) -> String {
    format!("{verb}\n\n\n{date_or_expires}\n{resource}")
}
