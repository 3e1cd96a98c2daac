//! Blob storage backends.
//!
//! File contents are stored under content-addressed keys of the form
//! `{project_id}/{content_hash}/{filename}`. Two backends implement
//! [`BlobStore`]:
//!
//! - [`FsBlobStore`]: a local directory, used for development and tests.
//! - [`S3BlobStore`]: the S3 REST API signed with AWS Signature V4, with
//!   support for custom endpoints (MinIO, LocalStack) via path-style URLs.
//!
//! The SigV4 signer uses only `hmac` + `sha2`, with no AWS SDK dependency.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! provider = "s3"
//! bucket = "doc-mirror"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
//! optionally `AWS_SESSION_TOKEN`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{Config, Secrets, StorageConfig};
use crate::error::SyncError;
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::BlobStore;

type HmacSha256 = Hmac<Sha256>;

/// Build the storage key for one file version.
pub fn blob_key(project_id: &str, content_hash: &str, path: &str) -> String {
    let filename = path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("blob");
    format!("{}/{}/{}", project_id, content_hash, filename)
}

/// Create the configured backend.
pub fn create_blob_store(config: &Config, secrets: &Secrets) -> Result<Arc<dyn BlobStore>> {
    match config.storage.provider.as_str() {
        "filesystem" => Ok(Arc::new(FsBlobStore::new(config.storage.root.clone()))),
        "s3" => Ok(Arc::new(S3BlobStore::new(
            config.storage.clone(),
            AwsCredentials::from_secrets(secrets)?,
        )?)),
        other => bail!("Unknown storage provider: {}", other),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Local directory
// ═══════════════════════════════════════════════════════════════════════

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn ensure_ready(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create blob root {}", self.root.display()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {}", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {}", key)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// S3
// ═══════════════════════════════════════════════════════════════════════

/// AWS credentials taken from the process secrets.
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_secrets(secrets: &Secrets) -> Result<Self> {
        let access_key_id = secrets
            .aws_access_key_id
            .clone()
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = secrets
            .aws_secret_access_key
            .clone()
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: secrets.aws_session_token.clone(),
        })
    }
}

pub struct S3BlobStore {
    config: StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl S3BlobStore {
    pub fn new(config: StorageConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            config,
            creds,
            client,
            policy: RetryPolicy::default(),
        })
    }

    /// Scheme, host and whether to address the bucket in the path.
    fn endpoint(&self) -> (String, String, bool) {
        match self.config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") { "http" } else { "https" };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host, true)
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", self.config.bucket, self.config.region),
                false,
            ),
        }
    }

    /// Canonical URI for `key` (or the bucket itself when `key` is empty).
    fn canonical_uri(&self, key: &str, path_style: bool) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match (path_style, key.is_empty()) {
            (true, true) => format!("/{}", uri_encode(&self.config.bucket)),
            (true, false) => format!("/{}/{}", uri_encode(&self.config.bucket), encoded_key),
            (false, _) => format!("/{}", encoded_key),
        }
    }

    /// Send one signed request.
    async fn send(&self, method: Method, key: &str, body: &[u8]) -> Result<reqwest::Response> {
        let (scheme, host, path_style) = self.endpoint();
        let canonical_uri = self.canonical_uri(key, path_style);
        let url = format!("{}://{}{}", scheme, host, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let signed = sign_v4(
            &SigningInput {
                method: method.as_str(),
                canonical_uri: &canonical_uri,
                canonical_query: "",
                headers: &headers,
                payload_hash: &payload_hash,
                date_stamp: &date_stamp,
                amz_date: &amz_date,
                region: &self.config.region,
            },
            &self.creds,
        );

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &signed)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body.to_vec());
        }

        req.send().await.map_err(|e| {
            anyhow::Error::from(SyncError::transient(
                "s3",
                format!("{} s3://{}/{}: {}", method, self.config.bucket, key, e),
            ))
        })
    }

    async fn check(&self, resp: reqwest::Response, op: &str, key: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = format!(
            "S3 {} failed (HTTP {}) for key '{}': {}",
            op,
            status,
            key,
            body.chars().take(300).collect::<String>()
        );
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SyncError::transient("s3", message).into());
        }
        bail!(message)
    }

    fn create_bucket_body(&self) -> Vec<u8> {
        if self.config.region == "us-east-1" {
            return Vec::new();
        }
        format!(
            "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
            self.config.region
        )
        .into_bytes()
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn name(&self) -> &str {
        "s3"
    }

    async fn ensure_ready(&self) -> Result<()> {
        let resp = self.send(Method::HEAD, "", b"").await?;
        match resp.status() {
            s if s.is_success() => {
                debug!(bucket = %self.config.bucket, "bucket exists");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                info!(bucket = %self.config.bucket, region = %self.config.region, "creating bucket");
                let body = self.create_bucket_body();
                let resp = self.send(Method::PUT, "", &body).await?;
                self.check(resp, "CreateBucket", "").await?;
                Ok(())
            }
            other => bail!(
                "S3 HeadBucket failed (HTTP {}) for bucket '{}'",
                other,
                self.config.bucket
            ),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        retry_transient(&self.policy, "s3.put", move || async move {
            let resp = self.send(Method::PUT, key, bytes).await?;
            self.check(resp, "PutObject", key).await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        retry_transient(&self.policy, "s3.get", move || async move {
            let resp = self.send(Method::GET, key, b"").await?;
            let resp = self.check(resp, "GetObject", key).await?;
            Ok::<_, anyhow::Error>(resp.bytes().await?.to_vec())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        retry_transient(&self.policy, "s3.delete", move || async move {
            let resp = self.send(Method::DELETE, key, b"").await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            self.check(resp, "DeleteObject", key).await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }
}

// ============ AWS SigV4 Helpers ============

struct SigningInput<'a> {
    method: &'a str,
    canonical_uri: &'a str,
    canonical_query: &'a str,
    headers: &'a [(String, String)],
    payload_hash: &'a str,
    date_stamp: &'a str,
    amz_date: &'a str,
    region: &'a str,
}

/// Build the `Authorization` header value for a request.
fn sign_v4(input: &SigningInput<'_>, creds: &AwsCredentials) -> String {
    let mut headers = input.headers.to_vec();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        input.canonical_uri,
        input.canonical_query,
        canonical_headers,
        signed_headers,
        input.payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", input.date_stamp, input.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        input.amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, input.date_stamp, input.region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` unescaped.
pub(crate) fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_key_uses_filename() {
        assert_eq!(blob_key("p1", "abc123", "docs/guide/intro.md"), "p1/abc123/intro.md");
        assert_eq!(blob_key("p1", "abc123", "README.md"), "p1/abc123/README.md");
    }

    #[test]
    fn uri_encode_escapes_reserved() {
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(uri_encode("safe-._~"), "safe-._~");
    }

    #[test]
    fn signing_key_matches_aws_example() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn path_style_uri_for_custom_endpoint() {
        let store = S3BlobStore::new(
            StorageConfig {
                provider: "s3".into(),
                root: PathBuf::new(),
                bucket: "docs".into(),
                region: "us-east-1".into(),
                endpoint_url: Some("http://localhost:9000/".into()),
            },
            AwsCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "SECRET".into(),
                session_token: None,
            },
        )
        .unwrap();
        let (scheme, host, path_style) = store.endpoint();
        assert_eq!(scheme, "http");
        assert_eq!(host, "localhost:9000");
        assert!(path_style);
        assert_eq!(store.canonical_uri("p/h/a b.md", true), "/docs/p/h/a%20b.md");
        assert_eq!(store.canonical_uri("", true), "/docs");
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_tolerates_missing_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));
        store.ensure_ready().await.unwrap();
        store.put("p/h/a.md", b"hello").await.unwrap();
        assert_eq!(store.get("p/h/a.md").await.unwrap(), b"hello");
        store.delete("p/h/a.md").await.unwrap();
        store.delete("p/h/a.md").await.unwrap();
        assert!(store.get("p/h/a.md").await.is_err());
    }

    #[test]
    fn fs_store_rejects_traversal() {
        let store = FsBlobStore::new("/tmp/blobs");
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("/abs").is_err());
    }
}
