//! Object store access: the [`ObjectStore`] trait, an S3 implementation,
//! and the retrying [`ObjectFetcher`] used by the pipeline.
//!
//! The S3 store issues a single SigV4-signed `GetObject` per call and maps
//! the response onto the pipeline error taxonomy:
//!
//! | Response | Error |
//! |----------|-------|
//! | 404, `NoSuchKey`, `NoSuchBucket`, `NoSuchVersion` | `NotFound` (terminal) |
//! | 429, 5xx, timeout, connection failure | `TransientStore` (retried) |
//! | other 4xx (e.g. 403) | `Config` (terminal) |
//!
//! # Configuration
//!
//! ```toml
//! [object_store]
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO, LocalStack (path-style)
//! timeout_secs = 30
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;

use crate::aws::{self, AwsCredentials, Endpoint, RequestParts};
use crate::classify;
use crate::config::ObjectStoreConfig;
use crate::error::{body_excerpt, transport_error, PipelineError};
use crate::models::{DocumentEvent, RawObject};
use crate::retry::{self, Deadline, RetryPolicy, Step};

/// Read access to stored objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Retrieve the bytes and metadata of one object.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> Result<RawObject, PipelineError>;
}

/// Amazon S3 (or S3-compatible) object store.
pub struct S3ObjectStore {
    client: reqwest::Client,
    creds: AwsCredentials,
    region: String,
    endpoint_url: Option<String>,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectStoreConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            creds,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    /// Virtual-hosted style against AWS, path-style against a custom endpoint.
    fn locate<'a>(&self, bucket: &'a str, key: &'a str) -> (Endpoint, Vec<&'a str>) {
        let key_segments = key.split('/');
        match self.endpoint_url {
            Some(ref url) => {
                let mut segments = vec![bucket];
                segments.extend(key_segments);
                (Endpoint::parse(url), segments)
            }
            None => (
                Endpoint::https(format!("{}.s3.{}.amazonaws.com", bucket, self.region)),
                key_segments.collect(),
            ),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> Result<RawObject, PipelineError> {
        let (endpoint, segments) = self.locate(bucket, key);
        let query: Vec<(String, String)> = version
            .map(|v| vec![("versionId".to_string(), v.to_string())])
            .unwrap_or_default();

        let signed = aws::sign(
            &self.creds,
            &RequestParts {
                method: "GET",
                endpoint: &endpoint,
                path_segments: &segments,
                query: &query,
                extra_headers: &[],
                payload: b"",
                region: &self.region,
                service: "s3",
            },
            Utc::now(),
        );

        let mut req = self.client.get(&signed.url);
        for (name, value) in &signed.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&e, PipelineError::TransientStore))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_get_failure(bucket, key, status.as_u16(), &body));
        }

        let headers = resp.headers().clone();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| transport_error(&e, PipelineError::TransientStore))?;

        Ok(raw_object_from_response(&headers, bytes.to_vec()))
    }
}

fn classify_get_failure(bucket: &str, key: &str, status: u16, body: &str) -> PipelineError {
    let missing = status == 404
        || body.contains("<Code>NoSuchKey</Code>")
        || body.contains("<Code>NoSuchBucket</Code>")
        || body.contains("<Code>NoSuchVersion</Code>");
    if missing {
        return PipelineError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
    }
    let message = format!("S3 GetObject failed (HTTP {}): {}", status, body_excerpt(body));
    if status == 429 || status == 408 || status >= 500 || body.contains("<Code>SlowDown</Code>") {
        PipelineError::TransientStore(message)
    } else {
        PipelineError::Config(message)
    }
}

fn raw_object_from_response(headers: &HeaderMap, bytes: Vec<u8>) -> RawObject {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    let content_length = header("content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(bytes.len() as u64);

    let last_modified = header("last-modified").and_then(|v| {
        DateTime::parse_from_rfc2822(&v)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    });

    let etag = header("etag").map(|v| v.trim_matches('"').to_string());

    let user_metadata: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix("x-amz-meta-")?;
            Some((name.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    RawObject {
        content_type: header("content-type").unwrap_or_default(),
        content_length,
        last_modified,
        etag,
        user_metadata,
        bytes,
    }
}

/// Fetches the object named by a [`DocumentEvent`], retrying transient
/// failures with backoff. `NotFound` is returned immediately.
pub struct ObjectFetcher {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl ObjectFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            call_timeout,
        }
    }

    pub async fn fetch(
        &self,
        event: &DocumentEvent,
        deadline: &Deadline,
    ) -> Result<RawObject, PipelineError> {
        let mut object = retry::with_backoff(
            &self.policy,
            Step::Fetch,
            self.call_timeout,
            deadline,
            || self.store.get(&event.bucket, &event.key, event.version.as_deref()),
        )
        .await?;

        if classify::essence(&object.content_type).is_empty() {
            object.content_type = classify::guess_content_type(&event.key)
                .unwrap_or("application/octet-stream")
                .to_string();
        }

        tracing::debug!(
            uri = %event.uri(),
            content_type = %object.content_type,
            bytes = object.bytes.len(),
            "fetched object"
        );
        Ok(object)
    }
}
