//! HTTP object service backend
//!
//! Speaks an S3-style path API:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | read      | `GET {endpoint}/{bucket}/{key}` |
//! | stat      | `HEAD {endpoint}/{bucket}/{key}` |
//! | write     | `PUT {endpoint}/{bucket}/{key}` |
//! | delete    | `DELETE {endpoint}/{bucket}/{key}` |
//! | list      | `GET {endpoint}/{bucket}?prefix=&continuation-token=&max-keys=` |
//!
//! Content hash and tags travel in `x-amz-meta-*` headers.
//!
//! # Conditional writes
//!
//! `IfHashMatches` is evaluated with a `HEAD` followed by the `PUT`. With
//! [`RemoteConfig::native_conditional_writes`] the `PUT` carries
//! `If-Match: <etag>` so the service rejects a concurrent replacement. Without
//! it another writer can replace the object between the `HEAD` and the `PUT`,
//! and the last write wins.

use crate::{
    Backend, ContinuationToken, HashAlgorithm, ListPage, ObjectMetadata, ObjectReader,
    Precondition, Result, StorageError, StorageKey, Tags, WriteSession, DEFAULT_PAGE_SIZE,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{
    HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH, LAST_MODIFIED,
    RETRY_AFTER,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::fmt::Display;
use std::time::Duration;
use stowage_core::ContentHash;
use tracing::instrument;
use url::Url;

const HASH_HEADER: &str = "x-amz-meta-content-hash";
const TAGS_HEADER: &str = "x-amz-meta-tags";

/// Configuration for the remote service
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Service base URL (e.g., "https://objects.example.com")
    pub endpoint: String,
    /// Bucket all keys live under
    pub bucket: String,
    /// Per-request timeout for non-streaming requests
    pub timeout: Duration,
    /// Service honors `If-Match` on `PUT`
    pub native_conditional_writes: bool,
    /// Requested page size for listings
    pub page_size: usize,
    /// Digest recorded for written objects
    pub hash_algorithm: HashAlgorithm,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "stowage".to_string(),
            timeout: Duration::from_secs(30),
            native_conditional_writes: false,
            page_size: DEFAULT_PAGE_SIZE,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_native_conditional_writes(mut self, enabled: bool) -> Self {
        self.native_conditional_writes = enabled;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }
}

/// Pre-obtained access credential
#[derive(Clone, Default)]
pub enum Credential {
    #[default]
    Anonymous,
    Bearer(String),
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Anonymous => request,
            Self::Bearer(token) => request.bearer_auth(token),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Translate an HTTP status into the shared taxonomy
pub fn map_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    context: impl Display,
) -> StorageError {
    let message = format!("{} ({})", context, status);
    match status.as_u16() {
        400 => StorageError::InvalidKey(message),
        401 | 403 => StorageError::PermissionDenied(message),
        404 => StorageError::NotFound(message),
        409 | 412 => StorageError::Conflict(message),
        429 => StorageError::rate_limited(message, retry_after),
        408 | 500 | 502 | 503 | 504 => StorageError::Transient {
            message,
            retry_after,
        },
        _ => StorageError::Unavailable(message),
    }
}

/// Translate a transport failure into the shared taxonomy
pub fn map_transport_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        StorageError::transient(err.to_string())
    } else if err.is_decode() {
        StorageError::Corrupt(err.to_string())
    } else {
        StorageError::Unavailable(err.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn encode_tags(tags: &Tags) -> Result<String> {
    let json = serde_json::to_string(tags).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    Ok(urlencoding::encode(&json).into_owned())
}

/// Rebuild metadata from object response headers
fn metadata_from_headers(key: &StorageKey, headers: &HeaderMap) -> Result<ObjectMetadata> {
    let corrupt = |what: &str| StorageError::Corrupt(format!("{}: {}", key, what));

    let size_bytes = header_str(headers, CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| corrupt("missing content length"))?;
    let content_hash: ContentHash = header_str(headers, HASH_HEADER)
        .ok_or_else(|| corrupt("missing content hash header"))?
        .parse()
        .map_err(|e: String| corrupt(&e))?;
    let tags = match header_str(headers, TAGS_HEADER) {
        Some(raw) => {
            let json = urlencoding::decode(raw).map_err(|e| corrupt(&e.to_string()))?;
            serde_json::from_str(&json).map_err(|e| corrupt(&e.to_string()))?
        }
        None => Tags::new(),
    };
    let last_modified = header_str(headers, LAST_MODIFIED.as_str())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(ObjectMetadata {
        key: key.clone(),
        size_bytes,
        content_hash,
        last_modified,
        tags,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    objects: Vec<ListedObject>,
    next_continuation_token: Option<String>,
}

/// Listing entry as the service reports it; keys are validated per entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedObject {
    key: String,
    size_bytes: u64,
    content_hash: String,
    last_modified: DateTime<Utc>,
    #[serde(default)]
    tags: Tags,
}

impl ListedObject {
    fn into_metadata(self) -> Result<ObjectMetadata> {
        let key = StorageKey::normalize(&self.key)?;
        let content_hash = self.content_hash.parse::<ContentHash>().map_err(|e| {
            StorageError::Corrupt(format!("{}: bad content hash: {}", self.key, e))
        })?;
        Ok(ObjectMetadata {
            key,
            size_bytes: self.size_bytes,
            content_hash,
            last_modified: self.last_modified,
            tags: self.tags,
        })
    }
}

/// Client for an S3-style object service
#[derive(Clone)]
pub struct RemoteBackend {
    client: Client,
    base: Url,
    credential: Credential,
    config: RemoteConfig,
}

impl RemoteBackend {
    /// Create a client; no request is made until the first operation
    pub fn new(config: RemoteConfig, credential: Credential) -> Result<Self> {
        let base = Url::parse(&config.endpoint).map_err(|e| {
            StorageError::Unavailable(format!("invalid endpoint {}: {}", config.endpoint, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(StorageError::Unavailable(format!(
                "endpoint {} cannot carry object paths",
                config.endpoint
            )));
        }

        let client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            credential,
            config,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn bucket_url(&self) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.config.bucket);
        }
        url
    }

    fn object_url(&self, key: &StorageKey) -> Url {
        let mut url = self.bucket_url();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(key.segments());
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.credential.apply(self.client.request(method, url))
    }

    async fn send(&self, request: RequestBuilder, context: impl Display) -> Result<Response> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let hint = retry_after(response.headers());
        tracing::debug!(%status, "request rejected");
        Err(map_status(status, hint, context))
    }

    /// Current metadata and entity tag, `None` when absent
    async fn head(&self, key: &StorageKey) -> Result<Option<(ObjectMetadata, Option<String>)>> {
        let request = self
            .request(Method::HEAD, self.object_url(key))
            .timeout(self.config.timeout);
        match self.send(request, key).await {
            Ok(response) => {
                let etag = header_str(response.headers(), ETAG.as_str()).map(str::to_string);
                Ok(Some((metadata_from_headers(key, response.headers())?, etag)))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(
        &self,
        key: &StorageKey,
        body: Bytes,
        tags: Tags,
        precondition: Precondition,
    ) -> Result<ObjectMetadata> {
        let metadata =
            ObjectMetadata::for_body(key.clone(), &body, self.config.hash_algorithm, tags);
        let mut request = self
            .request(Method::PUT, self.object_url(key))
            .timeout(self.config.timeout)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(HASH_HEADER, metadata.content_hash.to_string())
            .header(TAGS_HEADER, encode_tags(&metadata.tags)?);

        match &precondition {
            Precondition::None => {}
            Precondition::IfAbsent => request = request.header(IF_NONE_MATCH, "*"),
            Precondition::IfHashMatches(_) => {
                let current = self.head(key).await?;
                precondition.check(key, current.as_ref().map(|(meta, _)| meta))?;
                if self.config.native_conditional_writes {
                    if let Some((_, Some(etag))) = current {
                        request = request.header(IF_MATCH, etag);
                    }
                }
            }
        }

        match self.send(request.body(body), key).await {
            Ok(_) => Ok(metadata),
            Err(StorageError::Conflict(_)) if precondition == Precondition::IfAbsent => {
                Err(StorageError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.config.hash_algorithm
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn read(&self, key: &StorageKey) -> Result<ObjectReader> {
        let response = self
            .send(self.request(Method::GET, self.object_url(key)), key)
            .await?;
        let metadata = metadata_from_headers(key, response.headers())?;
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_transport_error))
            .boxed();
        Ok(ObjectReader::new(metadata, chunks))
    }

    #[instrument(skip(self, key, body, tags), fields(key = %key, size = body.len()))]
    async fn write_full(
        &self,
        key: &StorageKey,
        body: Bytes,
        tags: Tags,
        precondition: Precondition,
    ) -> Result<ObjectMetadata> {
        let metadata = self.put(key, body, tags, precondition).await?;
        tracing::debug!(hash = %metadata.content_hash, "object uploaded");
        Ok(metadata)
    }

    async fn write_stream(&self, key: &StorageKey, tags: Tags) -> Result<Box<dyn WriteSession>> {
        Ok(Box::new(RemoteWriteSession {
            backend: self.clone(),
            key: key.clone(),
            tags,
            buffer: BytesMut::new(),
        }))
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn stat(&self, key: &StorageKey) -> Result<ObjectMetadata> {
        self.head(key)
            .await?
            .map(|(meta, _)| meta)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, token))]
    async fn list(
        &self,
        prefix: Option<&StorageKey>,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage> {
        let mut url = self.bucket_url();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("list-type", "2");
            query.append_pair("max-keys", &self.config.page_size.to_string());
            if let Some(prefix) = prefix {
                query.append_pair("prefix", &prefix.to_string());
            }
            if let Some(token) = token {
                query.append_pair("continuation-token", token.as_str());
            }
        }

        let request = self.request(Method::GET, url).timeout(self.config.timeout);
        let context = format!("list {}", prefix.map(|p| p.to_string()).unwrap_or_default());
        let response = self.send(request, &context).await?;
        let listing: ListResponse = response.json().await.map_err(map_transport_error)?;

        // The service matches prefixes by string; narrow to whole segments.
        let mut objects: Vec<ObjectMetadata> = listing
            .objects
            .into_iter()
            .filter_map(|entry| {
                let raw = entry.key.clone();
                match entry.into_metadata() {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        tracing::warn!(key = %raw, error = %e, "skipping unrepresentable entry");
                        None
                    }
                }
            })
            .filter(|meta| prefix.map_or(true, |p| p.is_prefix_of(&meta.key)))
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        tracing::debug!(count = objects.len(), "listed remote page");
        Ok(ListPage {
            objects,
            next: listing.next_continuation_token.map(ContinuationToken),
        })
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<()> {
        let request = self
            .request(Method::DELETE, self.object_url(key))
            .timeout(self.config.timeout);
        self.send(request, key).await?;
        Ok(())
    }
}

/// Buffers the body and uploads it in one `PUT` on commit
struct RemoteWriteSession {
    backend: RemoteBackend,
    key: StorageKey,
    tags: Tags,
    buffer: BytesMut,
}

#[async_trait]
impl WriteSession for RemoteWriteSession {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(self: Box<Self>) -> Result<ObjectMetadata> {
        let session = *self;
        session
            .backend
            .write_full(&session.key, session.buffer.freeze(), session.tags, Precondition::None)
            .await
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
