//! Shared fixtures for cross-backend tests

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use stowage::{
    Credential, HashAlgorithm, LocalDiskBackend, MemoryBackend, RemoteBackend, RemoteConfig,
    RetryPolicy, StorageClient, StorageKey,
};
use tempfile::TempDir;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const BUCKET: &str = "bucket";
const HASH_HEADER: &str = "x-amz-meta-content-hash";
const TAGS_HEADER: &str = "x-amz-meta-tags";

#[derive(Clone, Copy, Debug)]
pub enum Flavor {
    Memory,
    Local,
    Remote,
}

/// Quick policy so retry paths finish fast in real time
pub fn test_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        jitter_ratio: 0.1,
    }
}

enum Store {
    Memory(MemoryBackend),
    Local(#[allow(dead_code)] TempDir, LocalDiskBackend),
    Remote(#[allow(dead_code)] MockServer, FakeObjectService),
}

/// A client over one backend plus out-of-band access to its storage
pub struct Harness {
    pub client: StorageClient,
    store: Store,
}

impl Harness {
    pub async fn new(flavor: Flavor) -> Self {
        Self::with_page_size(flavor, 1000).await
    }

    pub async fn with_page_size(flavor: Flavor, page_size: usize) -> Self {
        let timeout = Duration::from_secs(30);
        match flavor {
            Flavor::Memory => {
                let backend = MemoryBackend::new().with_page_size(page_size);
                let client =
                    StorageClient::with_policy(Arc::new(backend.clone()), test_policy(), timeout);
                Self {
                    client,
                    store: Store::Memory(backend),
                }
            }
            Flavor::Local => {
                let dir = TempDir::new().unwrap();
                let backend = LocalDiskBackend::open_at(dir.path(), HashAlgorithm::Blake3)
                    .await
                    .unwrap()
                    .with_page_size(page_size);
                let client =
                    StorageClient::with_policy(Arc::new(backend.clone()), test_policy(), timeout);
                Self {
                    client,
                    store: Store::Local(dir, backend),
                }
            }
            Flavor::Remote => {
                let (server, service) = FakeObjectService::start().await;
                let config = RemoteConfig::new(server.uri(), BUCKET)
                    .with_native_conditional_writes(true)
                    .with_page_size(page_size);
                let backend = RemoteBackend::new(config, Credential::bearer("test-token")).unwrap();
                Self {
                    client: StorageClient::with_policy(Arc::new(backend), test_policy(), timeout),
                    store: Store::Remote(server, service),
                }
            }
        }
    }

    /// Overwrite a stored body without touching its recorded metadata
    pub fn tamper(&self, key: &str, body: &[u8]) {
        let key = StorageKey::normalize(key).unwrap();
        match &self.store {
            Store::Memory(backend) => assert!(backend.tamper(&key, body.to_vec())),
            Store::Local(_, backend) => std::fs::write(backend.object_path(&key), body).unwrap(),
            Store::Remote(_, service) => service.tamper(&key.to_string(), body),
        }
    }
}

#[derive(Clone)]
struct StoredObject {
    body: Vec<u8>,
    hash: String,
    tags: String,
    etag: String,
}

#[derive(Default)]
struct ServiceState {
    objects: BTreeMap<String, StoredObject>,
    version: u64,
    failures: u32,
}

/// Stateful stand-in for an S3-style object service
#[derive(Clone, Default)]
pub struct FakeObjectService {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeObjectService {
    pub async fn start() -> (MockServer, Self) {
        let server = MockServer::start().await;
        let service = Self::default();
        Mock::given(any())
            .respond_with(service.clone())
            .mount(&server)
            .await;
        (server, service)
    }

    /// Answer the next `count` requests with 503
    #[allow(dead_code)]
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().failures = count;
    }

    pub fn tamper(&self, key: &str, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let object = state.objects.get_mut(key).expect("tampered object exists");
        object.body = body.to_vec();
    }

    fn list(state: &ServiceState, request: &Request) -> ResponseTemplate {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let max_keys = query
            .get("max-keys")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1000);
        let after = query.get("continuation-token");

        let matching: Vec<(&String, &StoredObject)> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| after.map_or(true, |a| key.as_str() > a.as_str()))
            .collect();
        let page = &matching[..matching.len().min(max_keys)];
        let next = if matching.len() > max_keys {
            page.last().map(|(key, _)| key.to_string())
        } else {
            None
        };

        let objects: Vec<Value> = page
            .iter()
            .map(|(key, object)| {
                let tags = urlencoding::decode(&object.tags)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                    .unwrap_or_else(|| json!({}));
                json!({
                    "key": key,
                    "sizeBytes": object.body.len(),
                    "contentHash": object.hash,
                    "lastModified": "2024-01-01T00:00:00Z",
                    "tags": tags,
                })
            })
            .collect();

        ResponseTemplate::new(200)
            .set_body_json(json!({ "objects": objects, "nextContinuationToken": next }))
    }

    fn put(state: &mut ServiceState, key: String, request: &Request) -> ResponseTemplate {
        let current = state.objects.get(&key);
        if header(request, "if-none-match") == Some("*") && current.is_some() {
            return ResponseTemplate::new(412);
        }
        if let Some(etag) = header(request, "if-match") {
            if current.map(|o| o.etag.as_str()) != Some(etag) {
                return ResponseTemplate::new(412);
            }
        }

        state.version += 1;
        let object = StoredObject {
            body: request.body.clone(),
            hash: header(request, HASH_HEADER).unwrap_or_default().to_string(),
            tags: header(request, TAGS_HEADER).unwrap_or_default().to_string(),
            etag: format!("\"v{}\"", state.version),
        };
        state.objects.insert(key, object);
        ResponseTemplate::new(200)
    }
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

fn with_object_headers(template: ResponseTemplate, object: &StoredObject) -> ResponseTemplate {
    template
        .insert_header(HASH_HEADER, object.hash.as_str())
        .insert_header(TAGS_HEADER, object.tags.as_str())
        .insert_header("etag", object.etag.as_str())
}

impl Respond for FakeObjectService {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();
        if state.failures > 0 {
            state.failures -= 1;
            return ResponseTemplate::new(503);
        }

        let mut segments = request
            .url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_default())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
            .into_iter();
        if segments.next().as_deref() != Some(BUCKET) {
            return ResponseTemplate::new(404);
        }
        let key = segments.collect::<Vec<_>>().join("/");

        match (request.method.as_str(), key.is_empty()) {
            ("GET", true) => Self::list(&state, request),
            ("GET", false) => match state.objects.get(&key) {
                Some(object) => with_object_headers(
                    ResponseTemplate::new(200).set_body_bytes(object.body.clone()),
                    object,
                ),
                None => ResponseTemplate::new(404),
            },
            ("HEAD", false) => match state.objects.get(&key) {
                Some(object) => with_object_headers(
                    ResponseTemplate::new(200)
                        .insert_header("content-length", object.body.len().to_string()),
                    object,
                ),
                None => ResponseTemplate::new(404),
            },
            ("PUT", false) => Self::put(&mut state, key, request),
            ("DELETE", false) => match state.objects.remove(&key) {
                Some(_) => ResponseTemplate::new(204),
                None => ResponseTemplate::new(404),
            },
            _ => ResponseTemplate::new(405),
        }
    }
}
