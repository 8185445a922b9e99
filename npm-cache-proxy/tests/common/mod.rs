//! Common test utilities and helpers
//!
//! Provides an in-process mock registry bound to an ephemeral port, fixture
//! tarballs, and a ready-made proxy state pointed at the mock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use flate2::{write::GzEncoder, Compression};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use npm_cache_proxy::config::{CacheMode, Config};
use npm_cache_proxy::hash_utils::{Algorithm, IntegrityHasher};
use npm_cache_proxy::AppState;

/// A request the mock registry received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fixed responses keyed by request path.
#[derive(Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

#[derive(Default)]
struct MockInner {
    routes: HashMap<String, MockResponse>,
    requests: Vec<Recorded>,
}

/// In-process stand-in for the upstream registry.
#[derive(Clone)]
pub struct MockRegistry {
    pub origin: String,
    inner: Arc<Mutex<MockInner>>,
}

impl MockRegistry {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let origin = format!("http://{}", listener.local_addr()?);
        let mock = Self {
            origin,
            inner: Arc::new(Mutex::new(MockInner::default())),
        };

        let app = Router::new()
            .fallback(respond)
            .layer(DefaultBodyLimit::disable())
            .with_state(mock.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(mock)
    }

    pub fn route(&self, path: &str, response: MockResponse) {
        self.inner
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), response);
    }

    pub fn json(&self, path: &str, body: &Value) {
        self.route(
            path,
            MockResponse {
                status: StatusCode::OK,
                headers: vec![
                    ("content-type", "application/json".to_string()),
                    ("cache-control", "public, max-age=300".to_string()),
                ],
                body: Bytes::from(body.to_string()),
            },
        );
    }

    pub fn tarball(&self, path: &str, bytes: &[u8]) {
        self.route(
            path,
            MockResponse {
                status: StatusCode::OK,
                headers: vec![
                    ("content-type", "application/octet-stream".to_string()),
                    ("cache-control", "public, max-age=300".to_string()),
                    ("etag", "\"tarball-v1\"".to_string()),
                ],
                body: Bytes::copy_from_slice(bytes),
            },
        );
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Number of requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    /// Publish a single-version packument for `name` whose tarball lives on
    /// this mock.
    pub fn publish(&self, name: &str, version: &str, tarball: &[u8], integrity: Option<String>) {
        let escaped = name.replace('/', "%2f");
        let file = name.rsplit('/').next().unwrap_or(name);
        let tarball_path = format!("/{name}/-/{file}-{version}.tgz");
        let integrity = integrity.unwrap_or_else(|| sha512_integrity(tarball));

        self.json(
            &format!("/{escaped}"),
            &json!({
                "name": name,
                "dist-tags": { "latest": version },
                "versions": {
                    version: {
                        "name": name,
                        "version": version,
                        "dist": {
                            "tarball": format!("{}{}", self.origin, tarball_path),
                            "integrity": integrity
                        }
                    }
                }
            }),
        );
        self.tarball(&tarball_path, tarball);
    }
}

async fn respond(
    State(mock): State<MockRegistry>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let mut inner = mock.inner.lock().unwrap();
    inner.requests.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        headers,
        body: body.clone(),
    });

    if method == Method::PUT || method == Method::POST {
        let echoed = json!({ "ok": true, "received": String::from_utf8_lossy(&body) });
        return (StatusCode::CREATED, axum::Json(echoed)).into_response();
    }

    match inner.routes.get(&path) {
        Some(found) => {
            let mut response = (found.status, found.body.clone()).into_response();
            for (name, value) in &found.headers {
                if let Ok(value) = value.parse() {
                    response.headers_mut().insert(*name, value);
                }
            }
            response
        }
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"error":"Not found"}"#,
        )
            .into_response(),
    }
}

/// SRI sha512 of `bytes`.
pub fn sha512_integrity(bytes: &[u8]) -> String {
    let mut hasher = IntegrityHasher::new(Algorithm::Sha512);
    hasher.update(bytes);
    hasher.finish().to_string()
}

/// Gzipped tarball with the given `(path, contents)` entries.
pub fn build_tarball(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, body.as_bytes())
            .expect("append tar entry");
    }
    let tar = builder.into_inner().expect("finish tar");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar).expect("gzip tar");
    encoder.finish().expect("finish gzip")
}

/// Tarball for a package with a readme and a manifest.
pub fn package_tarball(name: &str, version: &str, description: &str) -> Vec<u8> {
    let manifest = json!({ "name": name, "version": version, "description": description });
    build_tarball(&[
        (
            "package/README.md",
            format!("# {name}\n\nReadme for {name}.").as_str(),
        ),
        ("package/package.json", manifest.to_string().as_str()),
    ])
}

/// Proxy state with its own cache directory.
pub struct TestSetup {
    pub temp_dir: TempDir,
    pub state: Arc<AppState>,
}

pub async fn create_test_setup(registry: &str, mode: CacheMode) -> Result<TestSetup> {
    let temp_dir = TempDir::new()?;
    let mut config = Config::default();
    config.upstream.registry = registry.to_string();
    config.cache.dir = temp_dir.path().join("cache");
    config.cache.mode = mode;
    config.server.log_requests = false;

    let state = Arc::new(AppState::new(config).await?);
    Ok(TestSetup { temp_dir, state })
}
