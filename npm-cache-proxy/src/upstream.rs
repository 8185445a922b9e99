//! # Upstream Registry Client
//!
//! All traffic to the upstream registry goes through [`UpstreamClient::fetch`].
//! GET requests are answered from the on-disk [`CacheStore`] according to the
//! configured [`CacheMode`]; successful network responses are teed into the
//! store while they stream to the caller.
//!
//! | mode             | cached & fresh | cached & stale      | not cached   |
//! |------------------|----------------|---------------------|--------------|
//! | `default`        | serve          | revalidate          | network      |
//! | `no-cache`       | revalidate     | revalidate          | network      |
//! | `force-cache`    | serve          | serve               | network      |
//! | `only-if-cached` | serve          | serve               | `NotCached`  |

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH,
    IF_MODIFIED_SINCE, IF_NONE_MATCH,
};
use reqwest::{Client, Method, StatusCode};
use std::collections::BTreeMap;
use std::io;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{CacheMode, UpstreamSettings};
use crate::error::{AppError, AppResult};
use crate::store::{request_key, CacheStore, CacheWriter, EntryMetadata};

/// Present on every response served from the disk cache; holds the
/// percent-encoded cache directory.
pub const LOCAL_CACHE_HEADER: &str = "x-local-cache";
pub const LOCAL_CACHE_KEY_HEADER: &str = "x-local-cache-key";
pub const LOCAL_CACHE_STATUS_HEADER: &str = "x-local-cache-status";
pub const LOCAL_CACHE_TIME_HEADER: &str = "x-local-cache-time";

/// Client headers that never travel upstream.
const DROPPED_REQUEST_HEADERS: [&str; 4] = ["host", "connection", "content-length", "accept-encoding"];

/// Response headers that describe the upstream connection, not the body.
pub const HOP_HEADERS: [&str; 4] = [
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "connection",
];

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// A request bound for the upstream registry (or a tarball host).
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<reqwest::Body>,
    /// SRI string the response body must match before it is cached
    pub integrity: Option<String>,
}

impl UpstreamRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            integrity: None,
        }
    }

    /// Add headers, replacing any already set under the same name.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_body(mut self, body: reqwest::Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_integrity(mut self, integrity: Option<String>) -> Self {
        self.integrity = integrity;
        self
    }
}

/// Status, headers and a streaming body, from the network or the cache.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub from_cache: bool,
    body: BodyStream,
}

impl UpstreamResponse {
    pub fn into_body(self) -> BodyStream {
        self.body
    }

    /// Drain the body into memory.
    pub async fn bytes(self) -> AppResult<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(chunks.concat().into())
    }

    pub async fn text(self) -> AppResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// HTTP client for the upstream registry with a disk cache in front.
pub struct UpstreamClient {
    client: Client,
    settings: UpstreamSettings,
    registry_host: Option<String>,
    store: CacheStore,
    mode: CacheMode,
}

impl UpstreamClient {
    /// Build the client from upstream settings.
    ///
    /// # Errors
    ///
    /// Fails on an unusable proxy URL, an unreadable CA bundle, or when the
    /// TLS backend cannot be initialised.
    pub fn new(settings: UpstreamSettings, store: CacheStore, mode: CacheMode) -> AppResult<Self> {
        let mut builder = Client::builder()
            // idle limits only, so long tarball bodies are never cut off
            .connect_timeout(settings.timeout())
            .read_timeout(settings.timeout())
            .user_agent(settings.user_agent.clone())
            .danger_accept_invalid_certs(!settings.strict_ssl);

        if let Some(max) = settings.max_sockets {
            builder = builder.pool_max_idle_per_host(max);
        }
        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| AppError::BadRequest(format!("Invalid upstream proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(ca_file) = &settings.ca_file {
            let pem = std::fs::read(ca_file)?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
                AppError::BadRequest(format!("Invalid CA bundle {}: {e}", ca_file.display()))
            })?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let client = builder
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {e}")))?;

        let registry_host = Url::parse(&settings.registry)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        Ok(Self {
            client,
            settings,
            registry_host,
            store,
            mode,
        })
    }

    pub fn registry_origin(&self) -> &str {
        self.settings.registry_origin()
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Send a request, consulting the cache for GETs.
    pub async fn fetch(&self, req: UpstreamRequest) -> AppResult<UpstreamResponse> {
        if req.method != Method::GET || req.body.is_some() {
            if self.mode == CacheMode::OnlyIfCached {
                return Err(AppError::NotCached(format!("{} {}", req.method, req.url)));
            }
            let response = self.send(req, HeaderMap::new()).await?;
            return Ok(network_response(response));
        }

        let key = request_key(&req.url);
        let cached = self.store.get(&key).await?;

        match (self.mode, cached) {
            (CacheMode::OnlyIfCached, Some(meta)) | (CacheMode::ForceCache, Some(meta)) => {
                self.serve_cached(meta, "hit").await
            }
            (CacheMode::OnlyIfCached, None) => Err(AppError::NotCached(req.url)),
            (CacheMode::Default, Some(meta)) if is_fresh(&meta) => {
                self.serve_cached(meta, "hit").await
            }
            (CacheMode::Default, Some(meta)) | (CacheMode::NoCache, Some(meta)) => {
                self.revalidate(req, key, meta).await
            }
            (_, None) => self.fetch_and_store(req, key).await,
        }
    }

    async fn fetch_and_store(&self, req: UpstreamRequest, key: String) -> AppResult<UpstreamResponse> {
        let url = req.url.clone();
        let integrity = req.integrity.clone();
        let response = self.send(req, HeaderMap::new()).await?;
        self.store_response(response, key, url, integrity).await
    }

    async fn revalidate(
        &self,
        req: UpstreamRequest,
        key: String,
        meta: EntryMetadata,
    ) -> AppResult<UpstreamResponse> {
        let mut conditional = HeaderMap::new();
        if let Some(etag) = meta.header("etag").and_then(|v| HeaderValue::from_str(v).ok()) {
            conditional.insert(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = meta
            .header("last-modified")
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            conditional.insert(IF_MODIFIED_SINCE, modified);
        }

        let url = req.url.clone();
        let integrity = req.integrity.clone();
        let response = match self.send(req, conditional).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Upstream unreachable, serving stale cache entry");
                return self.serve_cached(meta, "stale").await;
            }
        };

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(url = %url, "Cache entry revalidated");
            let refreshed = self
                .store
                .touch(&key, storable_headers(response.headers()))
                .await?
                .unwrap_or(meta);
            return self.serve_cached(refreshed, "revalidated").await;
        }

        self.store_response(response, key, url, integrity).await
    }

    async fn store_response(
        &self,
        response: reqwest::Response,
        key: String,
        url: String,
        integrity: Option<String>,
    ) -> AppResult<UpstreamResponse> {
        if response.status() != StatusCode::OK || no_store(response.headers()) {
            return Ok(network_response(response));
        }

        let writer = self
            .store
            .writer(
                &key,
                &url,
                response.status().as_u16(),
                storable_headers(response.headers()),
                integrity.as_deref(),
            )
            .await;

        match writer {
            Ok(writer) => {
                let status = response.status();
                let headers = response.headers().clone();
                let upstream = response.bytes_stream().map_err(io::Error::other).boxed();
                Ok(UpstreamResponse {
                    status,
                    headers,
                    from_cache: false,
                    body: tee(upstream, writer),
                })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Could not open cache entry, streaming uncached");
                Ok(network_response(response))
            }
        }
    }

    async fn serve_cached(&self, meta: EntryMetadata, status_label: &'static str) -> AppResult<UpstreamResponse> {
        let Some((meta, body)) = self.store.open_stream(&meta.key).await? else {
            return Err(AppError::NotCached(meta.url));
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &meta.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(meta.size));
        let cache_dir = encode_component(&self.store.root().to_string_lossy());
        for (name, value) in [
            (LOCAL_CACHE_HEADER, cache_dir),
            (LOCAL_CACHE_KEY_HEADER, encode_component(&meta.key)),
            (LOCAL_CACHE_STATUS_HEADER, status_label.to_string()),
            (LOCAL_CACHE_TIME_HEADER, meta.stored_at.to_rfc2822()),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }

        debug!(key = %meta.key, status = status_label, "Serving from disk cache");
        Ok(UpstreamResponse {
            status: StatusCode::from_u16(meta.status).unwrap_or(StatusCode::OK),
            headers,
            from_cache: true,
            body: body.boxed(),
        })
    }

    async fn send(&self, req: UpstreamRequest, conditional: HeaderMap) -> AppResult<reqwest::Response> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.settings.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        for (name, value) in req.headers.iter() {
            if DROPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            // the cache owns conditional requests for cacheable GETs
            if req.method == Method::GET
                && req.body.is_none()
                && (name == IF_NONE_MATCH || name == IF_MODIFIED_SINCE)
            {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        headers.extend(conditional);
        if let Some(auth) = self.authorization_for(&req.url) {
            headers.insert(AUTHORIZATION, auth);
        }

        debug!(method = %req.method, url = %req.url, "Upstream request");
        let mut builder = self.client.request(req.method.clone(), &req.url).headers(headers);
        if let Some(body) = req.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        info!(method = %req.method, url = %req.url, status = %response.status(), "Upstream response");
        Ok(response)
    }

    /// Configured credentials for `url`. Only the registry host receives them
    /// unless `always_auth` is set.
    fn authorization_for(&self, url: &str) -> Option<HeaderValue> {
        let auth = &self.settings.auth;
        let host = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));
        if !auth.always_auth && (host.is_none() || host != self.registry_host) {
            return None;
        }

        let value = if let Some(token) = &auth.token {
            format!("Bearer {token}")
        } else if let (Some(user), Some(pass)) = (&auth.username, &auth.password) {
            format!("Basic {}", general_purpose::STANDARD.encode(format!("{user}:{pass}")))
        } else if let Some(legacy) = &auth.auth {
            format!("Basic {legacy}")
        } else {
            return None;
        };

        let mut value = HeaderValue::from_str(&value).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

fn network_response(response: reqwest::Response) -> UpstreamResponse {
    let status = response.status();
    let headers = response.headers().clone();
    UpstreamResponse {
        status,
        headers,
        from_cache: false,
        body: response.bytes_stream().map_err(io::Error::other).boxed(),
    }
}

/// Forward upstream chunks while writing them to `writer`. The entry is
/// committed when the upstream body ends; an upstream error or a dropped
/// stream discards it.
fn tee(upstream: BodyStream, writer: CacheWriter) -> BodyStream {
    stream::unfold(Some((upstream, Some(writer))), |state| async move {
        let (mut upstream, mut writer) = state?;
        match upstream.next().await {
            Some(Ok(chunk)) => {
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.write(&chunk).await {
                        warn!(error = %e, "Cache write failed, continuing uncached");
                        writer = None;
                    }
                }
                Some((Ok(chunk), Some((upstream, writer))))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => {
                if let Some(w) = writer {
                    match w.commit().await {
                        Ok(_) => {}
                        Err(e @ AppError::IntegrityMismatch { .. }) => {
                            error!(error = %e, "Discarding cache entry")
                        }
                        Err(e) => warn!(error = %e, "Failed to commit cache entry"),
                    }
                }
                None
            }
        }
    })
    .boxed()
}

/// Whether a stored response can be served without revalidation.
pub fn is_fresh(meta: &EntryMetadata) -> bool {
    let Some(max_age) = meta.header("cache-control").and_then(max_age) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(meta.stored_at);
    age < chrono::Duration::seconds(max_age)
}

fn max_age(cache_control: &str) -> Option<i64> {
    let mut max_age = None;
    for directive in cache_control.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-cache" {
            return None;
        }
        if let Some(value) = lower.strip_prefix("max-age=") {
            max_age = value.trim_matches('"').parse().ok();
        }
    }
    max_age
}

fn no_store(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-store")))
}

/// Response headers worth keeping with a cache entry.
fn storable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers.iter() {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Remove connection-level headers before relaying a response.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use chrono::Duration;
    use tempfile::TempDir;

    fn meta(cache_control: Option<&str>, age_secs: i64) -> EntryMetadata {
        let mut headers = BTreeMap::new();
        if let Some(cc) = cache_control {
            headers.insert("cache-control".to_string(), cc.to_string());
        }
        EntryMetadata {
            key: request_key("http://r/foo"),
            url: "http://r/foo".into(),
            status: 200,
            headers,
            size: 2,
            integrity: String::new(),
            stored_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    async fn client(auth: AuthConfig) -> (TempDir, UpstreamClient) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let settings = UpstreamSettings {
            registry: "https://registry.example/".into(),
            auth,
            ..UpstreamSettings::default()
        };
        (dir, UpstreamClient::new(settings, store, CacheMode::Default).unwrap())
    }

    #[test]
    fn freshness_follows_max_age() {
        assert!(is_fresh(&meta(Some("public, max-age=300"), 10)));
        assert!(!is_fresh(&meta(Some("public, max-age=300"), 301)));
        assert!(!is_fresh(&meta(Some("no-cache, max-age=300"), 0)));
        assert!(!is_fresh(&meta(None, 0)));
    }

    #[test]
    fn no_store_responses_are_detected() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
        assert!(no_store(&headers));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        assert!(!no_store(&headers));
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        for name in HOP_HEADERS {
            headers.insert(name, HeaderValue::from_static("x"));
        }
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(storable_headers(&headers).contains_key("etag"));
    }

    #[tokio::test]
    async fn token_goes_only_to_the_registry_host() {
        let (_dir, client) = client(AuthConfig {
            token: Some("secret".into()),
            ..AuthConfig::default()
        })
        .await;

        let auth = client
            .authorization_for("https://registry.example/foo")
            .unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer secret");
        assert!(auth.is_sensitive());
        assert!(client
            .authorization_for("https://cdn.example/foo/-/foo-1.0.0.tgz")
            .is_none());
    }

    #[tokio::test]
    async fn basic_credentials_and_always_auth() {
        let (_dir, client) = client(AuthConfig {
            username: Some("user".into()),
            password: Some("pass".into()),
            always_auth: true,
            ..AuthConfig::default()
        })
        .await;
        assert_eq!(
            client
                .authorization_for("https://cdn.example/x.tgz")
                .unwrap()
                .to_str()
                .unwrap(),
            "Basic dXNlcjpwYXNz"
        );

        let (_dir, legacy) = client_with_legacy().await;
        assert_eq!(
            legacy
                .authorization_for("https://registry.example/x")
                .unwrap()
                .to_str()
                .unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    async fn client_with_legacy() -> (TempDir, UpstreamClient) {
        client(AuthConfig {
            auth: Some("dXNlcjpwYXNz".into()),
            ..AuthConfig::default()
        })
        .await
    }

    #[tokio::test]
    async fn offline_mode_without_entry_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let client =
            UpstreamClient::new(UpstreamSettings::default(), store, CacheMode::OnlyIfCached).unwrap();

        let err = client
            .fetch(UpstreamRequest::new(Method::GET, "http://127.0.0.1:9/foo"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::NotCached(_)));
    }

    #[tokio::test]
    async fn offline_mode_serves_cached_entries() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let url = "http://127.0.0.1:9/foo";
        store
            .insert(
                &request_key(url),
                url,
                200,
                BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
                b"{}",
            )
            .await
            .unwrap();
        let client =
            UpstreamClient::new(UpstreamSettings::default(), store, CacheMode::OnlyIfCached).unwrap();

        let response = client
            .fetch(UpstreamRequest::new(Method::GET, url))
            .await
            .unwrap();
        assert!(response.from_cache);
        assert!(response.headers.contains_key(LOCAL_CACHE_HEADER));
        assert_eq!(
            response.headers[LOCAL_CACHE_KEY_HEADER].to_str().unwrap(),
            encode_component(&request_key(url))
        );
        assert_eq!(response.headers[CONTENT_LENGTH], "2");
        assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn slow_bodies_outlive_the_idle_timeout() {
        let app = axum::Router::new().route(
            "/slow/-/slow-1.0.0.tgz",
            axum::routing::get(|| async {
                let chunks = stream::unfold(0u8, |sent| async move {
                    if sent == 4 {
                        return None;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
                    Some((Ok::<_, io::Error>(Bytes::from(vec![b'x'; 1024])), sent + 1))
                });
                axum::body::Body::from_stream(chunks)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let settings = UpstreamSettings {
            registry: format!("http://{addr}"),
            timeout_secs: 1,
            ..UpstreamSettings::default()
        };
        let client = UpstreamClient::new(settings, store, CacheMode::Default).unwrap();

        let response = client
            .fetch(UpstreamRequest::new(
                Method::GET,
                format!("http://{addr}/slow/-/slow-1.0.0.tgz"),
            ))
            .await
            .unwrap();
        assert_eq!(response.bytes().await.unwrap().len(), 4 * 1024);
    }
}
