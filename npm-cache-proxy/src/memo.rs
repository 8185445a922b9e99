//! # Packument Memo
//!
//! In-process cache in front of the upstream client for packument fetches.
//! The shared default is a [`moka`] cache weighted by each document's
//! content length, evicting least-recently-used entries once the weight
//! budget is exceeded and expiring entries a fixed time after insertion.
//!
//! Callers can bring their own store through [`PackumentStore`] or wrap a
//! plain map with [`MapStore`]. Each wrapper is an owned value, so
//! concurrent callers never share adapter state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_LENGTH};
use reqwest::Method;
use tracing::{debug, warn};

use crate::classify::escape_name;
use crate::config::MemoConfig;
use crate::packument::Packument;
use crate::upstream::{UpstreamClient, UpstreamRequest, LOCAL_CACHE_HEADER};
use crate::{AppError, AppResult};

/// Abbreviated install document, falling back to the full one.
pub const CORGI_DOC: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";
pub const JSON_DOC: &str = "application/json";

/// Anything that can hold packuments by URI.
pub trait PackumentStore: Send + Sync {
    fn get(&self, uri: &str) -> Option<Arc<Packument>>;
    fn set(&self, uri: &str, packument: Arc<Packument>);
}

/// Shared, bounded memo used when a caller does not supply its own store.
#[derive(Clone)]
pub struct PackumentMemo {
    cache: Cache<String, Arc<Packument>>,
}

impl PackumentMemo {
    pub fn new(config: &MemoConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_weight_bytes)
            .weigher(|_uri: &String, packument: &Arc<Packument>| {
                packument.content_length.try_into().unwrap_or(u32::MAX)
            })
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .eviction_policy(EvictionPolicy::lru())
            .build();

        debug!(
            max_weight = config.max_weight_bytes,
            ttl_secs = config.ttl_secs,
            "Packument memo created"
        );

        Self { cache }
    }

    /// Total weight currently held, after pending maintenance runs.
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

impl PackumentStore for PackumentMemo {
    fn get(&self, uri: &str) -> Option<Arc<Packument>> {
        self.cache.get(uri)
    }

    fn set(&self, uri: &str, packument: Arc<Packument>) {
        self.cache.insert(uri.to_string(), packument);
    }
}

/// Plain key-value containers that [`MapStore`] can adapt.
pub trait BackingMap: Send + Sync {
    fn lookup(&self, uri: &str) -> Option<Arc<Packument>>;
    fn store(&mut self, uri: String, packument: Arc<Packument>);
}

impl BackingMap for HashMap<String, Arc<Packument>> {
    fn lookup(&self, uri: &str) -> Option<Arc<Packument>> {
        self.get(uri).cloned()
    }

    fn store(&mut self, uri: String, packument: Arc<Packument>) {
        self.insert(uri, packument);
    }
}

impl BackingMap for BTreeMap<String, Arc<Packument>> {
    fn lookup(&self, uri: &str) -> Option<Arc<Packument>> {
        self.get(uri).cloned()
    }

    fn store(&mut self, uri: String, packument: Arc<Packument>) {
        self.insert(uri, packument);
    }
}

/// Exposes a plain map as a [`PackumentStore`]. Unbounded; the map's owner
/// decides when to drop it.
#[derive(Default)]
pub struct MapStore<M> {
    inner: RwLock<M>,
}

impl<M: BackingMap> MapStore<M> {
    pub fn new(map: M) -> Self {
        Self {
            inner: RwLock::new(map),
        }
    }

    pub fn into_inner(self) -> M {
        self.inner.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<M: BackingMap> PackumentStore for MapStore<M> {
    fn get(&self, uri: &str) -> Option<Arc<Packument>> {
        let map = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.lookup(uri)
    }

    fn set(&self, uri: &str, packument: Arc<Packument>) {
        let mut map = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.store(uri.to_string(), packument);
    }
}

/// Which store a packument fetch consults and updates.
#[derive(Clone, Copy, Default)]
pub enum Memoize<'a> {
    /// The process-wide [`PackumentMemo`]
    #[default]
    Shared,
    /// A caller-supplied store
    With(&'a dyn PackumentStore),
    /// No memoization at all
    Disabled,
}

/// Per-call options for [`fetch_packument`].
#[derive(Clone, Copy, Default)]
pub struct PackumentOptions<'a> {
    /// Skip the memo lookup; the fetched document still updates it
    pub prefer_online: bool,
    /// Ask for the full document instead of the abbreviated one
    pub full_metadata: bool,
    pub memoize: Memoize<'a>,
}

fn pick_store<'a>(
    shared: &'a PackumentMemo,
    memoize: Memoize<'a>,
) -> Option<&'a dyn PackumentStore> {
    match memoize {
        Memoize::Shared => Some(shared as &dyn PackumentStore),
        Memoize::With(store) => Some(store),
        Memoize::Disabled => None,
    }
}

/// URI of a package's packument on the registry.
pub fn packument_uri(registry_origin: &str, name: &str) -> String {
    format!("{}/{}", registry_origin.trim_end_matches('/'), escape_name(name))
}

/// Fetch a packument, consulting the memo first unless told otherwise.
pub async fn fetch_packument(
    client: &UpstreamClient,
    shared: &PackumentMemo,
    name: &str,
    options: PackumentOptions<'_>,
) -> AppResult<Arc<Packument>> {
    let uri = packument_uri(client.registry_origin(), name);
    let store = pick_store(shared, options.memoize);

    if !options.prefer_online {
        if let Some(hit) = store.and_then(|s| s.get(&uri)) {
            debug!(package = %name, "Packument memo hit");
            return Ok(hit);
        }
    }

    let mut headers = HeaderMap::new();
    let accept = if options.full_metadata { JSON_DOC } else { CORGI_DOC };
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    headers.insert("pacote-req-type", HeaderValue::from_static("packument"));
    if let Ok(id) = HeaderValue::from_str(&format!("registry:{name}")) {
        headers.insert("pacote-pkg-id", id);
    }

    let response = client
        .fetch(UpstreamRequest::new(Method::GET, uri.clone()).with_headers(headers))
        .await?;

    if !response.status.is_success() {
        let status = response.status;
        let detail = response.text().await.unwrap_or_default();
        warn!(package = %name, status = %status, "Upstream refused packument");
        return Err(AppError::Upstream {
            status: Some(status.as_u16()),
            message: format!("GET {uri} returned {status}: {detail}"),
        });
    }

    let cached = response.headers.contains_key(LOCAL_CACHE_HEADER);
    let declared_length = response
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.bytes().await?;

    let mut packument = Packument::from_slice(&body).map_err(|e| AppError::Upstream {
        status: None,
        message: format!("Invalid packument for {name}: {e}"),
    })?;
    packument.cached = cached;
    if let Some(length) = declared_length {
        packument.content_length = length;
    }

    let packument = Arc::new(packument);
    if let Some(store) = store {
        store.set(&uri, packument.clone());
    }
    Ok(packument)
}
