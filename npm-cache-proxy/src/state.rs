//! # Application State
//!
//! Shared resources handed to every handler on both listeners. Built once at
//! startup from a [`Config`] and wrapped in an `Arc`.

use std::sync::Arc;

use crate::classify::Classifier;
use crate::config::Config;
use crate::error::AppResult;
use crate::index::KeyPatterns;
use crate::memo::PackumentMemo;
use crate::store::CacheStore;
use crate::upstream::UpstreamClient;

pub struct AppState {
    pub config: Arc<Config>,
    pub classifier: Classifier,
    pub key_patterns: KeyPatterns,
    /// Upstream client; also owns the disk cache
    pub upstream: UpstreamClient,
    /// Process-wide packument memo
    pub memo: PackumentMemo,
    /// Origin written into rewritten tarball URLs
    pub public_origin: String,
}

impl AppState {
    /// Open the cache and build every shared component.
    pub async fn new(config: Config) -> AppResult<Self> {
        config.validate()?;
        let store = CacheStore::open(config.cache.dir.clone()).await?;
        let upstream = UpstreamClient::new(config.upstream.clone(), store, config.cache.mode)?;

        Ok(Self {
            classifier: Classifier::new()?,
            key_patterns: KeyPatterns::new()?,
            memo: PackumentMemo::new(&config.memo),
            public_origin: config.public_origin(),
            upstream,
            config: Arc::new(config),
        })
    }

    pub fn store(&self) -> &CacheStore {
        self.upstream.store()
    }
}
