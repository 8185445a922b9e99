//! Cache index scanner: turns the keys in the disk cache into a listing of
//! modules that have both a packument and at least one tarball cached.

use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::classify::{unescape_name, NAME_PATTERN, VERSION_PATTERN};
use crate::error::{AppError, AppResult};
use crate::store::{CacheStore, KEY_PREFIX};

/// One module as seen in the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleListing {
    pub name: String,
    /// Versions with a cached tarball, in semver order
    pub versions: Vec<String>,
    pub has_tarball_cache: bool,
    pub has_packument_cache: bool,
    pub packument_key: Option<String>,
    /// First tarball key seen for this module
    pub tarball_key: Option<String>,
    pub tarballs: BTreeMap<String, String>,
}

impl ModuleListing {
    pub fn is_listable(&self) -> bool {
        self.has_tarball_cache && self.has_packument_cache
    }

    /// Cached tarball key for `version`.
    pub fn tarball_for(&self, version: &str) -> Option<&str> {
        self.tarballs.get(version).map(String::as_str)
    }
}

/// Compiled cache-key patterns.
#[derive(Debug)]
pub struct KeyPatterns {
    tarball: Regex,
    packument: Regex,
}

impl KeyPatterns {
    pub fn new() -> AppResult<Self> {
        let prefix = regex::escape(KEY_PREFIX);
        let tarball = format!(
            r"^{prefix}(?P<url>https?://[^/]+/(?P<name>{NAME_PATTERN})/-/.*?-(?P<version>{VERSION_PATTERN})\.tgz)$"
        );
        let packument = format!(r"^{prefix}(?P<url>https?://[^/]+/(?P<name>{NAME_PATTERN}))$");

        let compile = |source: &str| {
            Regex::new(source)
                .map_err(|e| AppError::InternalError(format!("Invalid key pattern {source}: {e}")))
        };
        Ok(Self {
            tarball: compile(&tarball)?,
            packument: compile(&packument)?,
        })
    }

    /// Build listings from raw cache keys, keeping only listable modules.
    pub fn from_keys<'a, I>(&self, keys: I) -> Vec<ModuleListing>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut modules: HashMap<String, ModuleListing> = HashMap::new();

        for key in keys {
            if let Some(caps) = self.tarball.captures(key) {
                let name = unescape_name(&caps["name"]);
                let listing = upsert(&mut modules, &name);
                listing.has_tarball_cache = true;
                if listing.tarball_key.is_none() {
                    listing.tarball_key = Some(key.to_string());
                }
                listing
                    .tarballs
                    .entry(caps["version"].to_string())
                    .or_insert_with(|| key.to_string());
            } else if let Some(caps) = self.packument.captures(key) {
                let name = unescape_name(&caps["name"]);
                let listing = upsert(&mut modules, &name);
                listing.has_packument_cache = true;
                listing.packument_key = Some(key.to_string());
            }
        }

        let mut listable: Vec<ModuleListing> = modules
            .into_values()
            .filter(ModuleListing::is_listable)
            .map(|mut m| {
                let mut versions: Vec<String> = m.tarballs.keys().cloned().collect();
                versions.sort_by(|a, b| compare_versions(a, b));
                m.versions = versions;
                m
            })
            .collect();
        listable.sort_by(|a, b| locale_compare(&a.name, &b.name));
        listable
    }

    /// Scan every entry in the store.
    pub async fn scan(&self, store: &CacheStore) -> AppResult<Vec<ModuleListing>> {
        let entries = store.list().await?;
        Ok(self.from_keys(entries.iter().map(|e| e.key.as_str())))
    }
}

fn upsert<'a>(modules: &'a mut HashMap<String, ModuleListing>, name: &str) -> &'a mut ModuleListing {
    modules
        .entry(name.to_string())
        .or_insert_with(|| ModuleListing {
            name: name.to_string(),
            ..ModuleListing::default()
        })
}

/// Case-folded comparison. Names that differ only in case put lowercase
/// first, as ICU collation does.
pub fn locale_compare(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| b.cmp(a))
}

/// Semver order where both parse, plain string order otherwise.
fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}
