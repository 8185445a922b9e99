//! Packument data model and the tarball URL rewrite.
//!
//! Only the fields the proxy reasons about are typed. Everything else the
//! registry sends is kept in flattened maps so that re-serialising a
//! packument preserves it.

use base64::{engine::general_purpose, Engine as _};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Package-level document listing every published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packument {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: IndexMap<String, VersionManifest>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Served from the proxy's disk cache rather than the network
    #[serde(skip)]
    pub cached: bool,
    /// Size of the upstream document; weight in the packument memo
    #[serde(skip)]
    pub content_length: u64,
}

/// Metadata for a single published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionManifest {
    #[serde(default)]
    pub dist: Dist,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Download location and digests of a version's tarball.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Packument {
    /// Parse an upstream document, recording its size for memo weighting.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        let mut packument: Packument = serde_json::from_slice(body)?;
        packument.content_length = body.len() as u64;
        Ok(packument)
    }

    /// Version `latest` points at, if it names a published version.
    pub fn latest(&self) -> Option<&str> {
        self.dist_tags
            .get("latest")
            .map(String::as_str)
            .filter(|v| self.versions.contains_key(*v))
    }

    /// Resolve an explicit version, or `latest` when none is given.
    pub fn resolve(&self, version: Option<&str>) -> Option<(&str, &VersionManifest)> {
        let version = match version {
            Some(v) => v,
            None => self.latest()?,
        };
        self.versions
            .get_key_value(version)
            .map(|(k, manifest)| (k.as_str(), manifest))
    }

    /// Replace every occurrence of `upstream_origin` in each version's
    /// `dist.tarball` with `proxy_origin`. No other field is touched.
    pub fn rewrite_tarball_origin(&mut self, upstream_origin: &str, proxy_origin: &str) {
        if upstream_origin.is_empty() {
            return;
        }
        for manifest in self.versions.values_mut() {
            let tarball = &mut manifest.dist.tarball;
            if tarball.contains(upstream_origin) {
                *tarball = tarball.replace(upstream_origin, proxy_origin);
            }
        }
    }

    /// Give every `shasum`-only version an `integrity` digest.
    pub fn fill_integrity(&mut self) {
        for (version, manifest) in self.versions.iter_mut() {
            if let Err(shasum) = manifest.dist.fill_integrity() {
                warn!(package = %self.name, version = %version, shasum = %shasum, "Ignoring malformed shasum");
            }
        }
    }

    /// Shape sent to npm clients: upstream origin replaced and integrity
    /// filled in. Bookkeeping fields never serialize.
    pub fn for_client(mut self, upstream_origin: &str, proxy_origin: &str) -> Self {
        self.rewrite_tarball_origin(upstream_origin, proxy_origin);
        self.fill_integrity();
        self
    }
}

/// Functional form of [`Packument::rewrite_tarball_origin`].
pub fn rewrite(packument: &Packument, upstream_origin: &str, proxy_origin: &str) -> Packument {
    let mut out = packument.clone();
    out.rewrite_tarball_origin(upstream_origin, proxy_origin);
    out
}

impl Dist {
    /// Digest the proxy should verify the tarball against.
    pub fn expected_integrity(&self) -> Option<String> {
        self.integrity
            .clone()
            .or_else(|| self.shasum.as_deref().and_then(shasum_to_integrity))
    }

    /// Derive `integrity` from a legacy `shasum`. Returns the offending
    /// shasum when it is not 40 hex digits.
    fn fill_integrity(&mut self) -> Result<(), String> {
        if self.integrity.is_some() {
            return Ok(());
        }
        let Some(shasum) = self.shasum.as_deref() else {
            return Ok(());
        };
        match shasum_to_integrity(shasum) {
            Some(integrity) => {
                self.integrity = Some(integrity);
                Ok(())
            }
            None => Err(shasum.to_string()),
        }
    }
}

/// Convert a SHA-1 hex digest into a subresource-integrity string.
pub fn shasum_to_integrity(shasum: &str) -> Option<String> {
    let raw = hex::decode(shasum.trim()).ok()?;
    if raw.len() != 20 {
        return None;
    }
    Some(format!("sha1-{}", general_purpose::STANDARD.encode(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const UPSTREAM: &str = "http://registry.example";
    const PROXY: &str = "http://localhost:22000";

    fn foo() -> Packument {
        let doc = json!({
            "name": "foo",
            "dist-tags": { "latest": "1.0.0" },
            "versions": {
                "1.0.0": { "dist": { "tarball": "http://registry.example/foo/-/foo-1.0.0.tgz" } }
            }
        });
        Packument::from_slice(doc.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn rewrites_tarball_origin_and_nothing_else() {
        let original = foo();
        let rewritten = rewrite(&original, UPSTREAM, PROXY);

        assert_eq!(
            rewritten.versions["1.0.0"].dist.tarball,
            "http://localhost:22000/foo/-/foo-1.0.0.tgz"
        );
        let out = serde_json::to_value(&rewritten).unwrap();
        assert_eq!(
            out,
            json!({
                "name": "foo",
                "dist-tags": { "latest": "1.0.0" },
                "versions": {
                    "1.0.0": { "dist": { "tarball": "http://localhost:22000/foo/-/foo-1.0.0.tgz" } }
                }
            })
        );
    }

    #[test]
    fn rewrite_is_global_and_keeps_path_and_query() {
        let mut p = foo();
        p.versions["1.0.0"].dist.tarball =
            "http://registry.example/foo/-/foo-1.0.0.tgz?mirror=http://registry.example".into();
        p.rewrite_tarball_origin(UPSTREAM, PROXY);
        assert_eq!(
            p.versions["1.0.0"].dist.tarball,
            "http://localhost:22000/foo/-/foo-1.0.0.tgz?mirror=http://localhost:22000"
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite(&foo(), UPSTREAM, PROXY);
        let twice = rewrite(&once, UPSTREAM, PROXY);
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let doc = json!({
            "name": "bar",
            "dist-tags": {},
            "time": { "created": "2020-01-01T00:00:00.000Z" },
            "versions": {
                "0.1.0": {
                    "name": "bar",
                    "dependencies": { "foo": "^1.0.0" },
                    "dist": { "tarball": "http://registry.example/bar/-/bar-0.1.0.tgz", "fileCount": 3 }
                }
            }
        });
        let p = Packument::from_slice(doc.to_string().as_bytes()).unwrap();
        assert_eq!(serde_json::to_value(&p).unwrap(), doc);
    }

    #[test]
    fn bookkeeping_fields_are_never_serialized() {
        let mut p = foo();
        p.cached = true;
        let out = serde_json::to_value(&p).unwrap();
        assert!(out.get("_cached").is_none());
        assert!(out.get("_contentLength").is_none());
        assert!(p.content_length > 0);
    }

    #[test]
    fn shasum_only_dist_gains_integrity() {
        let mut p = foo();
        p.versions["1.0.0"].dist.shasum = Some("2ef7bde608ce5404e97d5f042f95f89f1c232871".into());
        let client = p.for_client(UPSTREAM, PROXY);
        assert_eq!(
            client.versions["1.0.0"].dist.integrity.as_deref(),
            Some("sha1-Lve95gjOVATpfV8EL5X4nxwjKHE=")
        );
    }

    #[test]
    fn existing_integrity_is_kept_and_bad_shasum_ignored() {
        let mut dist = Dist {
            integrity: Some("sha512-abc".into()),
            shasum: Some("2ef7bde608ce5404e97d5f042f95f89f1c232871".into()),
            ..Dist::default()
        };
        assert!(dist.fill_integrity().is_ok());
        assert_eq!(dist.integrity.as_deref(), Some("sha512-abc"));

        let mut bad = Dist {
            shasum: Some("not-hex".into()),
            ..Dist::default()
        };
        assert!(bad.fill_integrity().is_err());
        assert!(bad.integrity.is_none());
    }

    #[test]
    fn latest_must_name_a_published_version() {
        let mut p = foo();
        assert_eq!(p.resolve(None).map(|(v, _)| v), Some("1.0.0"));
        p.dist_tags.insert("latest".into(), "9.9.9".into());
        assert!(p.latest().is_none());
        assert!(p.resolve(None).is_none());
        assert!(p.resolve(Some("1.0.0")).is_some());
    }
}
