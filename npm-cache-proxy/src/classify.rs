//! Registry request classification.
//!
//! Every request arriving at the registry listener is one of three shapes:
//! a tarball download, a packument (manifest) fetch, or something the proxy
//! does not understand and forwards untouched. The matchers are compiled once
//! and evaluated in order; the first match wins.

use regex::Regex;

use crate::{AppError, AppResult};

/// Package name grammar: `@scope/pkg` or a bare name without slashes.
///
/// The scope segment cannot contain a slash, so a scoped name can never
/// extend into the `/-/` tarball marker.
pub(crate) const NAME_PATTERN: &str = r"(?:@[^/?#]+/)?[^/?#]+";

/// `MAJOR.MINOR.PATCH` with an optional `-prerelease` suffix.
pub(crate) const VERSION_PATTERN: &str = r"\d+\.\d+\.\d+(?:-.*)?";

/// Outcome of classifying a request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/<name>/-/<anything>-<version>.tgz`
    Tarball { name: String, version: String },
    /// `/<name>`
    Manifest { name: String },
    /// Anything else; forwarded verbatim
    Passthrough,
}

#[derive(Debug, Clone, Copy)]
enum RouteKind {
    Tarball,
    Manifest,
}

#[derive(Debug)]
struct Matcher {
    kind: RouteKind,
    pattern: Regex,
}

/// Ordered set of compiled route matchers.
#[derive(Debug)]
pub struct Classifier {
    matchers: Vec<Matcher>,
}

impl Classifier {
    pub fn new() -> AppResult<Self> {
        let tarball = format!(r"^/(?P<name>{NAME_PATTERN})/-/.*?-(?P<version>{VERSION_PATTERN})\.tgz$");
        let manifest = format!(r"^/(?P<name>{NAME_PATTERN})$");

        let matchers = [(RouteKind::Tarball, tarball), (RouteKind::Manifest, manifest)]
            .into_iter()
            .map(|(kind, source)| {
                Regex::new(&source)
                    .map(|pattern| Matcher { kind, pattern })
                    .map_err(|e| {
                        AppError::InternalError(format!("Invalid route pattern {source}: {e}"))
                    })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self { matchers })
    }

    /// Classify a request target (path plus optional query).
    pub fn classify(&self, target: &str) -> Route {
        for matcher in &self.matchers {
            let Some(caps) = matcher.pattern.captures(target) else {
                continue;
            };
            let name = unescape_name(&caps["name"]);
            return match matcher.kind {
                RouteKind::Tarball => Route::Tarball {
                    name,
                    version: caps["version"].to_string(),
                },
                RouteKind::Manifest => Route::Manifest { name },
            };
        }
        Route::Passthrough
    }
}

/// npm clients request scoped packuments as `@scope%2fpkg`.
pub(crate) fn unescape_name(raw: &str) -> String {
    raw.replace("%2f", "/").replace("%2F", "/")
}

/// Inverse of [`unescape_name`], used when building packument URLs.
pub(crate) fn escape_name(name: &str) -> String {
    name.replace('/', "%2f")
}
