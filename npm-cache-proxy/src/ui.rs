//! Browsable index of the disk cache, served on the web listener.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::classify::unescape_name;
use crate::extract::{extract_cached, TarballMetadata};
use crate::index::ModuleListing;
use crate::packument::Packument;
use crate::{AppError, AppState};

#[derive(Template)]
#[template(path = "home.html")]
struct HomeTemplate {
    modules: Vec<HomeEntry>,
    version: String,
}

struct HomeEntry {
    name: String,
    versions: String,
    description: String,
}

#[derive(Template)]
#[template(path = "package.html")]
struct PackageTemplate {
    name: String,
    version: String,
    versions: Vec<String>,
    readme: String,
    manifest: String,
    from_archive: bool,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    status: u16,
    title: String,
    message: String,
}

/// [`AppError`] rendered as an HTML page.
pub struct HtmlError(pub AppError);

impl From<AppError> for HtmlError {
    fn from(err: AppError) -> Self {
        HtmlError(err)
    }
}

impl IntoResponse for HtmlError {
    fn into_response(self) -> Response {
        let status = self.0.error_code().http_status();
        if status.is_server_error() {
            error!(error = %self.0, "Web request failed");
        }
        error_page(status, &self.0.to_string())
    }
}

type HtmlResult<T> = Result<T, HtmlError>;

fn error_page(status: StatusCode, message: &str) -> Response {
    let template = ErrorTemplate {
        status: status.as_u16(),
        title: status.canonical_reason().unwrap_or("Error").to_string(),
        message: message.to_string(),
    };
    match template.render() {
        Ok(body) => (status, Html(body)).into_response(),
        Err(e) => {
            error!("Template render error: {}", e);
            (status, message.to_string()).into_response()
        }
    }
}

fn render<T: Template>(template: T) -> HtmlResult<Html<String>> {
    Ok(Html(template.render().map_err(|e| {
        error!("Template render error: {}", e);
        AppError::Template(e)
    })?))
}

/// Every listable module with its cached versions and description.
pub async fn home(State(state): State<Arc<AppState>>) -> HtmlResult<Html<String>> {
    let store = state.store();
    let listings = state.key_patterns.scan(store).await?;

    let extractions = listings.iter().map(|listing| async move {
        match listing.tarball_key.as_deref() {
            Some(key) => extract_cached(store, key).await,
            None => Ok(None),
        }
    });
    let results = join_all(extractions).await;

    let mut modules = Vec::with_capacity(listings.len());
    for (listing, result) in listings.iter().zip(results) {
        match result {
            Ok(Some(meta)) => modules.push(HomeEntry {
                name: listing.name.clone(),
                versions: listing.versions.join(", "),
                description: meta.description().unwrap_or_default().to_string(),
            }),
            Ok(None) => debug!(package = %listing.name, "Representative tarball vanished"),
            Err(e) => warn!(package = %listing.name, error = %e, "Skipping module with unreadable tarball"),
        }
    }

    render(HomeTemplate {
        modules,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `/package/<name>[/<version>]`; `<name>` may be scoped.
pub async fn package(
    Path(path): Path<String>,
    State(state): State<Arc<AppState>>,
) -> HtmlResult<Html<String>> {
    let (name, version) = split_package_path(&path)
        .ok_or_else(|| AppError::NotFound(format!("No package at /package/{path}")))?;

    let listings = state.key_patterns.scan(state.store()).await?;
    let listing = find_listing(&listings, &name)
        .ok_or_else(|| AppError::NotFound(format!("Package {name} is not cached")))?;

    let packument = load_packument(&state, listing).await?;
    let (version, version_manifest) = packument
        .resolve(version.as_deref())
        .ok_or_else(|| match &version {
            Some(v) => AppError::NotFound(format!("Version {v} of {name} is not cached")),
            None => AppError::NotFound(format!("Package {name} has no latest version")),
        })?;
    let version = version.to_string();

    let archive = match listing.tarball_for(&version) {
        Some(key) => match extract_cached(state.store(), key).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(package = %name, version = %version, error = %e, "Falling back to packument metadata");
                None
            }
        },
        None => None,
    };

    let packument_manifest = serde_json::to_value(version_manifest).map_err(AppError::from)?;
    let TarballMetadata {
        readme: archive_readme,
        manifest: archive_manifest,
        ..
    } = archive.unwrap_or_default();
    let from_archive = archive_manifest.is_some();

    let readme = archive_readme
        .or_else(|| string_field(&packument_manifest, "readme"))
        .or_else(|| packument.extra.get("readme").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "No readme available.".to_string());
    let manifest = archive_manifest.unwrap_or(packument_manifest);

    render(PackageTemplate {
        versions: listing.versions.clone(),
        name,
        version,
        readme,
        manifest: serde_json::to_string_pretty(&manifest).map_err(AppError::from)?,
        from_archive,
    })
}

/// Anything else on the web listener.
pub async fn not_found() -> Response {
    error_page(StatusCode::NOT_FOUND, "Page not found")
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn find_listing<'a>(listings: &'a [ModuleListing], name: &str) -> Option<&'a ModuleListing> {
    listings.iter().find(|m| m.name == name)
}

async fn load_packument(state: &AppState, listing: &ModuleListing) -> Result<Packument, AppError> {
    let key = listing
        .packument_key
        .as_deref()
        .ok_or_else(|| AppError::NotFound(format!("Package {} is not cached", listing.name)))?;
    let (_, body) = state
        .store()
        .read(key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Package {} is not cached", listing.name)))?;
    Ok(Packument::from_slice(&body)?)
}

/// Split `name[/version]`, keeping `@scope/pkg` together.
fn split_package_path(path: &str) -> Option<(String, Option<String>)> {
    let path = unescape_name(path.trim_matches('/'));
    let mut parts = path.split('/');
    let first = parts.next().filter(|s| !s.is_empty())?;
    let name = if first.starts_with('@') {
        let pkg = parts.next().filter(|s| !s.is_empty())?;
        format!("{first}/{pkg}")
    } else {
        first.to_string()
    };
    let version = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    if parts.next().is_some() {
        return None;
    }
    Some((name, version))
}
