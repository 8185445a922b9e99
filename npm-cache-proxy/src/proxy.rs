//! # Registry Listener
//!
//! npm clients talk to this side. Every request is classified once:
//!
//! - **Manifest** (`/<name>`): the packument comes from the memo or upstream
//!   and its tarball URLs are rewritten to point back at this proxy.
//! - **Tarball** (`/<name>/-/<file>-<version>.tgz`): resolved through the
//!   packument and streamed from the version's `dist.tarball`.
//! - **Passthrough**: forwarded verbatim, PUT/POST bodies streamed through.
//!
//! Clients that cannot take JSON are refused with 406 before any upstream
//! work happens.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

use crate::classify::Route;
use crate::config::CacheMode;
use crate::memo::{fetch_packument, PackumentOptions};
use crate::upstream::{strip_hop_headers, UpstreamRequest, UpstreamResponse};
use crate::{AppError, AppResult, AppState};

/// Reject clients whose `Accept` header does not admit JSON, and default
/// the response content type to JSON.
pub async fn require_json(request: Request, next: Next) -> Response {
    if !accepts_json(request.headers()) {
        let accept = request
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        return AppError::NotAcceptable(accept).into_response();
    }

    let mut response = next.run(request).await;
    if !response.headers().contains_key(header::CONTENT_TYPE) {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
    }
    response
}

/// Whether any media range in `Accept` matches `application/json` with a
/// non-zero quality. A missing header accepts everything.
pub fn accepts_json(headers: &HeaderMap) -> bool {
    let values: Vec<&str> = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return true;
    }

    values
        .iter()
        .flat_map(|v| v.split(','))
        .any(|range| {
            let mut parts = range.split(';').map(str::trim);
            let media = parts.next().unwrap_or_default().to_ascii_lowercase();
            let refused = parts.any(|p| {
                p.strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            !refused && matches!(media.as_str(), "application/json" | "application/*" | "*/*")
        })
}

/// Fallback handler for every request on the registry listener.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> AppResult<Response> {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let route = if method == Method::GET || method == Method::HEAD {
        state.classifier.classify(&target)
    } else {
        Route::Passthrough
    };
    debug!(method = %method, target = %target, route = ?route, "Classified request");

    match route {
        Route::Manifest { name } => manifest(&state, &name).await,
        Route::Tarball { name, version } => tarball(&state, &name, &version, headers).await,
        Route::Passthrough => passthrough(&state, method, &target, headers, body).await,
    }
}

fn packument_options(state: &AppState) -> PackumentOptions<'static> {
    PackumentOptions {
        prefer_online: state.upstream.mode() == CacheMode::NoCache,
        full_metadata: state.config.upstream.full_metadata,
        ..PackumentOptions::default()
    }
}

async fn manifest(state: &AppState, name: &str) -> AppResult<Response> {
    let packument = fetch_packument(&state.upstream, &state.memo, name, packument_options(state)).await?;
    let body = (*packument)
        .clone()
        .for_client(state.upstream.registry_origin(), &state.public_origin);
    Ok(Json(body).into_response())
}

async fn tarball(state: &AppState, name: &str, version: &str, headers: HeaderMap) -> AppResult<Response> {
    let packument = fetch_packument(&state.upstream, &state.memo, name, packument_options(state)).await?;
    let (_, manifest) = packument
        .resolve(Some(version))
        .ok_or_else(|| AppError::NotFound(format!("No version {version} of {name}")))?;
    if manifest.dist.tarball.is_empty() {
        return Err(AppError::NotFound(format!("{name}@{version} has no tarball")));
    }

    let request = UpstreamRequest::new(Method::GET, manifest.dist.tarball.clone())
        .with_headers(headers)
        .with_integrity(manifest.dist.expected_integrity());
    let response = state.upstream.fetch(request).await?;

    if !response.status.is_success() {
        let status = response.status;
        warn!(package = %name, version = %version, status = %status, "Tarball fetch refused");
        return Err(AppError::Upstream {
            status: Some(status.as_u16()),
            message: format!("GET {} returned {status}", manifest.dist.tarball),
        });
    }
    Ok(relay(response))
}

async fn passthrough(
    state: &AppState,
    method: Method,
    target: &str,
    headers: HeaderMap,
    body: Body,
) -> AppResult<Response> {
    let url = format!("{}{}", state.upstream.registry_origin(), target);
    let mut request = UpstreamRequest::new(method.clone(), url).with_headers(headers);
    if method == Method::PUT || method == Method::POST {
        request = request.with_body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let response = state.upstream.fetch(request).await?;
    Ok(relay(response))
}

/// Stream an upstream response to the client, keeping its status and
/// headers minus the connection-level ones.
fn relay(mut upstream: UpstreamResponse) -> Response {
    let status = upstream.status;
    let mut headers = std::mem::take(&mut upstream.headers);
    strip_hop_headers(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.into_body()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
