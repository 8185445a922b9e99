//! Router construction and the two listeners.

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::{proxy, ui, AppState};

/// Router for the npm-facing listener.
pub fn registry_router(state: Arc<AppState>) -> Router {
    let log_requests = state.config.server.log_requests;
    let router = Router::new()
        .fallback(proxy::handle)
        .layer(middleware::from_fn(proxy::require_json))
        .with_state(state);
    if log_requests {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Router for the browsable cache index.
pub fn web_router(state: Arc<AppState>) -> Router {
    let log_requests = state.config.server.log_requests;
    let router = Router::new()
        .route("/", get(ui::home))
        .route("/package/{*path}", get(ui::package))
        .fallback(ui::not_found)
        .with_state(state);
    if log_requests {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Run both listeners until `shutdown` resolves, then drain in-flight
/// requests.
pub async fn run_server_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let host = config.server.host.clone();
    let registry_addr = format!("{host}:{}", config.server.registry_port);
    let web_addr = format!("{host}:{}", config.server.web_port);

    let state = Arc::new(
        AppState::new(config)
            .await
            .context("Failed to initialise proxy state")?,
    );

    let registry_listener = TcpListener::bind(&registry_addr)
        .await
        .with_context(|| format!("Failed to bind registry listener to {registry_addr}"))?;
    let web_listener = TcpListener::bind(&web_addr)
        .await
        .with_context(|| format!("Failed to bind web listener to {web_addr}"))?;

    info!(
        registry = %registry_addr,
        web = %web_addr,
        upstream = %state.upstream.registry_origin(),
        cache = %state.store().root().display(),
        mode = ?state.upstream.mode(),
        "npm cache proxy listening"
    );
    print_banner(&state, &web_addr);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        info!("Received shutdown signal, stopping gracefully");
        let _ = stop_tx.send(true);
    });

    let registry = axum::serve(registry_listener, registry_router(state.clone()))
        .with_graceful_shutdown(wait_for_stop(stop_rx.clone()))
        .into_future();
    let web = axum::serve(web_listener, web_router(state))
        .with_graceful_shutdown(wait_for_stop(stop_rx))
        .into_future();

    let (registry_result, web_result) = tokio::join!(registry, web);
    registry_result.context("Registry listener failed")?;
    web_result.context("Web listener failed")?;
    Ok(())
}

/// Run until Ctrl-C.
pub async fn run_server(config: Config) -> Result<()> {
    run_server_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            break;
        }
    }
}

fn print_banner(state: &AppState, web_addr: &str) {
    println!("Listening on: {}", state.public_origin);
    println!("Browse the cache at: http://{web_addr}");
    println!("To use: npm config set registry {}", state.public_origin);
    println!("^C to close server");
}
