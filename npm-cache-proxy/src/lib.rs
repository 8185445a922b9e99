//! # npm Cache Proxy
//!
//! A caching reverse proxy for an npm registry. npm clients point their
//! registry at the proxy; packuments and tarballs are fetched from upstream,
//! kept in an on-disk cache, and served back with tarball URLs rewritten to
//! the proxy. A second listener serves a browsable index of what is cached.
//!
//! ## Key Modules
//!
//! - [`classify`]: request classification (tarball, manifest, passthrough)
//! - [`packument`]: packument model and tarball URL rewriting
//! - [`memo`]: in-process packument memo
//! - [`upstream`]: upstream client with disk caching
//! - [`store`]: on-disk response cache
//! - [`extract`]: readme and manifest extraction from tarballs
//! - [`index`]: cache index scanner
//! - [`proxy`]: registry listener handlers
//! - [`ui`]: web listener handlers
//! - [`server`]: routers and listeners

pub mod classify;
pub mod config;
pub mod error;
pub mod extract;
pub mod hash_utils;
pub mod index;
pub mod memo;
pub mod packument;
pub mod proxy;
pub mod server;
pub mod state;
pub mod store;
pub mod ui;
pub mod upstream;

pub use config::Config;
pub use error::{ApiErrorResponse, AppError, AppResult, ErrorCode};
pub use server::{registry_router, run_server, run_server_with_shutdown, web_router};
pub use state::AppState;
