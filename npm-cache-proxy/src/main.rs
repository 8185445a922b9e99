//! `npm-cache-proxy` command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use npm_cache_logging::init_subscriber;
use npm_cache_proxy::config::CacheMode;
use npm_cache_proxy::index::KeyPatterns;
use npm_cache_proxy::store::CacheStore;
use npm_cache_proxy::{run_server, Config};

#[derive(Parser)]
#[command(name = "npm-cache-proxy")]
#[command(about = "Caching reverse proxy for the npm registry")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON); defaults apply when it does not exist
    #[arg(long, global = true, default_value = "npm-cache-proxy.json")]
    config: PathBuf,

    /// Cache directory
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry and web listeners
    Start {
        /// Address to bind both listeners to
        #[arg(long)]
        host: Option<String>,

        /// Registry listener port
        #[arg(long)]
        port: Option<u16>,

        /// Web UI listener port
        #[arg(long)]
        web_port: Option<u16>,

        /// Upstream registry URL
        #[arg(long)]
        registry: Option<String>,

        /// Serve only from the cache
        #[arg(long, conflicts_with_all = ["prefer_offline", "prefer_online"])]
        offline: bool,

        /// Use cached responses without revalidating
        #[arg(long, conflicts_with = "prefer_online")]
        prefer_offline: bool,

        /// Always revalidate cached responses
        #[arg(long)]
        prefer_online: bool,

        /// Log each request
        #[arg(long)]
        log: Option<bool>,
    },

    /// List modules with both a packument and a tarball cached
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(cache) = cli.cache {
        config.cache.dir = cache;
    }

    let _guard = init_subscriber(&config.logging.clone().with_env_overrides());
    debug!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::Start {
            host,
            port,
            web_port,
            registry,
            offline,
            prefer_offline,
            prefer_online,
            log,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.registry_port = port;
            }
            if let Some(web_port) = web_port {
                config.server.web_port = web_port;
            }
            if let Some(registry) = registry {
                config.upstream.registry = registry;
            }
            if offline || prefer_offline || prefer_online {
                config.cache.mode = CacheMode::from_flags(offline, prefer_offline, prefer_online);
            }
            if let Some(log) = log {
                config.server.log_requests = log;
            }
            run_server(config).await
        }

        Commands::List => {
            let store = CacheStore::open(config.cache.dir.clone()).await?;
            let listings = KeyPatterns::new()?.scan(&store).await?;
            if listings.is_empty() {
                println!("No modules cached in {}", store.root().display());
            }
            for module in listings {
                println!("{} ({})", module.name, module.versions.join(", "));
            }
            Ok(())
        }
    }
}
