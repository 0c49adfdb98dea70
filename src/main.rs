//! mesh-proxy: configuration tooling for the stream controller.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                     STREAM PROXY                      │
//!                 │                                                       │
//!   decoded       │  ┌─────────┐   ┌───────────┐   ┌──────────────────┐  │
//!   request ──────┼─▶│  proxy  │──▶│  stream   │──▶│ routing + lb +   │  │
//!                 │  │ context │   │ pipeline  │   │ upstream pools   │──┼──▶ upstream
//!                 │  └─────────┘   └─────┬─────┘   └──────────────────┘  │
//!                 │                      │  retries / timeouts           │
//!   response ◀────┼──────────────────────┘  filters / conversion        │
//!                 │                                                       │
//!                 │  config (reload) · observability · lifecycle          │
//!                 └──────────────────────────────────────────────────────┘
//! ```
//!
//! Transports and codecs are supplied by the embedding listener. The binary
//! validates configurations, evaluates route matching, and runs the route
//! reload loop with the metrics endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use mesh_proxy::config::{load_config, ConfigWatcher, ProxyConfig};
use mesh_proxy::lifecycle::{shutdown_signal, Shutdown};
use mesh_proxy::observability::{init_logging, metrics};
use mesh_proxy::protocol::HeaderMap;
use mesh_proxy::routing::{Router, RouterHandle, StaticRouter};

#[derive(Parser)]
#[command(name = "mesh-proxy")]
#[command(about = "Stream controller configuration tool", long_about = None)]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, default_value = "mesh-proxy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    Check,
    /// Show which route a request with the given headers takes
    Route {
        /// Request header as `name=value`; repeatable
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Serve metrics and hot-reload routes until interrupted
    Watch,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return Err(e.into());
        }
    };

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("logging already initialized: {e}");
    }

    match cli.command {
        Commands::Check => check(&config),
        Commands::Route { headers } => route(&config, headers),
        Commands::Watch => watch(cli.config, config).await?,
    }
    Ok(())
}

fn check(config: &ProxyConfig) {
    println!("configuration OK");
    println!("  listener:  {}", config.proxy.name);
    println!(
        "  protocols: {} -> {}",
        config.proxy.downstream_protocol, config.proxy.upstream_protocol
    );
    println!("  routes:    {}", config.routes.len());
    for cluster in &config.clusters {
        println!("  cluster {} ({} hosts)", cluster.name, cluster.hosts.len());
    }
}

fn route(config: &ProxyConfig, headers: Vec<(String, String)>) {
    let router = StaticRouter::from_config(config);
    let headers: HeaderMap = headers.into_iter().collect();

    let Some(route) = router.match_route(&headers) else {
        println!("no route matched");
        return;
    };
    println!("route: {}", route.name());
    if let Some(direct) = route.direct_response_rule() {
        println!("  direct response: {}", direct.status);
    } else if let Some(rule) = route.route_rule() {
        println!("  cluster: {}", rule.cluster_name());
        let timeout = rule.timeout();
        println!(
            "  timeouts: global {:?}, per try {:?}",
            timeout.global, timeout.per_try
        );
    }
}

async fn watch(path: PathBuf, config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let router = StaticRouter::from_config(&config);
    tracing::info!(routes = router.len(), "Route table loaded");
    let routers = RouterHandle::new(router);

    let (watcher, mut updates) = ConfigWatcher::new(&path);
    let _watcher = watcher.run()?;

    let shutdown = Arc::new(Shutdown::new());
    let mut stop = shutdown.subscribe();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.trigger();
    });

    loop {
        tokio::select! {
            Some(new_config) = updates.recv() => {
                let router = StaticRouter::from_config(&new_config);
                let count = router.len();
                routers.store(router);
                metrics::record_route_reload(count);
                tracing::info!(routes = count, "Route table reloaded");
            }
            _ = stop.recv() => break,
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
