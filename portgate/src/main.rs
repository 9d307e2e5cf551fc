//! Port-forwarding firewall daemon

mod console;

use anyhow::{Context, Result};
use clap::Parser;
use console::Console;
use portgate_api::{ApiState, ManagementApi};
use portgate_core::{
    ConfigLoader, ConfigValidator, EventLog, ListenerConfig, PolicyEngine, ProxyConfig,
    ProxyManager, RuleStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "portgate",
    about = "Priority-ordered TCP access control with a forwarding proxy",
    version
)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Rule file to load at startup and save to
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,

    /// Block event log (JSON lines)
    #[arg(long, value_name = "PATH")]
    events: Option<PathBuf>,

    /// Management API listen address
    #[arg(long, value_name = "ADDR")]
    api: Option<SocketAddr>,

    /// Do not start the management API
    #[arg(long)]
    no_api: bool,

    /// Forward LPORT to HOST:TPORT (can be used multiple times)
    #[arg(long = "proxy", value_name = "LPORT:HOST:TPORT", value_parser = parse_proxy)]
    proxies: Vec<ProxyConfig>,

    /// Cap on concurrently handled connections per listener
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// Upstream connect timeout in milliseconds
    #[arg(long, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// Close relays with no traffic in either direction for this many milliseconds
    #[arg(long, value_name = "MS")]
    idle_timeout_ms: Option<u64>,

    /// Run without the interactive console, until Ctrl-C
    #[arg(long)]
    no_console: bool,

    /// Debug logging
    #[arg(long, short)]
    verbose: bool,
}

/// Log filter directive: a non-empty `RUST_LOG` wins, otherwise info or debug
fn log_directive(rust_log: Option<String>, verbose: bool) -> String {
    rust_log
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

fn parse_proxy(spec: &str) -> std::result::Result<ProxyConfig, String> {
    ProxyConfig::parse_spec(spec).ok_or_else(|| format!("expected LPORT:HOST:TPORT, got {:?}", spec))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging before anything else can log
    let (filter, filter_handle) = reload::Layer::new(EnvFilter::new(log_directive(
        std::env::var("RUST_LOG").ok(),
        args.verbose,
    )));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config =
        ConfigLoader::load_or_default(args.config.clone()).context("Failed to load config")?;

    // the config file can also ask for debug output
    if config.common.verbose && !args.verbose {
        filter_handle
            .reload(EnvFilter::new(log_directive(std::env::var("RUST_LOG").ok(), true)))
            .context("Failed to raise log level")?;
    }

    // CLI flags override the file
    if let Some(rules) = args.rules {
        config.store.rules_path = rules;
    }
    if let Some(events) = args.events {
        config.store.events_path = events;
    }
    if let Some(api) = args.api {
        config.api.listen = api;
    }
    if args.no_api {
        config.api.enabled = false;
    }
    if args.max_connections.is_some() {
        config.limits.max_connections = args.max_connections;
    }
    if args.connect_timeout_ms.is_some() {
        config.limits.connect_timeout_ms = args.connect_timeout_ms;
    }
    if args.idle_timeout_ms.is_some() {
        config.limits.idle_timeout_ms = args.idle_timeout_ms;
    }
    config.proxies.extend(args.proxies);
    ConfigValidator::validate(&config).context("Invalid configuration")?;

    let store = RuleStore::new(&config.store.rules_path);
    let events = Arc::new(EventLog::new(&config.store.events_path));
    let engine = Arc::new(PolicyEngine::new());

    // conflicts are logged by the engine as rules go in
    engine.reload(store.load());
    info!(
        "Loaded {} rules from {}",
        engine.len(),
        store.path().display()
    );

    let mut api = ManagementApi::new(ApiState {
        engine: engine.clone(),
        store: store.clone(),
        events: events.clone(),
    });
    if config.api.enabled {
        api.start(config.api.listen).await?;
    }

    let limits = config.limits.to_limits();
    let mut proxies = ProxyManager::new(engine.clone(), events.clone(), limits.clone());
    for proxy in &config.proxies {
        let listener = ListenerConfig::from_proxy(proxy, limits.clone());
        proxies
            .start_with(listener)
            .await
            .with_context(|| format!("Failed to start proxy on port {}", proxy.listen_port))?;
    }

    if args.no_console {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    } else {
        let mut console = Console::new(engine.clone(), &store, events.clone(), &mut proxies);
        tokio::select! {
            result = console.run() => result?,
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    info!("Shutting down");
    api.stop().await;
    proxies.stop_all().await;
    Ok(())
}
