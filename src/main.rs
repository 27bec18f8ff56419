//! passage CLI.
//!
//! Services come from a config file (`-C`), from `-L` URLs, or both.
//! `-F` URLs define the default chain's hops, in order; `-L` services
//! without an explicit chain traverse it.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use passage_config::{
    ChainConfig, Config, HopConfig, LogConfig, load_config, parse_hop_url, parse_service_url,
};

const DEFAULT_CHAIN: &str = "default";

/// A chainable, protocol-translating proxy gateway.
#[derive(Parser, Debug)]
#[command(name = "passage", version, about)]
struct Cli {
    /// Config file (json/yaml/toml)
    #[arg(short = 'C', long = "config")]
    config: Option<PathBuf>,

    /// Service URL, repeatable: scheme://[user:pass@]host:port[/targets][?opts]
    #[arg(short = 'L', long = "listen")]
    services: Vec<String>,

    /// Forward hop URL, repeatable; order defines the chain
    #[arg(short = 'F', long = "forward")]
    hops: Vec<String>,

    /// Shorthand for debug-level logging
    #[arg(short = 'D', long = "debug")]
    debug: bool,
}

fn assemble_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    if !cli.hops.is_empty() {
        let nodes = cli
            .hops
            .iter()
            .map(|raw| parse_hop_url(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let hops = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| HopConfig {
                name: format!("hop-{i}"),
                selector: None,
                nodes: vec![node],
            })
            .collect();
        config.chains.push(ChainConfig {
            name: DEFAULT_CHAIN.to_string(),
            selector: None,
            hops,
        });
    }

    let has_default_chain = config.chains.iter().any(|c| c.name == DEFAULT_CHAIN);
    for raw in &cli.services {
        let mut service = parse_service_url(raw)?;
        if service.handler.chain.is_none() && has_default_chain {
            service.handler.chain = Some(DEFAULT_CHAIN.to_string());
        }
        config.services.push(service);
    }

    if cli.debug {
        config.log.level = Some("debug".to_string());
    }
    Ok(config)
}

fn init_tracing(config: &LogConfig) {
    let base = config.level.as_deref().unwrap_or("info");
    let mut filter = base.to_string();
    for (module, level) in &config.filters {
        filter.push(',');
        filter.push_str(module);
        filter.push('=');
        filter.push_str(level);
    }
    let filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let format = config.format.as_deref().unwrap_or("pretty");
    let output = config.output.as_deref().unwrap_or("stderr");
    match (format, output) {
        ("json", "stdout") => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stdout))
            .init(),
        ("json", _) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        ("compact", "stdout") => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(io::stdout))
            .init(),
        ("compact", _) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(io::stderr))
            .init(),
        (_, "stdout") => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stdout))
            .init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = assemble_config(&cli)?;
    init_tracing(&config.log);

    if config.services.is_empty() {
        return Err("no services configured; pass -L or -C".into());
    }

    passage_config::register_builtins();
    let services = passage_config::build_services(&config).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let mut tasks = Vec::with_capacity(services.len());
    for service in services {
        tasks.push(service.spawn(shutdown.clone()));
    }
    for task in tasks {
        let _ = task.await;
    }
    info!("all services stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
