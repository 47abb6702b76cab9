// fault-agent/src/bin/injection_proxy.rs
// injection-proxy - datastore relay with runtime-toggled latency

use anyhow::{Context, Result};
use clap::{Arg, Command};
use fault_core::config::SandboxConfig;
use fault_core::InjectionProxy;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("injection-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay datastore traffic and inject latency on FAULT.START")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .env("SERVER_ADDR")
                .help("Address to accept client connections on"),
        )
        .arg(
            Arg::new("upstream")
                .short('u')
                .long("upstream")
                .env("REDIS_ADDR")
                .help("Datastore address to forward commands to"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("sandbox.toml"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let matches = cli().get_matches();
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = SandboxConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    if let Some(listen) = matches.get_one::<String>("listen") {
        config.proxy.listen_addr = listen.clone();
    }
    if let Some(upstream) = matches.get_one::<String>("upstream") {
        config.proxy.upstream_addr = upstream.clone();
    }

    info!("🚀 Starting injection proxy v{}", env!("CARGO_PKG_VERSION"));
    let proxy = InjectionProxy::new(config.proxy);
    let listener = proxy
        .bind()
        .await
        .with_context(|| format!("Failed to listen on {}", proxy.config().listen_addr))?;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutdown signal received");
    };
    proxy.serve(listener, shutdown).await?;

    let metrics = proxy.metrics().snapshot();
    info!("Final proxy statistics: {}", serde_json::to_string(&metrics)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let matches = cli()
            .try_get_matches_from(["injection-proxy", "--listen", "0.0.0.0:7000", "-u", "cache:6379"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("listen").unwrap(), "0.0.0.0:7000");
        assert_eq!(matches.get_one::<String>("upstream").unwrap(), "cache:6379");
        assert_eq!(matches.get_one::<String>("config").unwrap(), "sandbox.toml");
    }
}
