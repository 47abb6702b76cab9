// fault-agent/src/main.rs
// sandbox-fault - operator CLI around the fault manager

use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use fault_core::config::SandboxConfig;
use fault_core::fault::{CpuFault, DatastoreLatencyFault, NetworkLatencyFault, ProxyControlClient};
use fault_core::{with_duration, FaultManager, FaultParams};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("sandbox-fault")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inject and retract synthetic performance faults")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .global(true)
                .default_value("sandbox.toml"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("list").about("Print registered faults and their status as JSON"))
        .subcommand(
            Command::new("inject")
                .about("Start a fault, hold it, then stop every fault")
                .arg(Arg::new("fault").required(true).help("cpu, latency or redis_latency"))
                .arg(
                    Arg::new("duration")
                        .short('d')
                        .long("duration")
                        .help("Duration (cpu) or delay (latency, redis_latency) in milliseconds")
                        .value_parser(value_parser!(i64)),
                )
                .arg(
                    Arg::new("hold-secs")
                        .long("hold-secs")
                        .help("Stop after this many seconds instead of waiting for Ctrl+C")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("clear")
                .about("Remove leftover effects of a fault without tracked state")
                .arg(Arg::new("fault").required(true).help("latency or redis_latency")),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let matches = cli().get_matches();
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let config = SandboxConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    match matches.subcommand() {
        Some(("list", _)) => {
            let manager = FaultManager::from_config(&config);
            print_status(&manager)
        }
        Some(("inject", sub)) => {
            let manager = FaultManager::from_config(&config);
            inject(&manager, sub).await
        }
        Some(("clear", sub)) => clear(&config, sub).await,
        _ => Err(anyhow!("unknown subcommand")),
    }
}

fn print_status(manager: &FaultManager) -> Result<()> {
    let status: BTreeMap<_, _> = manager.status().into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String> {
    args.get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))
}

async fn inject(manager: &FaultManager, args: &ArgMatches) -> Result<()> {
    let name = required(args, "fault")?;
    let params = match args.get_one::<i64>("duration") {
        Some(ms) => with_duration(*ms),
        None => FaultParams::new(),
    };

    info!("⚡ Starting {} fault", name);
    manager
        .start_fault(name, &params)
        .await
        .with_context(|| format!("Failed to start fault {}", name))?;

    print_status(manager)?;

    if manager.list_active().is_empty() {
        info!("✅ {} fault completed", name);
        return Ok(());
    }

    let hold = async {
        match args.get_one::<u64>("hold-secs") {
            Some(secs) => tokio::time::sleep(Duration::from_secs(*secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    info!("🚀 Fault {} active, press Ctrl+C to stop", name);
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("🛑 Shutdown signal received");
        }
        _ = hold => info!("Hold period elapsed"),
    }

    manager.stop_all_faults().await;
    Ok(())
}

async fn clear(config: &SandboxConfig, args: &ArgMatches) -> Result<()> {
    let name = required(args, "fault")?;
    match name.as_str() {
        NetworkLatencyFault::NAME => {
            let fault = NetworkLatencyFault::new(config.faults.latency.clone());
            fault
                .force_clear()
                .await
                .with_context(|| format!("Failed to clear tc rules on {}", fault.interface()))?;
        }
        DatastoreLatencyFault::NAME => {
            let client = ProxyControlClient::new(
                config.faults.redis.proxy_addr.clone(),
                config.faults.redis.io_timeout(),
            );
            client
                .deactivate()
                .await
                .with_context(|| format!("Failed to reset injection proxy at {}", client.addr()))?;
        }
        CpuFault::NAME => info!("cpu fault leaves nothing behind"),
        other => return Err(anyhow!("fault {} not found", other)),
    }
    info!("✅ {} cleared", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_inject() {
        let matches = cli()
            .try_get_matches_from(["sandbox-fault", "inject", "latency", "-d", "250", "--hold-secs", "3"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "inject");
        assert_eq!(sub.get_one::<String>("fault").unwrap(), "latency");
        assert_eq!(sub.get_one::<i64>("duration"), Some(&250));
        assert_eq!(sub.get_one::<u64>("hold-secs"), Some(&3));
        assert_eq!(matches.get_one::<String>("config").unwrap(), "sandbox.toml");
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(cli().try_get_matches_from(["sandbox-fault"]).is_err());
        assert!(cli().try_get_matches_from(["sandbox-fault", "clear"]).is_err());
    }

    #[tokio::test]
    async fn test_clear_rejects_unknown_fault() {
        let matches = cli()
            .try_get_matches_from(["sandbox-fault", "clear", "disk"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let err = clear(&SandboxConfig::default(), sub).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_inject_cpu_returns_after_burn() {
        let mut config = SandboxConfig::default();
        config.faults.cpu.fibonacci_index = 10;
        let manager = FaultManager::from_config(&config);
        let matches = cli()
            .try_get_matches_from(["sandbox-fault", "inject", "cpu", "-d", "30"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();

        inject(&manager, sub).await.unwrap();
        assert!(manager.list_active().is_empty());
    }
}
