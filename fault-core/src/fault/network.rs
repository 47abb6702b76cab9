// fault-core/src/fault/network.rs
// Network latency fault backed by `tc qdisc ... netem delay`

use super::{duration_param, FaultDriver, FaultParams};
use crate::config::LatencyFaultConfig;
use crate::error::{FaultError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Delays below 1ms are replaced by this floor.
pub const MIN_DELAY_MS: i64 = 100;

/// `tc` messages meaning "there was no rule to delete".
const NO_RULE_MARKERS: &[&str] = &[
    "no such file or directory",
    "no qdisc",
    "cannot delete qdisc with handle of zero",
    "invalid handle",
    "invalid qdisc handle",
];

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr
    pub output: String,
}

/// Runs host commands on behalf of a driver.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Spawns real processes through `tokio::process`.
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: combined.trim().to_string(),
        })
    }
}

pub struct NetworkLatencyFault {
    config: LatencyFaultConfig,
    runner: Arc<dyn CommandRunner>,
    /// Installed delay; the lock also serializes start/stop.
    installed_ms: Mutex<Option<i64>>,
    active: AtomicBool,
}

impl NetworkLatencyFault {
    pub const NAME: &'static str = "latency";

    pub fn new(config: LatencyFaultConfig) -> Self {
        Self::with_runner(config, Arc::new(TokioCommandRunner))
    }

    pub fn with_runner(config: LatencyFaultConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            installed_ms: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    pub async fn installed_delay_ms(&self) -> Option<i64> {
        *self.installed_ms.lock().await
    }

    /// Remove any root qdisc on the interface regardless of the tracked state,
    /// e.g. one left behind by a process that died before cleanup.
    pub async fn force_clear(&self) -> Result<()> {
        let mut installed = self.installed_ms.lock().await;
        self.clear_rule().await?;
        *installed = None;
        self.active.store(false, Ordering::SeqCst);
        info!("Cleared tc rules on {}", self.config.interface);
        Ok(())
    }

    fn tc_args(&self, action: &[&str]) -> Vec<String> {
        let mut args = vec![
            "qdisc".to_string(),
            action[0].to_string(),
            "dev".to_string(),
            self.config.interface.clone(),
            "root".to_string(),
        ];
        args.extend(action[1..].iter().map(|s| s.to_string()));
        args
    }

    fn render(&self, args: &[String]) -> String {
        format!("{} {}", self.config.tc_path, args.join(" "))
    }

    async fn run_tc(&self, args: &[String]) -> Result<CommandOutput> {
        debug!("Executing tc command: {}", self.render(args));
        self.runner
            .run(&self.config.tc_path, args)
            .await
            .map_err(|e| FaultError::Operational {
                command: self.render(args),
                output: e.to_string(),
            })
    }

    /// Remove the root qdisc; a missing rule counts as success.
    async fn clear_rule(&self) -> Result<()> {
        let args = self.tc_args(&["del"]);
        let result = self.run_tc(&args).await?;
        if result.success {
            debug!("Cleared tc qdisc on {}", self.config.interface);
            return Ok(());
        }

        let lowered = result.output.to_lowercase();
        if NO_RULE_MARKERS.iter().any(|m| lowered.contains(m)) {
            debug!("No tc qdisc to delete on {}: {}", self.config.interface, result.output);
            return Ok(());
        }

        Err(FaultError::Operational {
            command: self.render(&args),
            output: result.output,
        })
    }
}

#[async_trait]
impl FaultDriver for NetworkLatencyFault {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, params), fields(fault = "latency"))]
    async fn start(&self, params: &FaultParams) -> Result<()> {
        let mut installed = self.installed_ms.lock().await;
        if self.active.load(Ordering::SeqCst) {
            return Err(FaultError::Conflict {
                fault: Self::NAME.to_string(),
            });
        }

        let mut delay_ms = duration_param(params)?.unwrap_or(self.config.default_delay_ms);
        if delay_ms < 1 {
            delay_ms = MIN_DELAY_MS;
        }

        if let Err(e) = self.clear_rule().await {
            warn!("Pre-clean of tc qdisc on {} failed: {}", self.config.interface, e);
        }

        let delay = format!("{}ms", delay_ms);
        let args = self.tc_args(&["add", "netem", "delay", &delay]);
        let result = self.run_tc(&args).await?;
        if !result.success {
            return Err(FaultError::Operational {
                command: self.render(&args),
                output: result.output,
            });
        }

        *installed = Some(delay_ms);
        self.active.store(true, Ordering::SeqCst);
        info!("Set simulated {}ms delay on {}", delay_ms, self.config.interface);
        Ok(())
    }

    #[instrument(skip(self), fields(fault = "latency"))]
    async fn stop(&self) -> Result<()> {
        let mut installed = self.installed_ms.lock().await;
        if !self.active.load(Ordering::SeqCst) {
            debug!("Latency fault not active, nothing to stop");
            return Ok(());
        }

        // On failure the rule may still be installed; stay active so stop can be retried.
        self.clear_rule().await?;

        *installed = None;
        self.active.store(false, Ordering::SeqCst);
        info!("Latency fault stopped on {}", self.config.interface);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
