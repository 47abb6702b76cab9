// fault-core/src/fault/cpu.rs
// CPU saturation fault: naive recursive Fibonacci in a wall-clock bounded loop

use super::{duration_param, FaultDriver, FaultParams};
use crate::config::CpuFaultConfig;
use crate::error::{FaultError, Result};
use async_trait::async_trait;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, instrument};

pub struct CpuFault {
    config: CpuFaultConfig,
    iterations_total: AtomicU64,
}

impl CpuFault {
    pub const NAME: &'static str = "cpu";

    pub fn new(config: CpuFaultConfig) -> Self {
        Self {
            config,
            iterations_total: AtomicU64::new(0),
        }
    }

    /// Fibonacci evaluations completed across all burns so far.
    pub fn iterations_total(&self) -> u64 {
        self.iterations_total.load(Ordering::Relaxed)
    }
}

/// Exponential on purpose; the cost is the point.
pub fn fibonacci(n: u32) -> u64 {
    if n <= 1 {
        return n as u64;
    }
    fibonacci(n - 1) + fibonacci(n - 2)
}

/// Occupy the calling thread until `target` has elapsed. Returns the number of
/// Fibonacci evaluations performed. Not preemptible.
pub fn burn(target: Duration, index: u32) -> u64 {
    let start = Instant::now();
    let mut iterations = 0u64;
    while start.elapsed() < target {
        black_box(fibonacci(black_box(index)));
        iterations += 1;
    }
    iterations
}

#[async_trait]
impl FaultDriver for CpuFault {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, params), fields(fault = "cpu"))]
    async fn start(&self, params: &FaultParams) -> Result<()> {
        let duration_ms = duration_param(params)?
            .unwrap_or(self.config.default_duration_ms as i64)
            .max(0) as u64;
        let target = Duration::from_millis(duration_ms);
        let index = self.config.fibonacci_index;

        // Keep the burn off the async workers so request handling is not starved.
        let started = Instant::now();
        let iterations = tokio::task::spawn_blocking(move || burn(target, index))
            .await
            .map_err(|e| FaultError::Operational {
                command: "cpu burn".to_string(),
                output: e.to_string(),
            })?;

        self.iterations_total.fetch_add(iterations, Ordering::Relaxed);
        info!(
            "CPU fault finished, ran for {:?} ({} iterations)",
            started.elapsed(),
            iterations
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Burns are synchronous and self-bounding, so there is no lasting effect to report.
    fn is_active(&self) -> bool {
        false
    }
}
