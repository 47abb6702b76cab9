// fault-core/src/fault/mod.rs
// Fault driver capability surface and parameter helpers

use crate::error::{FaultError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

pub mod cpu;
pub mod datastore;
pub mod manager;
pub mod network;

pub use cpu::CpuFault;
pub use datastore::{DatastoreLatencyFault, ProxyControlClient};
pub use manager::{FaultManager, FaultStatus};
pub use network::{CommandOutput, CommandRunner, NetworkLatencyFault, TokioCommandRunner};

/// Free-form fault parameters as received from the business layer.
pub type FaultParams = HashMap<String, serde_json::Value>;

/// Parameter carrying a duration or delay in milliseconds.
pub const DURATION_PARAM: &str = "duration";

/// A pluggable source of one kind of synthetic degradation.
///
/// `start` and `stop` may be slow (external processes, network round-trips, CPU
/// burns); implementations that enforce exactly-one-active serialize them with
/// their own lock. `is_active` must not block on that lock.
#[async_trait]
pub trait FaultDriver: Send + Sync {
    /// Registry key, unique per manager.
    fn name(&self) -> &str;

    async fn start(&self, params: &FaultParams) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_active(&self) -> bool;
}

/// Milliseconds from `params["duration"]`, accepting JSON integers and decimal strings.
pub fn duration_param(params: &FaultParams) -> Result<Option<i64>> {
    let value = match params.get(DURATION_PARAM) {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let parsed = match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    parsed.map(Some).ok_or_else(|| FaultError::InvalidParameter {
        name: DURATION_PARAM.to_string(),
        reason: format!("expected integer milliseconds, got {}", value),
    })
}

/// Convenience constructor for the common single-parameter case.
pub fn with_duration(ms: i64) -> FaultParams {
    let mut params = FaultParams::new();
    params.insert(DURATION_PARAM.to_string(), serde_json::Value::from(ms));
    params
}
