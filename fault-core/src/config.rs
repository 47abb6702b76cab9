// fault-core/src/config.rs
// Configuration management

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Prefix for environment overrides, e.g. `SANDBOX_FAULTS__LATENCY__INTERFACE=eth1`
pub const ENV_PREFIX: &str = "SANDBOX";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub faults: FaultsConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultsConfig {
    pub cpu: CpuFaultConfig,
    pub latency: LatencyFaultConfig,
    pub redis: RedisFaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuFaultConfig {
    pub default_duration_ms: u64,
    /// Index fed to the recursive Fibonacci on every burn iteration
    pub fibonacci_index: u32,
}

impl Default for CpuFaultConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 200,
            fibonacci_index: 38,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyFaultConfig {
    pub default_delay_ms: i64,
    pub interface: String,
    pub tc_path: String,
}

impl Default for LatencyFaultConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: 200,
            interface: "eth0".to_string(),
            tc_path: "tc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisFaultConfig {
    pub default_delay_ms: i64,
    /// Address of the injection proxy the datastore client talks to
    pub proxy_addr: String,
    pub io_timeout_ms: u64,
}

impl Default for RedisFaultConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: 100,
            proxy_addr: "localhost:20000".to_string(),
            io_timeout_ms: 5000,
        }
    }
}

impl RedisFaultConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub upstream_connect_timeout_ms: u64,
    /// Upper bound for a single bulk string or reply element
    pub max_frame_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:20000".to_string(),
            upstream_addr: "localhost:6379".to_string(),
            upstream_connect_timeout_ms: 5000,
            max_frame_bytes: crate::resp::MAX_BULK_LEN,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }
}

impl SandboxConfig {
    /// Layer an optional TOML file and `SANDBOX_*` environment variables over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
