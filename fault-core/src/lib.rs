// fault-core/src/lib.rs
// Reversible performance faults and the datastore injection proxy

pub mod config;
pub mod error;
pub mod fault;
pub mod proxy;
pub mod resp;

#[cfg(test)]
mod integration_tests;

pub use config::{ProxyConfig, SandboxConfig};
pub use error::{FaultError, Result};
pub use fault::{
    with_duration, CpuFault, DatastoreLatencyFault, FaultDriver, FaultManager, FaultParams,
    FaultStatus, NetworkLatencyFault, ProxyControlClient,
};
pub use proxy::{InjectionProxy, InjectionState, ProxyMetricsSnapshot};
