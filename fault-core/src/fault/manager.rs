// fault-core/src/fault/manager.rs
// Registry and dispatcher over fault drivers

use super::{CpuFault, DatastoreLatencyFault, FaultDriver, FaultParams, NetworkLatencyFault};
use crate::config::SandboxConfig;
use crate::error::{FaultError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of one registered fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStatus {
    pub name: String,
    pub active: bool,
}

/// Owns the registry; never holds its lock while a driver runs.
#[derive(Default)]
pub struct FaultManager {
    faults: Mutex<HashMap<String, Arc<dyn FaultDriver>>>,
}

impl FaultManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with the standard `cpu`, `latency` and `redis_latency` drivers.
    pub fn from_config(config: &SandboxConfig) -> Self {
        let manager = Self::new();
        manager.register(Arc::new(CpuFault::new(config.faults.cpu.clone())));
        manager.register(Arc::new(NetworkLatencyFault::new(
            config.faults.latency.clone(),
        )));
        manager.register(Arc::new(DatastoreLatencyFault::new(
            config.faults.redis.clone(),
        )));
        manager
    }

    /// Insert or replace the driver registered under `driver.name()`.
    pub fn register(&self, driver: Arc<dyn FaultDriver>) {
        let name = driver.name().to_string();
        if self.faults.lock().insert(name.clone(), driver).is_some() {
            debug!("Replaced fault driver {}", name);
        } else {
            debug!("Registered fault driver {}", name);
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn FaultDriver>> {
        self.faults
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| FaultError::not_found(name))
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn FaultDriver>)> {
        self.faults
            .lock()
            .iter()
            .map(|(name, driver)| (name.clone(), Arc::clone(driver)))
            .collect()
    }

    pub async fn start_fault(&self, name: &str, params: &FaultParams) -> Result<()> {
        let driver = self.lookup(name)?;
        driver.start(params).await
    }

    pub async fn stop_fault(&self, name: &str) -> Result<()> {
        let driver = self.lookup(name)?;
        driver.stop().await
    }

    /// Best-effort shutdown cleanup: every driver gets a stop call, failures are only logged.
    pub async fn stop_all_faults(&self) {
        for (name, driver) in self.snapshot() {
            if let Err(e) = driver.stop().await {
                warn!("Failed to stop fault {}: {}", name, e);
            }
        }
        info!("All faults stopped");
    }

    pub fn status(&self) -> HashMap<String, FaultStatus> {
        self.snapshot()
            .into_iter()
            .map(|(name, driver)| {
                let status = FaultStatus {
                    name: driver.name().to_string(),
                    active: driver.is_active(),
                };
                (name, status)
            })
            .collect()
    }

    pub fn list_active(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, driver)| driver.is_active())
            .map(|(name, _)| name)
            .collect();
        active.sort();
        active
    }

    pub fn fault_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.faults.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
