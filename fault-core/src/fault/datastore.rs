// fault-core/src/fault/datastore.rs
// Datastore latency fault: toggles delay inside the injection proxy over its data channel

use super::{duration_param, FaultDriver, FaultParams};
use crate::config::RedisFaultConfig;
use crate::error::{FaultError, Result};
use crate::proxy::{ACTIVATE_COMMAND, DEACTIVATE_COMMAND};
use crate::resp::{encode_command, FrameReader, Reply, ReplyKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Lazily connected RESP client for the proxy's control commands.
///
/// The connection is reused between calls and re-dialled after any transport
/// failure or timeout.
pub struct ProxyControlClient {
    addr: String,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl ProxyControlClient {
    pub fn new(addr: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            io_timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Ask the proxy to delay every relayed command by `delay_ms`.
    pub async fn activate(&self, delay_ms: i64) -> Result<()> {
        let delay = delay_ms.to_string();
        let reply = self.call(&[ACTIVATE_COMMAND, delay.as_str()]).await?;
        expect_ok(ACTIVATE_COMMAND, reply)
    }

    pub async fn deactivate(&self) -> Result<()> {
        let reply = self.call(&[DEACTIVATE_COMMAND]).await?;
        expect_ok(DEACTIVATE_COMMAND, reply)
    }

    /// Send one command and return its raw reply.
    ///
    /// Any failure inside the round-trip drops the connection: after a framing
    /// error the stream may still hold the rest of the broken reply.
    pub async fn call(&self, args: &[&str]) -> Result<Reply> {
        let command = args
            .first()
            .ok_or_else(|| FaultError::Protocol("empty command".to_string()))?;
        let payload = encode_command(args);
        let mut slot = self.conn.lock().await;

        let outcome = timeout(self.io_timeout, exchange(&mut slot, &self.addr, &payload)).await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                debug!("Dropping control connection to {}: {}", self.addr, e);
                *slot = None;
                Err(e)
            }
            Err(_) => {
                *slot = None;
                Err(FaultError::Timeout {
                    operation: format!("{} round-trip to {}", command, self.addr),
                    timeout_ms: self.io_timeout.as_millis() as u64,
                })
            }
        }
    }
}

async fn exchange(slot: &mut Option<Connection>, addr: &str, payload: &[u8]) -> Result<Reply> {
    if slot.is_none() {
        debug!("Connecting to injection proxy at {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| FaultError::transport(&format!("connect to {}", addr), e))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *slot = Some(Connection {
            reader: FrameReader::new(read_half),
            writer: write_half,
        });
    }

    let conn = slot
        .as_mut()
        .ok_or_else(|| FaultError::Protocol("control connection unavailable".to_string()))?;
    conn.writer
        .write_all(payload)
        .await
        .map_err(|e| FaultError::transport("write control command", e))?;
    Ok(conn.reader.read_reply().await?)
}

fn expect_ok(command: &str, reply: Reply) -> Result<()> {
    match reply.kind() {
        ReplyKind::Status(status) if status == "OK" => Ok(()),
        ReplyKind::Error(message) => Err(FaultError::Protocol(format!(
            "{} rejected by proxy: {}",
            command, message
        ))),
        _ => Err(FaultError::Protocol(format!(
            "{}: unexpected reply {:?}",
            command,
            String::from_utf8_lossy(reply.raw())
        ))),
    }
}

pub struct DatastoreLatencyFault {
    config: RedisFaultConfig,
    client: Arc<ProxyControlClient>,
    /// Delay installed in the proxy; the lock also serializes start/stop.
    installed_ms: Mutex<Option<i64>>,
    active: AtomicBool,
}

impl DatastoreLatencyFault {
    pub const NAME: &'static str = "redis_latency";

    pub fn new(config: RedisFaultConfig) -> Self {
        let client = Arc::new(ProxyControlClient::new(
            config.proxy_addr.clone(),
            config.io_timeout(),
        ));
        Self::with_client(config, client)
    }

    pub fn with_client(config: RedisFaultConfig, client: Arc<ProxyControlClient>) -> Self {
        Self {
            config,
            client,
            installed_ms: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub async fn installed_delay_ms(&self) -> Option<i64> {
        *self.installed_ms.lock().await
    }
}

#[async_trait]
impl FaultDriver for DatastoreLatencyFault {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, params), fields(fault = "redis_latency"))]
    async fn start(&self, params: &FaultParams) -> Result<()> {
        let mut installed = self.installed_ms.lock().await;
        if self.active.load(Ordering::SeqCst) {
            debug!("Redis latency fault already active");
            return Ok(());
        }

        let delay_ms = duration_param(params)?.unwrap_or(self.config.default_delay_ms);
        if let Err(e) = self.client.activate(delay_ms).await {
            error!("Failed to start redis latency fault: {}", e);
            return Err(e);
        }

        *installed = Some(delay_ms);
        self.active.store(true, Ordering::SeqCst);
        info!("Start redis latency {}ms", delay_ms);
        Ok(())
    }

    #[instrument(skip(self), fields(fault = "redis_latency"))]
    async fn stop(&self) -> Result<()> {
        let mut installed = self.installed_ms.lock().await;
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.client.deactivate().await {
            warn!("Failed to stop redis latency fault: {}", e);
            return Err(e);
        }

        *installed = None;
        self.active.store(false, Ordering::SeqCst);
        info!("Redis latency fault stopped");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
