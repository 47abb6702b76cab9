// fault-core/src/proxy/mod.rs
// Injection proxy: relays datastore commands, interprets FAULT.START / FAULT.STOP

use crate::config::ProxyConfig;
use crate::error::{FaultError, Result};
use crate::resp::{error_reply, Command, FrameReader, WireError, OK_REPLY};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub mod state;

pub use state::{Injection, InjectionState, ProxyMetrics, ProxyMetricsSnapshot};

/// Activation: one argument, delay in milliseconds as decimal text.
pub const ACTIVATE_COMMAND: &str = "FAULT.START";

/// Deactivation: no arguments.
pub const DEACTIVATE_COMMAND: &str = "FAULT.STOP";

pub const INVALID_DELAY_MESSAGE: &str = "ERR invalid delay argument";

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything a connection task needs, shared by all of them.
struct ConnectionContext {
    upstream_addr: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    state: Arc<InjectionState>,
    metrics: Arc<ProxyMetrics>,
}

pub struct InjectionProxy {
    config: ProxyConfig,
    state: Arc<InjectionState>,
    metrics: Arc<ProxyMetrics>,
}

impl InjectionProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            state: Arc::new(InjectionState::new()),
            metrics: Arc::new(ProxyMetrics::new()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn state(&self) -> Arc<InjectionState> {
        Arc::clone(&self.state)
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| FaultError::transport(&format!("bind {}", self.config.listen_addr), e))
    }

    /// Accept connections until `shutdown` resolves. In-flight connection tasks
    /// are left to finish on their own.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ctx = Arc::new(ConnectionContext {
            upstream_addr: self.config.upstream_addr.clone(),
            connect_timeout: self.config.upstream_connect_timeout(),
            max_frame_bytes: self.config.max_frame_bytes,
            state: Arc::clone(&self.state),
            metrics: Arc::clone(&self.metrics),
        });

        if let Ok(local) = listener.local_addr() {
            info!(
                "Proxy listening on {}, forwarding to {}",
                local, self.config.upstream_addr
            );
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        tokio::spawn(handle_connection(client, peer, Arc::clone(&ctx)));
                    }
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Proxy shutting down, no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(client: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) {
    let _guard = ctx.metrics.connection_opened();
    debug!("Accepted connection from {}", peer);

    let upstream = match timeout(ctx.connect_timeout, TcpStream::connect(&ctx.upstream_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Could not connect to upstream {}: {}", ctx.upstream_addr, e);
            ctx.metrics.record_upstream_error();
            return;
        }
        Err(_) => {
            warn!(
                "Timed out connecting to upstream {} after {:?}",
                ctx.upstream_addr, ctx.connect_timeout
            );
            ctx.metrics.record_upstream_error();
            return;
        }
    };
    client.set_nodelay(true).ok();
    upstream.set_nodelay(true).ok();

    match relay(client, upstream, &ctx).await {
        Ok(()) | Err(WireError::Closed) => debug!("Connection from {} closed", peer),
        Err(e) => debug!("Connection from {} terminated: {}", peer, e),
    }
}

/// Per-connection forwarding loop. Returns when either leg fails or the client hangs up;
/// dropping the halves closes both sockets.
async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    ctx: &ConnectionContext,
) -> std::result::Result<(), WireError> {
    let (client_read, mut client_write) = client.into_split();
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let mut commands = FrameReader::with_max_bulk(client_read, ctx.max_frame_bytes);
    let mut replies = FrameReader::with_max_bulk(upstream_read, ctx.max_frame_bytes);

    loop {
        let cmd = commands.read_command().await?;

        if let Some(reply) = handle_control(&cmd, &ctx.state) {
            ctx.metrics.record_control();
            client_write.write_all(&reply).await?;
            continue;
        }

        // Latched here: a deactivation arriving mid-sleep does not shorten it.
        if let Some(delay) = ctx.state.snapshot().effective_delay() {
            debug!("Applying {:?} injected delay for command: {}", delay, cmd.name());
            ctx.metrics.record_delayed();
            tokio::time::sleep(delay).await;
        }

        if let Err(e) = upstream_write.write_all(cmd.raw()).await {
            warn!("Error writing command to upstream: {}", e);
            ctx.metrics.record_upstream_error();
            return Err(e.into());
        }

        let reply = match replies.read_reply().await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Error reading response from upstream: {}", e);
                ctx.metrics.record_upstream_error();
                let _ = client_write
                    .write_all(&error_reply(&format!("ERR upstream: {}", e)))
                    .await;
                return Err(e);
            }
        };

        client_write.write_all(reply.raw()).await?;
        ctx.metrics.record_relayed();
    }
}

/// Interpret reserved control commands. `None` means the command must be relayed.
fn handle_control(cmd: &Command, state: &InjectionState) -> Option<Vec<u8>> {
    let name = cmd.name();
    let params = cmd.params();

    match name.as_str() {
        ACTIVATE_COMMAND => {
            if params.len() != 1 {
                return Some(wrong_arity(&name));
            }
            match parse_delay_ms(&params[0]) {
                Some(ms) => {
                    state.activate(Duration::from_millis(ms));
                    info!("Started injecting {}ms delay", ms);
                    Some(OK_REPLY.to_vec())
                }
                None => {
                    debug!(
                        "Rejected {} argument {:?}",
                        ACTIVATE_COMMAND,
                        String::from_utf8_lossy(&params[0])
                    );
                    Some(error_reply(INVALID_DELAY_MESSAGE))
                }
            }
        }
        DEACTIVATE_COMMAND => {
            if !params.is_empty() {
                return Some(wrong_arity(&name));
            }
            state.deactivate();
            info!("Stopped injecting delay");
            Some(OK_REPLY.to_vec())
        }
        _ => None,
    }
}

fn wrong_arity(name: &str) -> Vec<u8> {
    error_reply(&format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

/// Unsigned decimal milliseconds; anything else is rejected.
pub fn parse_delay_ms(arg: &[u8]) -> Option<u64> {
    if arg.is_empty() || !arg.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(arg).ok()?.parse().ok()
}
