// fault-core/src/integration_tests.rs
// End-to-end tests: real proxy, in-process fake datastore, real sockets

use crate::config::{ProxyConfig, RedisFaultConfig};
use crate::error::FaultError;
use crate::fault::{with_duration, DatastoreLatencyFault, FaultManager, FaultParams, ProxyControlClient};
use crate::proxy::{Injection, InjectionProxy};
use crate::resp::{FrameReader, ReplyKind};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Generous ceiling for an undelayed loopback round-trip.
const BASELINE: Duration = Duration::from_millis(150);

/// Initialize test tracing
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Minimal datastore: `ECHO x` returns bulk `x`, `PING` returns `+PONG`, anything else `+OK`.
async fn spawn_upstream() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = FrameReader::new(read_half);
                while let Ok(cmd) = reader.read_command().await {
                    recorded.lock().push(cmd.name());
                    let reply = match cmd.name().as_str() {
                        "PING" => b"+PONG\r\n".to_vec(),
                        "ECHO" => {
                            let mut out = format!("${}\r\n", cmd.params()[0].len()).into_bytes();
                            out.extend_from_slice(&cmd.params()[0]);
                            out.extend_from_slice(b"\r\n");
                            out
                        }
                        _ => b"+OK\r\n".to_vec(),
                    };
                    if write_half.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, seen)
}

struct RunningProxy {
    addr: SocketAddr,
    proxy: Arc<InjectionProxy>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<crate::Result<()>>,
}

impl RunningProxy {
    fn client(&self) -> ProxyControlClient {
        ProxyControlClient::new(self.addr.to_string(), Duration::from_secs(5))
    }

    fn injection(&self) -> Injection {
        self.proxy.state().snapshot()
    }
}

async fn spawn_proxy(upstream: &str) -> RunningProxy {
    let proxy = Arc::new(InjectionProxy::new(ProxyConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        upstream_addr: upstream.to_string(),
        upstream_connect_timeout_ms: 1000,
        ..ProxyConfig::default()
    }));
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let serving = Arc::clone(&proxy);
    let task = tokio::spawn(async move {
        serving
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
    });

    RunningProxy {
        addr,
        proxy,
        shutdown: Some(tx),
        task,
    }
}

async fn timed(client: &ProxyControlClient, args: &[&str]) -> (Vec<u8>, Duration) {
    let start = Instant::now();
    let reply = client.call(args).await.unwrap();
    (reply.into_raw(), start.elapsed())
}

#[tokio::test]
async fn test_end_to_end_activation_scenario() {
    init_test_tracing();
    let (upstream, seen) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;
    let client = running.client();

    let (reply, _) = timed(&client, &["FAULT.START", "100"]).await;
    assert_eq!(reply, b"+OK\r\n");

    let (reply, elapsed) = timed(&client, &["ECHO", "hello\r\nworld"]).await;
    assert_eq!(reply, b"$12\r\nhello\r\nworld\r\n");
    assert!(elapsed >= Duration::from_millis(100), "round-trip took {:?}", elapsed);

    // Control commands never reach the datastore.
    assert_eq!(*seen.lock(), vec!["ECHO"]);
}

#[tokio::test]
async fn test_deactivation_restores_baseline() {
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;
    let client = running.client();

    client.activate(250).await.unwrap();
    let (reply, elapsed) = timed(&client, &["PING"]).await;
    assert_eq!(reply, b"+PONG\r\n");
    assert!(elapsed >= Duration::from_millis(250), "round-trip took {:?}", elapsed);

    client.deactivate().await.unwrap();
    assert_eq!(running.injection(), Injection::default());

    let (_, elapsed) = timed(&client, &["PING"]).await;
    assert!(elapsed < BASELINE, "round-trip took {:?}", elapsed);
}

#[tokio::test]
async fn test_invalid_activation_keeps_connection_and_baseline() {
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;
    let client = running.client();

    let reply = client.call(&["FAULT.START", "fast"]).await.unwrap();
    assert_eq!(reply.raw(), b"-ERR invalid delay argument\r\n");
    assert!(matches!(client.activate(-1).await, Err(FaultError::Protocol(_))));
    assert_eq!(running.injection(), Injection::default());

    let (reply, elapsed) = timed(&client, &["PING"]).await;
    assert_eq!(reply, b"+PONG\r\n");
    assert!(elapsed < BASELINE, "round-trip took {:?}", elapsed);
}

#[tokio::test]
async fn test_activation_is_shared_across_connections() {
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;
    let controller = running.client();
    let worker = running.client();

    // Baseline on the worker connection first.
    let (_, elapsed) = timed(&worker, &["PING"]).await;
    assert!(elapsed < BASELINE);

    controller.activate(300).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (reply, elapsed) = timed(&worker, &["PING"]).await;
        assert_eq!(reply, b"+PONG\r\n");
        if elapsed >= Duration::from_millis(300) {
            break;
        }
        assert!(Instant::now() < deadline, "activation never became visible");
    }

    controller.deactivate().await.unwrap();
    let (_, elapsed) = timed(&worker, &["PING"]).await;
    assert!(elapsed < BASELINE, "round-trip took {:?}", elapsed);
}

#[tokio::test]
async fn test_in_progress_sleep_is_not_shortened() {
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;
    let controller = running.client();
    let worker = Arc::new(running.client());

    controller.activate(400).await.unwrap();

    let pending = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { timed(&worker, &["PING"]).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.deactivate().await.unwrap();

    let (reply, elapsed) = pending.await.unwrap();
    assert_eq!(reply, b"+PONG\r\n");
    assert!(elapsed >= Duration::from_millis(400), "round-trip took {:?}", elapsed);
}

#[tokio::test]
async fn test_concurrent_toggling_never_corrupts_state() {
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;

    let togglers: Vec<_> = (0..4)
        .map(|i| {
            let client = running.client();
            tokio::spawn(async move {
                for _ in 0..20 {
                    client.activate(5 + i).await.unwrap();
                    client.deactivate().await.unwrap();
                }
            })
        })
        .collect();
    let traffic = {
        let client = running.client();
        tokio::spawn(async move {
            for _ in 0..40 {
                let reply = client.call(&["PING"]).await.unwrap();
                assert_eq!(reply.kind(), ReplyKind::Status("PONG".to_string()));
            }
        })
    };

    for t in togglers {
        t.await.unwrap();
    }
    traffic.await.unwrap();
    assert_eq!(running.injection(), Injection::default());
}

#[tokio::test]
async fn test_binary_payload_relayed_byte_for_byte() {
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut wire = format!("*2\r\n$4\r\nECHO\r\n${}\r\n", payload.len()).into_bytes();
    wire.extend_from_slice(&payload);
    wire.extend_from_slice(b"\r\n");

    let stream = tokio::net::TcpStream::connect(running.addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(&wire).await.unwrap();

    let reply = FrameReader::new(read_half).read_reply().await.unwrap();
    let mut expected = format!("${}\r\n", payload.len()).into_bytes();
    expected.extend_from_slice(&payload);
    expected.extend_from_slice(b"\r\n");
    assert_eq!(reply.raw(), &expected[..]);
}

#[tokio::test]
async fn test_unreachable_upstream_only_affects_that_connection() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap().to_string();
    drop(closed);

    let running = spawn_proxy(&dead_addr).await;
    let client = running.client();
    let err = client.call(&["PING"]).await.unwrap_err();
    assert!(err.is_transient(), "unexpected error {:?}", err);

    // The listener survives and keeps accepting.
    let again = running.client();
    assert!(again.call(&["PING"]).await.is_err());
    assert!(!running.task.is_finished());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let metrics = running.proxy.metrics().snapshot();
    assert_eq!(metrics.connections_accepted, 2);
    assert_eq!(metrics.upstream_errors, 2);
}

#[tokio::test]
async fn test_datastore_fault_round_trip_through_manager() {
    init_test_tracing();
    let (upstream, _) = spawn_upstream().await;
    let running = spawn_proxy(&upstream.to_string()).await;

    let manager = FaultManager::new();
    manager.register(Arc::new(DatastoreLatencyFault::new(RedisFaultConfig {
        default_delay_ms: 100,
        proxy_addr: running.addr.to_string(),
        io_timeout_ms: 2000,
    })));

    manager
        .start_fault("redis_latency", &with_duration(200))
        .await
        .unwrap();
    assert_eq!(manager.list_active(), vec!["redis_latency"]);
    assert_eq!(
        running.injection().effective_delay(),
        Some(Duration::from_millis(200))
    );

    let (_, elapsed) = timed(&running.client(), &["PING"]).await;
    assert!(elapsed >= Duration::from_millis(200));

    manager.stop_all_faults().await;
    assert!(manager.list_active().is_empty());
    assert_eq!(running.injection(), Injection::default());

    manager
        .start_fault("redis_latency", &FaultParams::new())
        .await
        .unwrap();
    assert_eq!(
        running.injection().effective_delay(),
        Some(Duration::from_millis(100))
    );
    manager.stop_fault("redis_latency").await.unwrap();
    assert_eq!(running.injection(), Injection::default());
}

#[tokio::test]
async fn test_metrics_and_graceful_shutdown() {
    let (upstream, _) = spawn_upstream().await;
    let mut running = spawn_proxy(&upstream.to_string()).await;
    let client = running.client();

    client.activate(10).await.unwrap();
    client.call(&["PING"]).await.unwrap();
    client.deactivate().await.unwrap();
    client.call(&["PING"]).await.unwrap();

    let metrics = running.proxy.metrics().snapshot();
    assert_eq!(metrics.connections_accepted, 1);
    assert_eq!(metrics.connections_active, 1);
    assert_eq!(metrics.control_commands, 2);
    assert_eq!(metrics.commands_relayed, 2);
    assert_eq!(metrics.commands_delayed, 1);

    running.shutdown.take().unwrap().send(()).unwrap();
    let served = tokio::time::timeout(Duration::from_secs(2), &mut running.task)
        .await
        .unwrap()
        .unwrap();
    assert!(served.is_ok());
}
