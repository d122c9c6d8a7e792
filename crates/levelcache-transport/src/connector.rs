//! Reconnecting TCP connector.
//!
//! The connector owns the dial/re-dial loop for one logical client. It emits
//! lifecycle events on a broadcast channel; retry ceilings are enforced by the
//! connection manager, which can call [`Connector::disable_reconnect`] once
//! the configured attempt budget is spent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::frame::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Dial timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (default: true).
    pub nodelay: bool,
    /// Whether the supervisor re-dials after a disconnect (default: true).
    pub reconnect: bool,
    /// Initial backoff before the first re-dial, in milliseconds (default: 100).
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds (default: 10000).
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff per attempt (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
            reconnect: true,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Lifecycle events emitted by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// A dial succeeded and the stream is usable.
    Connected,
    /// The stream closed, or a dial attempt failed. The layer above decides
    /// whether this was an initial failure or a mid-session drop.
    Disconnected,
    /// A re-dial is about to fire. The attempt counter resets on success.
    Reconnecting {
        /// 1-based attempt number since the last successful connect.
        attempt: u32,
    },
    /// A stream-level error that is not a plain disconnect.
    Error(String),
}

/// A framed duplex TCP stream with concurrent read/write support.
///
/// The `closed` flag may be set by any holder of the connection (typically the
/// session reader when the stream errors out); the connector supervisor awaits
/// it to drive reconnection.
pub struct Connection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wraps an established TCP stream.
    pub fn from_stream(stream: tokio::net::TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let local_addr = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let (read, write) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
            closed,
        })
    }

    /// Sends a frame. A socket error marks the connection closed.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        let result: std::io::Result<()> = async {
            write.write_all(&encoded).await?;
            write.flush().await
        }
        .await;
        if let Err(e) = result {
            self.mark_closed();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Receives one frame. A socket or framing error marks the connection closed.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        if let Err(e) = read.read_exact(&mut header_buf).await {
            self.mark_closed();
            return Err(TransportError::Io(e));
        }
        let header = FrameHeader::decode(&header_buf)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            if let Err(e) = read.read_exact(&mut payload).await {
                self.mark_closed();
                return Err(TransportError::Io(e));
            }
        }
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Marks the connection dead, waking [`Connection::closed`] waiters.
    pub fn mark_closed(&self) {
        // send_replace updates the value even with no receivers subscribed;
        // send would drop the update and leave the flag stuck at false.
        self.closed.send_replace(true);
    }

    /// True once the connection has been marked closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been marked closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Local address.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

/// Reconnecting connector for one remote address.
pub struct Connector {
    config: ConnectorConfig,
    events: broadcast::Sender<ConnectorEvent>,
    current: Arc<RwLock<Option<Arc<Connection>>>>,
    reconnect_enabled: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Creates a connector; no I/O happens until [`Connector::start`].
    pub fn new(config: ConnectorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        let reconnect_enabled = Arc::new(AtomicBool::new(config.reconnect));
        Self {
            config,
            events,
            current: Arc::new(RwLock::new(None)),
            reconnect_enabled,
            shutdown,
            supervisor: StdMutex::new(None),
        }
    }

    /// Subscribes to lifecycle events. Subscribe before calling `start` to
    /// observe the first `Connected`.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    /// The live connection, if one is currently established.
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.current.read().await.clone()
    }

    /// Spawns the dial supervisor for `addr`. Calling `start` twice is a no-op.
    pub fn start(&self, addr: String) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if supervisor.is_some() {
            return;
        }
        let config = self.config.clone();
        let events = self.events.clone();
        let current = self.current.clone();
        let reconnect_enabled = self.reconnect_enabled.clone();
        let shutdown_rx = self.shutdown.subscribe();
        *supervisor = Some(tokio::spawn(supervise(
            addr,
            config,
            events,
            current,
            reconnect_enabled,
            shutdown_rx,
        )));
    }

    /// Disables further automatic re-dials. The supervisor exits after the
    /// current connection (or backoff sleep) ends.
    pub fn disable_reconnect(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
    }

    /// Stops the supervisor and closes the live connection. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(conn) = self.current.write().await.take() {
            conn.mark_closed();
        }
        let handle = {
            let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
            supervisor.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn supervise(
    addr: String,
    config: ConnectorConfig,
    events: broadcast::Sender<ConnectorEvent>,
    current: Arc<RwLock<Option<Arc<Connection>>>>,
    reconnect_enabled: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match dial(&addr, &config).await {
            Ok(conn) => {
                attempt = 0;
                let conn = Arc::new(conn);
                *current.write().await = Some(conn.clone());
                debug!(addr = %addr, peer = conn.peer_addr(), "connected");
                let _ = events.send(ConnectorEvent::Connected);
                tokio::select! {
                    _ = conn.closed() => {}
                    _ = shutdown_rx.wait_for(|s| *s) => {
                        conn.mark_closed();
                    }
                }
                current.write().await.take();
                if *shutdown_rx.borrow() {
                    break;
                }
                debug!(addr = %addr, "stream closed");
                let _ = events.send(ConnectorEvent::Disconnected);
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "dial failed");
                let _ = events.send(ConnectorEvent::Disconnected);
            }
        }
        if !reconnect_enabled.load(Ordering::SeqCst) {
            break;
        }
        attempt += 1;
        let backoff = compute_backoff(&config, attempt - 1);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.wait_for(|s| *s) => break,
        }
        if !reconnect_enabled.load(Ordering::SeqCst) {
            break;
        }
        let _ = events.send(ConnectorEvent::Reconnecting { attempt });
    }
    debug!(addr = %addr, "connector supervisor stopped");
}

async fn dial(addr: &str, config: &ConnectorConfig) -> Result<Connection> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: config.connect_timeout_ms,
        })?
        .map_err(TransportError::Io)?;
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = addr, error = %e, "failed to set TCP_NODELAY");
        }
    }
    Connection::from_stream(stream)
}

/// Computes `initial * multiplier^attempt`, capped at the configured maximum.
fn compute_backoff(config: &ConnectorConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff_ms as f64;
    let computed = base * config.backoff_multiplier.powi(attempt as i32);
    let capped = computed.min(config.max_backoff_ms as f64);
    Duration::from_millis(capped as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Opcode;

    #[test]
    fn test_connector_config_default() {
        let config = ConnectorConfig::default();
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(config.nodelay);
        assert!(config.reconnect);
        assert_eq!(config.initial_backoff_ms, 100);
    }

    #[test]
    fn test_compute_backoff_grows_and_caps() {
        let config = ConnectorConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(compute_backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_backoff(&config, 2), Duration::from_millis(400));
        assert_eq!(compute_backoff(&config, 10), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_connection_send_recv() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = Connection::from_stream(stream).unwrap();
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.header.opcode, Opcode::Get);
            conn.send_frame(&frame.make_response(b"{}".to_vec())).await.unwrap();
        });

        let config = ConnectorConfig::default();
        let conn = dial(&addr, &config).await.unwrap();
        conn.send_frame(&Frame::new(Opcode::Get, 1, b"{}".to_vec()))
            .await
            .unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert!(response.is_response());
        assert_eq!(response.request_id(), 1);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_closed_flag() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let conn = dial(&addr, &ConnectorConfig::default()).await.unwrap();
        assert!(!conn.is_closed());
        conn.mark_closed();
        assert!(conn.is_closed());
        // Resolves immediately once the flag is set.
        conn.closed().await;

        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connector_emits_connected_and_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let connector = Connector::new(ConnectorConfig {
            reconnect: false,
            ..Default::default()
        });
        let mut events = connector.subscribe();
        connector.start(addr);

        let (stream, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Connected);
        assert!(connector.connection().await.is_some());

        drop(stream);
        // The supervisor only notices once something marks the connection
        // closed; the session reader normally does this.
        let conn = connector.connection().await.unwrap();
        conn.mark_closed();
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Disconnected);

        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_connector_dial_failure_emits_disconnected() {
        // Nothing is listening on this address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = Connector::new(ConnectorConfig {
            reconnect: false,
            ..Default::default()
        });
        let mut events = connector.subscribe();
        connector.start(addr);

        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Disconnected);
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_connector_reconnect_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = Connector::new(ConnectorConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 10,
            ..Default::default()
        });
        let mut events = connector.subscribe();
        connector.start(addr);

        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Disconnected);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectorEvent::Reconnecting { attempt: 1 }
        );
        assert_eq!(events.recv().await.unwrap(), ConnectorEvent::Disconnected);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectorEvent::Reconnecting { attempt: 2 }
        );

        connector.disable_reconnect();
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let connector = Connector::new(ConnectorConfig::default());
        connector.shutdown().await;
    }
}
