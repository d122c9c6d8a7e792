//! Connection manager: owns exactly one connector/session pair per client.
//!
//! The manager translates low-level connector and session events into the
//! single `ClientEvent` stream the cache layer observes. The translation rules
//! distinguish a failed initial dial ("unsuccessful connection") from a
//! mid-session drop, and enforce the reconnect-attempt ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connector::{Connector, ConnectorConfig, ConnectorEvent};
use crate::session::{Credentials, Manifest, RpcSession, SessionConfig, SessionHandle};

/// Configuration for a connection manager instance. Immutable once started.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Remote store host (default: "localhost").
    pub host: String,
    /// Remote store port (default: 3000).
    pub port: u16,
    /// Reconnect attempt ceiling; zero means unlimited retries.
    pub reconnect_attempts: u32,
    /// Credentials forwarded once after each successful connect.
    pub auth: Option<Credentials>,
    /// Namespace descriptor for sublevel scoping.
    pub manifest: Option<Manifest>,
    /// Connector tuning.
    pub connector: ConnectorConfig,
    /// Session tuning.
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            reconnect_attempts: 0,
            auth: None,
            manifest: None,
            connector: ConnectorConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Lifecycle events surfaced to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session is wired to a live stream (and authenticated, when
    /// credentials are configured). Emitted once per successful establishment.
    Connected,
    /// The stream dropped after at least one successful connect.
    Disconnected,
    /// A transport retry fired; forwarded while under the attempt ceiling.
    Reconnecting {
        /// 1-based attempt number since the last successful connect.
        attempt: u32,
    },
    /// Initial dial failure, exhausted reconnect budget, or any session error.
    Error(String),
}

/// Message carried by [`ClientEvent::Error`] when the first dial never succeeds.
pub const ERR_UNSUCCESSFUL_CONNECTION: &str = "unsuccessful connection";

/// Message carried by [`ClientEvent::Error`] when the retry budget is spent.
pub const ERR_MAX_RECONNECT: &str = "max reconnect attempts exceeded";

/// Owns one connector and one session, exposing a translated event stream.
pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<Connector>,
    session: Arc<RpcSession>,
    events: broadcast::Sender<ClientEvent>,
    started: AtomicBool,
    translator: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a manager; no I/O happens until [`ConnectionManager::create_client`].
    pub fn new(config: ManagerConfig) -> Self {
        let connector = Arc::new(Connector::new(config.connector.clone()));
        let session = Arc::new(RpcSession::new(
            config.session.clone(),
            config.manifest.clone(),
        ));
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            connector,
            session,
            events,
            started: AtomicBool::new(false),
            translator: StdMutex::new(None),
        }
    }

    /// Subscribes to the translated event stream. Subscribe before
    /// `create_client` to observe the first `Connected`.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Starts the connection and returns the root session handle.
    ///
    /// Idempotent: a second call returns the existing handle without opening
    /// another connection.
    pub fn create_client(&self) -> SessionHandle {
        if !self.started.swap(true, Ordering::SeqCst) {
            let addr = format!("{}:{}", self.config.host, self.config.port);
            debug!(addr = %addr, "starting connection manager");
            let connector_events = self.connector.subscribe();
            let session_errors = self.session.subscribe_errors();
            self.connector.start(addr);
            let task = translate(
                self.config.clone(),
                self.connector.clone(),
                self.session.clone(),
                connector_events,
                session_errors,
                self.events.clone(),
            );
            *self.translator.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(tokio::spawn(task));
        }
        SessionHandle::root(self.session.clone())
    }

    /// Closes the session, stops the connector, and removes all listeners.
    /// Safe to call when never started; idempotent.
    pub async fn quit(&self) {
        if let Some(handle) = self
            .translator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.session.close().await;
        self.connector.shutdown().await;
    }
}

async fn translate(
    config: ManagerConfig,
    connector: Arc<Connector>,
    session: Arc<RpcSession>,
    mut connector_events: broadcast::Receiver<ConnectorEvent>,
    mut session_errors: broadcast::Receiver<String>,
    events: broadcast::Sender<ClientEvent>,
) {
    let mut established = false;
    let mut ceiling_reported = false;
    loop {
        tokio::select! {
            event = connector_events.recv() => match event {
                Ok(ConnectorEvent::Connected) => {
                    let Some(conn) = connector.connection().await else {
                        continue;
                    };
                    session.bind(conn).await;
                    if let Some(credentials) = &config.auth {
                        if let Err(e) = session.authenticate(credentials).await {
                            warn!(error = %e, "authentication failed");
                            let _ = events.send(ClientEvent::Error(e.to_string()));
                            continue;
                        }
                    }
                    established = true;
                    ceiling_reported = false;
                    let _ = events.send(ClientEvent::Connected);
                }
                Ok(ConnectorEvent::Disconnected) => {
                    if established {
                        let _ = events.send(ClientEvent::Disconnected);
                    } else {
                        let _ = events.send(ClientEvent::Error(
                            ERR_UNSUCCESSFUL_CONNECTION.to_string(),
                        ));
                    }
                }
                Ok(ConnectorEvent::Reconnecting { attempt }) => {
                    if config.reconnect_attempts != 0 && attempt > config.reconnect_attempts {
                        connector.disable_reconnect();
                        if !ceiling_reported {
                            ceiling_reported = true;
                            warn!(attempt, ceiling = config.reconnect_attempts, "reconnect budget spent");
                            let _ = events.send(ClientEvent::Error(ERR_MAX_RECONNECT.to_string()));
                        }
                    } else {
                        let _ = events.send(ClientEvent::Reconnecting { attempt });
                    }
                }
                Ok(ConnectorEvent::Error(message)) => {
                    let _ = events.send(ClientEvent::Error(message));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "translator lagged behind connector events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            error = session_errors.recv() => match error {
                Ok(message) => {
                    let _ = events.send(ClientEvent::Error(message));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "translator lagged behind session errors");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("event translator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3000);
        assert_eq!(config.reconnect_attempts, 0);
        assert!(config.auth.is_none());
        assert!(config.manifest.is_none());
    }

    #[tokio::test]
    async fn test_quit_without_start_is_noop() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        manager.quit().await;
        manager.quit().await;
    }

    #[tokio::test]
    async fn test_initial_dial_failure_is_unsuccessful_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::new(ManagerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            connector: ConnectorConfig {
                reconnect: false,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut events = manager.subscribe();
        let _client = manager.create_client();

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Error(ERR_UNSUCCESSFUL_CONNECTION.to_string())
        );
        manager.quit().await;
    }

    #[tokio::test]
    async fn test_create_client_is_idempotent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let manager = ConnectionManager::new(ManagerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        });
        let mut events = manager.subscribe();
        let _a = manager.create_client();
        let _b = manager.create_client();

        // Exactly one incoming connection, not two.
        let (_stream, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            listener.accept(),
        )
        .await;
        assert!(second.is_err());

        manager.quit().await;
    }
}
