//! RPC session: request/response multiplexing over one duplex stream.
//!
//! A session outlives individual connections. The connection manager rebinds
//! it to each fresh stream the connector establishes; outstanding requests on
//! the old stream fail with a reset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connector::Connection;
use crate::error::{Result, TransportError};
use crate::frame::{
    self, Ack, AuthRequest, DeleteRequest, ErrorResponse, Frame, GetRequest, GetResponse,
    NamespaceRequest, Opcode, PutRequest,
};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Response timeout in milliseconds (default: 5000).
    pub response_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
        }
    }
}

/// Credentials forwarded once to the remote store after each connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub user: String,
    /// Password.
    pub pass: String,
}

/// Descriptor of the nested namespaces (sublevels) the remote store exposes.
///
/// The session refuses to scope onto a namespace the manifest does not list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Names of the namespaces available on the remote store.
    pub sublevels: Vec<String>,
}

impl Manifest {
    /// True when `name` is a namespace this manifest describes.
    pub fn contains(&self, name: &str) -> bool {
        self.sublevels.iter().any(|s| s == name)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Frame>>>>>;

/// Request/response multiplexer for the key/value RPC protocol.
pub struct RpcSession {
    config: SessionConfig,
    manifest: Option<Manifest>,
    next_id: AtomicU64,
    pending: PendingMap,
    conn: RwLock<Option<Arc<Connection>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    errors: broadcast::Sender<String>,
}

impl RpcSession {
    /// Creates an unbound session. Operations fail with `NotConnected` until
    /// [`RpcSession::bind`] installs a live connection.
    pub fn new(config: SessionConfig, manifest: Option<Manifest>) -> Self {
        let (errors, _) = broadcast::channel(16);
        Self {
            config,
            manifest,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            conn: RwLock::new(None),
            reader: StdMutex::new(None),
            errors,
        }
    }

    /// Subscribes to session-level error reports (malformed frames, premature
    /// stream end). These never crash the process.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    /// Binds the session to a fresh connection, replacing any previous one.
    ///
    /// Requests in flight on the previous connection fail with a reset.
    pub async fn bind(&self, conn: Arc<Connection>) {
        self.abort_reader();
        fail_pending(&self.pending, || TransportError::ConnectionReset).await;
        *self.conn.write().await = Some(conn.clone());

        let pending = self.pending.clone();
        let errors = self.errors.clone();
        let handle = tokio::spawn(async move {
            loop {
                match conn.recv_frame().await {
                    Ok(response) => {
                        let request_id = response.request_id();
                        let mut map = pending.lock().await;
                        if let Some(tx) = map.remove(&request_id) {
                            let result = if response.is_error() {
                                let message = frame::decode_payload::<ErrorResponse>(&response.payload)
                                    .map(|e| e.message)
                                    .unwrap_or_else(|_| "unreadable error response".to_string());
                                Err(TransportError::Remote(message))
                            } else {
                                Ok(response)
                            };
                            let _ = tx.send(result);
                        } else {
                            debug!(request_id, "dropping response with no waiter");
                        }
                    }
                    Err(e) => {
                        if !conn.is_closed() {
                            conn.mark_closed();
                        }
                        fail_pending(&pending, || TransportError::ConnectionReset).await;
                        // A bare EOF is an ordinary disconnect; the connector
                        // surfaces it. Anything else is a session-level error.
                        let eof = matches!(
                            &e,
                            TransportError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
                        );
                        if eof {
                            debug!("session reader stopped at end of stream");
                        } else {
                            warn!(error = %e, "session reader stopped");
                            let _ = errors.send(e.to_string());
                        }
                        break;
                    }
                }
            }
        });
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Tears the session down: stops the reader, fails outstanding requests,
    /// and drops the bound connection. Idempotent.
    pub async fn close(&self) {
        self.abort_reader();
        fail_pending(&self.pending, || TransportError::NotConnected).await;
        self.conn.write().await.take();
    }

    fn abort_reader(&self) {
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Sends one request and waits for its response frame.
    async fn call(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Frame> {
        let conn = self
            .conn
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Frame::new(opcode, request_id, payload);
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(request_id, tx);
        }
        if let Err(e) = conn.send_frame(&request).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionReset),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::RequestTimeout {
                    request_id,
                    timeout_ms: self.config.response_timeout_ms,
                })
            }
        }
    }

    /// Forwards credentials to the remote store. Issued once per established
    /// connection, before any other operation.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let payload = frame::encode_payload(&AuthRequest {
            user: credentials.user.clone(),
            pass: credentials.pass.clone(),
        })?;
        let response = self.call(Opcode::Auth, payload).await?;
        expect_ack(&response)
    }

    /// Fetches a value. `Ok(None)` means the key does not exist.
    pub async fn get(&self, namespace: Option<&str>, key: &str) -> Result<Option<serde_json::Value>> {
        let payload = frame::encode_payload(&GetRequest {
            namespace: namespace.map(str::to_string),
            key: key.to_string(),
        })?;
        let response = self.call(Opcode::Get, payload).await?;
        let body: GetResponse = frame::decode_payload(&response.payload)?;
        if body.found {
            Ok(Some(body.value.unwrap_or(serde_json::Value::Null)))
        } else {
            Ok(None)
        }
    }

    /// Stores a value.
    pub async fn put(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let payload = frame::encode_payload(&PutRequest {
            namespace: namespace.map(str::to_string),
            key: key.to_string(),
            value,
        })?;
        let response = self.call(Opcode::Put, payload).await?;
        expect_ack(&response)
    }

    /// Removes a key. Deleting an absent key is not an error.
    pub async fn delete(&self, namespace: Option<&str>, key: &str) -> Result<()> {
        let payload = frame::encode_payload(&DeleteRequest {
            namespace: namespace.map(str::to_string),
            key: key.to_string(),
        })?;
        let response = self.call(Opcode::Delete, payload).await?;
        expect_ack(&response)
    }
}

fn expect_ack(response: &Frame) -> Result<()> {
    let ack: Ack = frame::decode_payload(&response.payload)?;
    if ack.ok {
        Ok(())
    } else {
        Err(TransportError::Remote("operation not acknowledged".to_string()))
    }
}

/// Cloneable handle scoping session operations under an optional namespace.
///
/// The root handle (no namespace) is produced by the connection manager; child
/// handles come from [`SessionHandle::namespace`].
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<RpcSession>,
    namespace: Option<String>,
}

impl SessionHandle {
    /// Creates the root handle for a session.
    pub fn root(session: Arc<RpcSession>) -> Self {
        Self {
            session,
            namespace: None,
        }
    }

    /// The namespace this handle is scoped to, if any.
    pub fn scope(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns a child handle scoped to `name`.
    ///
    /// The name is validated against the configured manifest, then probed with
    /// a namespace RPC so a missing sublevel fails here rather than on first use.
    pub async fn namespace(&self, name: &str) -> Result<SessionHandle> {
        match &self.session.manifest {
            Some(manifest) if manifest.contains(name) => {}
            _ => return Err(TransportError::UnknownNamespace(name.to_string())),
        }
        let payload = frame::encode_payload(&NamespaceRequest {
            name: name.to_string(),
        })?;
        let response = self.session.call(Opcode::Namespace, payload).await?;
        expect_ack(&response)?;
        Ok(SessionHandle {
            session: self.session.clone(),
            namespace: Some(name.to_string()),
        })
    }

    /// Fetches a value under this handle's scope. `Ok(None)` is a missing key.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.session.get(self.namespace.as_deref(), key).await
    }

    /// Stores a value under this handle's scope.
    pub async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.session.put(self.namespace.as_deref(), key, value).await
    }

    /// Removes a key under this handle's scope.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.session.delete(self.namespace.as_deref(), key).await
    }
}

async fn fail_pending(pending: &PendingMap, error: impl Fn() -> TransportError) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(error()));
    }
}
