//! In-process reference server speaking the key/value RPC protocol.
//!
//! Backed by an in-memory map; used by the integration tests of this crate
//! and the cache crate to exercise the client against a live byte stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::connector::Connection;
use crate::error::{Result, TransportError};
use crate::frame::{
    self, Ack, AuthRequest, DeleteRequest, Frame, GetRequest, GetResponse, NamespaceRequest,
    Opcode, PutRequest,
};
use crate::session::Credentials;

type StoreMap = HashMap<(Option<String>, String), serde_json::Value>;

/// In-memory key/value server.
pub struct StoreServer {
    data: Mutex<StoreMap>,
    namespaces: Vec<String>,
    auth: Option<Credentials>,
    connections: AtomicUsize,
}

impl StoreServer {
    /// Creates a server with no namespaces and no authentication.
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            namespaces: Vec::new(),
            auth: None,
            connections: AtomicUsize::new(0),
        }
    }

    /// Requires clients to authenticate with `credentials` before any other
    /// operation.
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    /// Declares the nested namespaces this server accepts.
    pub fn with_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Writes a value directly into the backing map, bypassing the protocol.
    pub fn insert_raw(&self, namespace: Option<&str>, key: &str, value: serde_json::Value) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert((namespace.map(str::to_string), key.to_string()), value);
    }

    /// Reads a value directly from the backing map.
    pub fn get_raw(&self, namespace: Option<&str>, key: &str) -> Option<serde_json::Value> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(&(namespace.map(str::to_string), key.to_string()))
            .cloned()
    }

    /// Number of entries in the backing map.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when the backing map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the accept loop. Spawns a task per connection.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(TransportError::Io)?;
            debug!(peer = %peer_addr, "accepted connection");
            self.connections.fetch_add(1, Ordering::SeqCst);
            let server = self.clone();
            tokio::spawn(async move {
                let conn = match Connection::from_stream(stream) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "failed to wrap connection");
                        return;
                    }
                };
                server.handle_connection(conn).await;
            });
        }
    }

    async fn handle_connection(&self, conn: Connection) {
        let mut authenticated = self.auth.is_none();
        loop {
            let request = match conn.recv_frame().await {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "connection closed");
                    break;
                }
            };
            let response = self.dispatch(&request, &mut authenticated);
            if let Err(e) = conn.send_frame(&response).await {
                warn!(error = %e, "failed to send response");
                break;
            }
        }
    }

    fn dispatch(&self, request: &Frame, authenticated: &mut bool) -> Frame {
        if !*authenticated && request.header.opcode != Opcode::Auth {
            return request.make_error_response("not authenticated");
        }
        match request.header.opcode {
            Opcode::Auth => self.handle_auth(request, authenticated),
            Opcode::Get => self.handle_get(request),
            Opcode::Put => self.handle_put(request),
            Opcode::Delete => self.handle_delete(request),
            Opcode::Namespace => self.handle_namespace(request),
        }
    }

    fn handle_auth(&self, request: &Frame, authenticated: &mut bool) -> Frame {
        let body: AuthRequest = match frame::decode_payload(&request.payload) {
            Ok(b) => b,
            Err(e) => return request.make_error_response(&e.to_string()),
        };
        match &self.auth {
            Some(expected) if expected.user == body.user && expected.pass == body.pass => {
                *authenticated = true;
                ack(request)
            }
            Some(_) => request.make_error_response("invalid credentials"),
            None => ack(request),
        }
    }

    fn handle_get(&self, request: &Frame) -> Frame {
        let body: GetRequest = match frame::decode_payload(&request.payload) {
            Ok(b) => b,
            Err(e) => return request.make_error_response(&e.to_string()),
        };
        let value = self.get_raw(body.namespace.as_deref(), &body.key);
        let response = GetResponse {
            found: value.is_some(),
            value,
        };
        match frame::encode_payload(&response) {
            Ok(payload) => request.make_response(payload),
            Err(e) => request.make_error_response(&e.to_string()),
        }
    }

    fn handle_put(&self, request: &Frame) -> Frame {
        let body: PutRequest = match frame::decode_payload(&request.payload) {
            Ok(b) => b,
            Err(e) => return request.make_error_response(&e.to_string()),
        };
        self.insert_raw(body.namespace.as_deref(), &body.key, body.value);
        ack(request)
    }

    fn handle_delete(&self, request: &Frame) -> Frame {
        let body: DeleteRequest = match frame::decode_payload(&request.payload) {
            Ok(b) => b,
            Err(e) => return request.make_error_response(&e.to_string()),
        };
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.remove(&(body.namespace, body.key));
        ack(request)
    }

    fn handle_namespace(&self, request: &Frame) -> Frame {
        let body: NamespaceRequest = match frame::decode_payload(&request.payload) {
            Ok(b) => b,
            Err(e) => return request.make_error_response(&e.to_string()),
        };
        if self.namespaces.iter().any(|n| *n == body.name) {
            ack(request)
        } else {
            request.make_error_response("unknown namespace")
        }
    }
}

impl Default for StoreServer {
    fn default() -> Self {
        Self::new()
    }
}

fn ack(request: &Frame) -> Frame {
    match frame::encode_payload(&Ack { ok: true }) {
        Ok(payload) => request.make_response(payload),
        Err(e) => request.make_error_response(&e.to_string()),
    }
}
