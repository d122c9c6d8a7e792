//! Shared fixtures for transport integration tests.

use std::net::SocketAddr;
use std::sync::Arc;

use levelcache_transport::connector::ConnectorConfig;
use levelcache_transport::manager::ManagerConfig;
use levelcache_transport::server::StoreServer;

/// Installs a test subscriber so `RUST_LOG` works under `cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Binds a listener and runs the server accept loop on it.
pub async fn spawn_server(server: Arc<StoreServer>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Manager configuration pointed at `addr`, tuned for fast tests.
pub fn manager_config(addr: SocketAddr) -> ManagerConfig {
    ManagerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connector: ConnectorConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}
