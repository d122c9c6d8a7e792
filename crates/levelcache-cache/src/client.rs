//! The cache client: public lifecycle and operation surface.
//!
//! A client owns one connection manager. `start` brings the connection up and
//! resolves the configured sublevel; concurrent starts coalesce onto the same
//! attempt. Operations issued while the client is not ready fail immediately
//! rather than queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use levelcache_transport::manager::{ClientEvent, ConnectionManager};
use levelcache_transport::session::SessionHandle;

use crate::config::ClientSettings;
use crate::envelope::{self, Envelope};
use crate::error::{CacheError, Result};
use crate::key::{storage_key, CacheKey};

struct ReadyState {
    manager: Arc<ConnectionManager>,
    handle: SessionHandle,
}

// Outcome fanned out to callers that joined an in-flight start. Carried as a
// message rather than a CacheError because broadcast requires Clone.
type StartOutcome = std::result::Result<(), String>;

/// Caching client over the remote key/value store.
pub struct CacheClient {
    settings: ClientSettings,
    inflight: Mutex<Option<broadcast::Sender<StartOutcome>>>,
    state: RwLock<Option<ReadyState>>,
    ready: AtomicBool,
}

impl CacheClient {
    /// Creates a stopped client. Settings are validated here; a misconfigured
    /// client fails at construction, not on first use.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            inflight: Mutex::new(None),
            state: RwLock::new(None),
            ready: AtomicBool::new(false),
        })
    }

    /// The settings this client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Connects to the remote store and resolves the configured sublevel.
    ///
    /// Concurrent callers coalesce onto the attempt already in flight and all
    /// observe its outcome, success or failure. Calling `start` on a running
    /// client is a no-op; calling it after a failed attempt retries.
    pub async fn start(&self) -> Result<()> {
        let joined = {
            let mut inflight = self.inflight.lock().await;
            if self.state.read().await.is_some() {
                return Ok(());
            }
            match inflight.as_ref() {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *inflight = Some(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = joined {
            return match rx.recv().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(CacheError::Connection(message)),
                Err(_) => Err(CacheError::Connection(
                    "connection attempt abandoned".to_string(),
                )),
            };
        }

        let result = self.connect().await;
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        if let Some(tx) = self.inflight.lock().await.take() {
            let _ = tx.send(outcome);
        }
        result
    }

    /// Runs one connection attempt and installs the working handle on success.
    async fn connect(&self) -> Result<()> {
        let manager = Arc::new(ConnectionManager::new(self.settings.manager_config()));
        let mut events = manager.subscribe();
        let root = manager.create_client();

        // First terminal event decides the outcome: Connected wins, Error
        // fails the start. Reconnecting events before either are progress,
        // not outcomes.
        loop {
            match events.recv().await {
                Ok(ClientEvent::Connected) => break,
                Ok(ClientEvent::Error(message)) => {
                    manager.quit().await;
                    return Err(CacheError::Connection(message));
                }
                Ok(ClientEvent::Reconnecting { attempt }) => {
                    debug!(attempt, "waiting out a reconnect during start");
                }
                Ok(ClientEvent::Disconnected) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "start lagged behind client events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    manager.quit().await;
                    return Err(CacheError::Connection("connection closed".to_string()));
                }
            }
        }

        let handle = match &self.settings.sublevel {
            Some(sublevel) => match root.namespace(sublevel).await {
                Ok(handle) => handle,
                Err(e) => {
                    manager.quit().await;
                    return Err(e.into());
                }
            },
            None => root,
        };

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            sublevel = ?self.settings.sublevel,
            "cache client started"
        );
        *self.state.write().await = Some(ReadyState { manager, handle });
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disconnects and releases the connection. Idempotent.
    pub async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(state) = self.state.write().await.take() {
            state.manager.quit().await;
            info!("cache client stopped");
        }
    }

    /// True while the client is started. Synchronous and side-effect free.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Subscribes to connection lifecycle events. Fails when not started.
    pub async fn subscribe_events(&self) -> Result<broadcast::Receiver<ClientEvent>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(CacheError::NotStarted)?;
        Ok(state.manager.subscribe())
    }

    /// Fetches `key`, returning `None` for both absent and stale entries.
    ///
    /// Stale entries are not deleted eagerly; they age out of the store or get
    /// overwritten. Unreadable stored values fail with
    /// [`CacheError::Corrupt`] or [`CacheError::IncorrectEnvelope`].
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Envelope>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(CacheError::NotStarted)?;
        let storage = storage_key(self.settings.partition.as_deref(), key);
        let Some(raw) = state.handle.get(&storage).await? else {
            return Ok(None);
        };
        let envelope = Envelope::decode(raw, self.settings.value_encoding)?;
        if envelope.is_stale(envelope::now_ms()) {
            debug!(key = %storage, "stale entry treated as a miss");
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    /// Stores `value` under `key` with a time to live of `ttl` milliseconds.
    ///
    /// Serialization failures surface before anything touches the wire.
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: i64) -> Result<()> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(CacheError::NotStarted)?;
        let item =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let envelope = Envelope::new(item, ttl);
        let encoded = envelope.encode(self.settings.value_encoding)?;
        let storage = storage_key(self.settings.partition.as_deref(), key);
        state.handle.put(&storage, encoded).await?;
        Ok(())
    }

    /// Removes `key`. Removing an absent key succeeds.
    pub async fn drop_key(&self, key: &CacheKey) -> Result<()> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(CacheError::NotStarted)?;
        let storage = storage_key(self.settings.partition.as_deref(), key);
        state.handle.delete(&storage).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, EncodingMode};

    #[test]
    fn test_new_validates_settings() {
        let result = CacheClient::new(ClientSettings {
            key_encoding: EncodingMode::Json,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(CacheError::Config(ConfigError::UnsupportedKeyEncoding))
        ));
    }

    #[test]
    fn test_new_client_is_not_ready() {
        let client = CacheClient::new(ClientSettings::default()).unwrap();
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_operations_fail_before_start() {
        let client = CacheClient::new(ClientSettings::default()).unwrap();
        let key = CacheKey::new("segment", "id");
        assert!(matches!(
            client.get(&key).await.unwrap_err(),
            CacheError::NotStarted
        ));
        assert!(matches!(
            client.set(&key, &"v", 50).await.unwrap_err(),
            CacheError::NotStarted
        ));
        assert!(matches!(
            client.drop_key(&key).await.unwrap_err(),
            CacheError::NotStarted
        ));
        assert!(matches!(
            client.subscribe_events().await.unwrap_err(),
            CacheError::NotStarted
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let client = CacheClient::new(ClientSettings::default()).unwrap();
        client.stop().await;
        client.stop().await;
        assert!(!client.is_ready());
    }
}
