//! Connection cache shared by all workers.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Connection, ConnectionConfig, ConnectionError, ConnectionFactory, ConnectionResult};

type CacheKey = (String, String);

/// Caches one live connection per `(host, transport)` pair
pub struct ConnectionManager {
    factory: ConnectionFactory,
    connections: RwLock<HashMap<CacheKey, Arc<dyn Connection>>>,
}

impl ConnectionManager {
    /// Create a manager with the built-in transports
    pub fn new() -> Self {
        Self::with_factory(ConnectionFactory::new())
    }

    /// Create a manager around a custom factory
    pub fn with_factory(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// The factory used to create new connections
    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// Return the cached connection for `(host, type)`, or connect a new one.
    ///
    /// Errors are annotated with the host and transport.
    pub async fn get_connection(
        &self,
        host: &str,
        connection_type: &str,
        mut config: ConnectionConfig,
    ) -> ConnectionResult<Arc<dyn Connection>> {
        let type_name = self.factory.resolve_type(connection_type, host);
        let key = (host.to_string(), type_name.clone());

        if let Some(conn) = self.cached(&key) {
            return Ok(conn);
        }

        if config.host.is_empty() {
            config.host = host.to_string();
        }
        let wrap = |e: ConnectionError| e.in_transport(host, &type_name);

        let conn = self.factory.create(&type_name, config).map_err(wrap)?;
        conn.connect().await.map_err(wrap)?;
        debug!(host = %host, transport = %type_name, "Opened connection");

        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&key) {
            if existing.is_connected() {
                // Another worker won the race; keep theirs.
                let existing = existing.clone();
                drop(connections);
                let loser = conn;
                tokio::spawn(async move {
                    let _ = loser.close().await;
                });
                return Ok(existing);
            }
        }
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .get(key)
            .filter(|c| c.is_connected())
            .cloned()
    }

    /// Close and forget every cached connection to `host`
    pub async fn close_connection(&self, host: &str) -> ConnectionResult<()> {
        let removed: Vec<Arc<dyn Connection>> = {
            let mut connections = self.connections.write();
            let keys: Vec<CacheKey> = connections
                .keys()
                .filter(|(h, _)| h == host)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| connections.remove(k)).collect()
        };

        let mut first_error = None;
        for conn in removed {
            if let Err(e) = conn.close().await {
                let e = e.in_transport(host, conn.connection_type());
                warn!(host = %host, error = %e, "Failed to close connection");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every cached connection; failures are logged and skipped
    pub async fn close_all_connections(&self) {
        let drained: Vec<(CacheKey, Arc<dyn Connection>)> =
            self.connections.write().drain().collect();

        let closing = drained.into_iter().map(|((host, transport), conn)| async move {
            if let Err(e) = conn.close().await {
                warn!(host = %host, transport = %transport, error = %e, "Failed to close connection");
            }
        });
        join_all(closing).await;
    }

    /// `(host, transport)` keys of cached connections that are still connected, sorted
    pub fn active_connections(&self) -> Vec<(String, String)> {
        let mut keys: Vec<CacheKey> = self
            .connections
            .read()
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
