// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-database connection management.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::cluster::ClusterInfo;
use crate::config::Config;
use crate::AccessError;

/// A live connection together with the capabilities detected when it was
/// opened.
pub struct Connection {
    client: Client,
    info: ClusterInfo,
    database: String,
}

impl Connection {
    async fn open(config: &Config, task_name: &str) -> Result<Connection, AccessError> {
        let client = config.connect(task_name).await?;
        let info = ClusterInfo::detect(&client).await?;
        Ok(Connection {
            client,
            info,
            database: config.database().to_string(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    /// The database this connection is attached to.
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("database", &self.database)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Hands out one shared connection per database name.
///
/// Connections live until [`ConnectionBroker::close`]; they are never
/// evicted individually. Only the name to connection map is guarded by the
/// lock, so statements on an already open connection run concurrently.
#[derive(Debug)]
pub struct ConnectionBroker {
    config: Config,
    /// `None` once the broker has been closed.
    connections: Mutex<Option<BTreeMap<String, Arc<Connection>>>>,
}

impl ConnectionBroker {
    pub fn new(config: Config) -> Self {
        ConnectionBroker {
            config,
            connections: Mutex::new(Some(BTreeMap::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the connection for `database`, opening it on first use.
    ///
    /// An empty name refers to the database of the connection string.
    pub async fn open_database(&self, database: &str) -> Result<Arc<Connection>, AccessError> {
        let config = self.config.for_database(database);
        let name = config.database().to_string();

        let mut connections = self.connections.lock().await;
        let connections = connections.as_mut().ok_or(AccessError::BrokerClosed)?;
        if let Some(conn) = connections.get(&name) {
            debug!(database = %name, "reusing cached connection");
            return Ok(Arc::clone(conn));
        }

        let conn = Arc::new(Connection::open(&config, &format!("broker/{name}")).await?);
        connections.insert(name, Arc::clone(&conn));
        Ok(conn)
    }

    /// Opens a connection to `database` that is not shared with anyone else.
    ///
    /// Used for sessions whose transaction state must not leak into other
    /// callers, such as the one holding escalation locks.
    pub async fn connect_dedicated(&self, database: &str) -> Result<Connection, AccessError> {
        if self.connections.lock().await.is_none() {
            return Err(AccessError::BrokerClosed);
        }
        let config = self.config.for_database(database);
        Connection::open(&config, &format!("dedicated/{}", config.database())).await
    }

    /// Drops every cached connection. The broker cannot be reopened.
    pub async fn close(&self) {
        if let Some(connections) = self.connections.lock().await.take() {
            info!(count = connections.len(), "closing postgres connections");
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    impl ConnectionBroker {
        async fn open_databases(&self) -> Vec<String> {
            self.connections
                .lock()
                .await
                .as_ref()
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default()
        }
    }

    fn broker() -> ConnectionBroker {
        ConnectionBroker::new(
            "postgres://admin@localhost:1/postgres?sslmode=disable"
                .parse()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let broker = broker();
        broker.close().await;
        assert!(matches!(
            broker.open_database("app_db").await,
            Err(AccessError::BrokerClosed)
        ));
        assert!(matches!(
            broker.connect_dedicated("app_db").await,
            Err(AccessError::BrokerClosed)
        ));
        // Closing twice is harmless.
        broker.close().await;
        assert!(broker.open_databases().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let broker = broker();
        let err = broker.open_database("app_db").await.unwrap_err();
        assert!(matches!(
            err,
            AccessError::Connect { .. } | AccessError::ConnectTimeout { .. }
        ));
        assert!(broker.open_databases().await.is_empty());
    }
}
