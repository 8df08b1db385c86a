// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! The embedding-owned engine instance. A `Broker` holds one topology store
//! and hands out connections to it; independent brokers share nothing.

use crate::{
    config::ConnectionConfig,
    connection::{Connection, ConnectionInner},
    errors::AmqpError,
    topology::Topology,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::debug;

/// An isolated broker instance.
///
/// `Broker` is a cheap handle; clones share the same topology and
/// connections.
#[derive(Clone)]
pub struct Broker {
    topology: Arc<Topology>,
    next_connection_id: Arc<AtomicU64>,
    connections: Arc<Mutex<Vec<Weak<ConnectionInner>>>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Creates a broker holding only the default exchanges.
    pub fn new() -> Self {
        Broker {
            topology: Arc::new(Topology::new()),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The topology store shared by every connection of this broker.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Opens a connection to this broker.
    ///
    /// # Parameters
    /// * `config` - Settings applied to the connection and its channels
    ///
    /// # Returns
    /// The open connection, registered so that `shutdown` can close it
    pub async fn open_connection(&self, config: ConnectionConfig) -> Result<Connection, AmqpError> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::open(id, config, self.topology.clone());

        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(connection.downgrade());

        Ok(connection)
    }

    /// Opens a connection configured from the environment.
    pub async fn connect(&self) -> Result<Connection, AmqpError> {
        let config = ConnectionConfig::from_env()?;
        self.open_connection(config).await
    }

    /// Requeues deliveries left unacknowledged for longer than `timeout`.
    /// Their delivery tags become invalid.
    pub fn requeue_expired(&self, timeout: Duration) -> usize {
        self.topology.requeue_expired(timeout)
    }

    /// Runs `requeue_expired` every `interval` until the broker is dropped
    /// or the returned task is aborted.
    ///
    /// # Parameters
    /// * `timeout` - How long a delivery may stay unacknowledged
    /// * `interval` - Time between two sweeps
    ///
    /// # Returns
    /// The handle of the sweeping task
    pub fn spawn_consumer_timeout(&self, timeout: Duration, interval: Duration) -> JoinHandle<()> {
        let topology = Arc::downgrade(&self.topology);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                let Some(topology) = topology.upgrade() else {
                    break;
                };

                let requeued = topology.requeue_expired(timeout);
                if requeued > 0 {
                    debug!("consumer timeout requeued {} deliveries", requeued);
                }
            }
        })
    }

    /// Closes every connection and empties the topology.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = std::mem::take(&mut *self.connections.lock());

        for connection in connections.iter().filter_map(Weak::upgrade) {
            connection.close();
        }

        self.topology.clear();
        debug!("broker shut down");
    }
}
