// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection
//!
//! A connection owns its channels and moves through `Open`, `Closing` and
//! `Closed`. Once closing starts no channel can be created; closing cascades
//! to every channel, removes the exclusive queues the connection declared
//! and cannot be undone.

use crate::{
    channel::{Channel, ChannelInner},
    config::ConnectionConfig,
    errors::AmqpError,
    topology::Topology,
};
use lapin::{
    options::ConfirmSelectOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};
use tokio::sync::watch;
use tracing::debug;

/// Product name reported in the server properties.
pub const PRODUCT: &str = "rabbitmq-engine";

/// Lifecycle of a connection. `Closing` is observable while its channels
/// are being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

pub(crate) struct ConnectionInner {
    id: u64,
    config: ConnectionConfig,
    topology: Arc<Topology>,
    state: watch::Sender<ConnectionState>,
    channels: Mutex<BTreeMap<u16, Arc<ChannelInner>>>,
}

impl ConnectionInner {
    pub(crate) fn is_open(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    /// Forgets a closed channel, freeing its number.
    pub(crate) fn detach(&self, number: u16, key: u64) {
        let mut channels = self.channels.lock();

        if channels.get(&number).is_some_and(|c| c.key() == key) {
            channels.remove(&number);
        }
    }

    pub(crate) fn close(&self) {
        let closing = self.state.send_if_modified(|state| match state {
            ConnectionState::Open => {
                *state = ConnectionState::Closing;
                true
            }
            _ => false,
        });

        if !closing {
            return;
        }

        debug!("closing connection: {}", self.id);

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels.into_values() {
            channel.close();
        }

        self.topology.delete_owned_queues(self.id);
        self.state.send_replace(ConnectionState::Closed);

        debug!("connection: {} closed", self.id);
    }
}

/// A client connection to the broker.
///
/// `Connection` is a cheap handle; clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.connection_name)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Connection {
    pub(crate) fn open(id: u64, config: ConnectionConfig, topology: Arc<Topology>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);

        debug!(
            "connection: {} opened, name: {:?}",
            id, config.connection_name
        );

        Connection {
            inner: Arc::new(ConnectionInner {
                id,
                config,
                topology,
                state,
                channels: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Identifier unique within the broker.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Settings the connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Opens a channel on the lowest free channel number.
    ///
    /// # Returns
    /// The new channel, or `ConnectionClosed` once closing started and
    /// `AccessRefused` when `channel_max` channels are already open
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let mut channels = self.inner.channels.lock();

        if !self.inner.is_open() {
            return Err(AmqpError::ConnectionClosed);
        }

        let max = self.inner.config.max_channel_number();
        let number = (1..=max)
            .find(|n| !channels.contains_key(n))
            .ok_or_else(|| {
                AmqpError::AccessRefused(format!("channel_max {max} reached on connection {}", self.inner.id))
            })?;

        let channel = ChannelInner::new(
            number,
            self.inner.id,
            self.inner.config.prefetch_count,
            self.inner.topology.clone(),
            self.downgrade(),
        );
        channels.insert(number, channel.clone());

        debug!("channel: {} created on connection: {}", number, self.inner.id);
        Ok(Channel::new(channel))
    }

    /// Opens a channel already in confirm mode.
    pub async fn create_confirm_channel(&self) -> Result<Channel, AmqpError> {
        let channel = self.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        Ok(channel)
    }

    /// Closes every channel, then the connection. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close();
        Ok(())
    }

    /// Subscribes to state changes of this connection.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the connection is closed.
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        if state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .is_err()
        {
            debug!("connection state dropped");
        }
    }

    /// Properties a broker announces when a connection opens.
    pub fn server_properties(&self) -> FieldTable {
        let mut capabilities = FieldTable::default();
        for capability in [
            "publisher_confirms",
            "basic.nack",
            "consumer_cancel_notify",
            "per_consumer_qos",
        ] {
            capabilities.insert(ShortString::from(capability), AMQPValue::Boolean(true));
        }

        let mut properties = FieldTable::default();
        properties.insert(
            ShortString::from("product"),
            AMQPValue::LongString(LongString::from(PRODUCT)),
        );
        properties.insert(
            ShortString::from("version"),
            AMQPValue::LongString(LongString::from(env!("CARGO_PKG_VERSION"))),
        );
        properties.insert(
            ShortString::from("capabilities"),
            AMQPValue::FieldTable(capabilities),
        );

        properties
    }
}
