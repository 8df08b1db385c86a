// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel
//!
//! A channel is the session handle through which a client declares topology,
//! publishes, consumes and settles deliveries. It numbers its deliveries with
//! monotonically increasing tags starting at 1 and keeps a registry of the
//! tags it issued and has not seen settled yet.
//!
//! The channel registries are leaf locks: they are never held while a queue
//! lock is acquired. Settlement releases the tags from the registry first
//! and then resolves them on the owning queues.

use crate::{
    connection::ConnectionInner,
    consumer::Consumer,
    dispatcher::Settlement,
    engine::BrokerEngine,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Delivery, DeliveryTag, Message},
    otel,
    publisher::{Confirmation, ConfirmTracker, PublisherConfirm},
    queue::{ConsumerSlot, Queue, QueueBinding, QueueDefinition, QueueInfo},
    topology::Topology,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use opentelemetry::Context;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU16, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Prefix of server generated queue names.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";
/// Prefix of server generated consumer tags.
pub const GENERATED_CONSUMER_PREFIX: &str = "ctag-";

/// Lifecycle of a channel. Closing is immediate and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

pub(crate) struct ChannelInner {
    key: u64,
    number: u16,
    connection_id: u64,
    topology: Arc<Topology>,
    connection: Option<Weak<ConnectionInner>>,
    state: watch::Sender<ChannelState>,
    next_delivery_tag: AtomicU64,
    prefetch: AtomicU16,
    /// delivery tag -> queue
    unacked: Mutex<BTreeMap<DeliveryTag, String>>,
    /// consumer tag -> queue
    consumers: Mutex<HashMap<String, String>>,
    confirms: Mutex<Option<ConfirmTracker>>,
    confirms_drained: Notify,
}

impl ChannelInner {
    pub(crate) fn new(
        number: u16,
        connection_id: u64,
        prefetch: u16,
        topology: Arc<Topology>,
        connection: Weak<ConnectionInner>,
    ) -> Arc<Self> {
        Self::build(number, connection_id, prefetch, topology, Some(connection))
    }

    fn build(
        number: u16,
        connection_id: u64,
        prefetch: u16,
        topology: Arc<Topology>,
        connection: Option<Weak<ConnectionInner>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Open);

        Arc::new(ChannelInner {
            key: topology.next_channel_key(),
            number,
            connection_id,
            topology,
            connection,
            state,
            next_delivery_tag: AtomicU64::new(1),
            prefetch: AtomicU16::new(prefetch),
            unacked: Mutex::new(BTreeMap::new()),
            consumers: Mutex::new(HashMap::new()),
            confirms: Mutex::new(None),
            confirms_drained: Notify::new(),
        })
    }

    /// A channel that belongs to no connection.
    #[cfg(test)]
    pub(crate) fn detached(topology: Arc<Topology>) -> Arc<Self> {
        Self::build(1, 0, 0, topology, None)
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.state.borrow() == ChannelState::Open
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelClosed);
        }

        match &self.connection {
            Some(connection) => match connection.upgrade() {
                Some(connection) if connection.is_open() => Ok(()),
                _ => Err(AmqpError::ConnectionClosed),
            },
            None => Ok(()),
        }
    }

    pub(crate) fn next_delivery_tag(&self) -> DeliveryTag {
        self.next_delivery_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track(&self, tag: DeliveryTag, queue: &str) {
        self.unacked.lock().insert(tag, queue.to_owned());
    }

    pub(crate) fn untrack(&self, tag: DeliveryTag) {
        self.unacked.lock().remove(&tag);
    }

    pub(crate) fn forget_consumer(&self, consumer_tag: &str) {
        self.consumers.lock().remove(consumer_tag);
    }

    pub(crate) fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let released = self.release(tag, multiple)?;
        self.settle(released, Settlement::Ack)
    }

    pub(crate) fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let released = self.release(tag, multiple)?;

        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.settle(released, settlement)
    }

    /// Removes tags from the unacked registry, grouped by queue. With
    /// `multiple`, every tag up to and including `tag` is released, and a
    /// tag of 0 releases them all.
    fn release(
        &self,
        tag: DeliveryTag,
        multiple: bool,
    ) -> Result<BTreeMap<String, Vec<DeliveryTag>>, AmqpError> {
        let mut unacked = self.unacked.lock();

        let tags: Vec<DeliveryTag> = match (multiple, tag) {
            (true, 0) => unacked.keys().copied().collect(),
            (true, _) if unacked.contains_key(&tag) => {
                unacked.range(..=tag).map(|(t, _)| *t).collect()
            }
            (false, _) if unacked.contains_key(&tag) => vec![tag],
            _ => vec![],
        };

        if tags.is_empty() {
            warn!(delivery_tag = tag, "unknown delivery tag");
            return Err(AmqpError::InvalidDeliveryTag(tag));
        }

        let mut by_queue: BTreeMap<String, Vec<DeliveryTag>> = BTreeMap::new();
        for tag in tags {
            if let Some(queue) = unacked.remove(&tag) {
                by_queue.entry(queue).or_default().push(tag);
            }
        }

        Ok(by_queue)
    }

    /// Resolves released tags on their queues. Fails with the first tag that
    /// was no longer in flight: its queue was deleted or the consumer timeout
    /// requeued it in the meantime.
    fn settle(
        &self,
        released: BTreeMap<String, Vec<DeliveryTag>>,
        settlement: Settlement,
    ) -> Result<(), AmqpError> {
        let mut unresolved = Vec::new();

        for (name, tags) in released {
            match self.topology.queue(&name) {
                Some(queue) => {
                    unresolved.extend(queue.state.lock().settle(&name, self.key, &tags, settlement))
                }
                None => unresolved.extend(tags),
            }
        }

        match unresolved.first() {
            Some(tag) => {
                warn!(delivery_tag = *tag, "delivery is no longer in flight");
                Err(AmqpError::InvalidDeliveryTag(*tag))
            }
            None => Ok(()),
        }
    }

    /// Takes the head of `queue`. A tracked delivery taken while the channel
    /// was closing goes back to the queue.
    pub(crate) fn get(self: &Arc<Self>, queue: &Queue, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let name = queue.name();

        let Some(delivery) = queue.state.lock().get(name, self, no_ack) else {
            return Ok(None);
        };

        if no_ack || self.is_open() {
            return Ok(Some(delivery));
        }

        // close() may have drained the registry before the tag was tracked
        let tag = delivery.delivery_tag;
        if self.unacked.lock().remove(&tag).is_some() {
            let released = BTreeMap::from([(name.to_owned(), vec![tag])]);
            if self.settle(released, Settlement::Requeue).is_err() {
                debug!("delivery: {} was already requeued", tag);
            }
        }

        Err(AmqpError::ChannelClosed)
    }

    /// Cancels a consumer of this channel. Returns false when the tag is
    /// not registered.
    pub(crate) fn cancel_consumer(&self, consumer_tag: &str) -> bool {
        let queue = self.consumers.lock().remove(consumer_tag);

        match queue {
            Some(queue) => {
                debug!("cancelling consumer: {}", consumer_tag);
                self.cancel_on_queue(&queue, consumer_tag);
                true
            }
            None => false,
        }
    }

    /// Removes a consumer from its queue. An auto-delete queue that loses its
    /// last consumer is deleted.
    fn cancel_on_queue(&self, queue_name: &str, consumer_tag: &str) {
        let Some(queue) = self.topology.queue(queue_name) else {
            return;
        };

        let (cancelled, unused) = {
            let mut state = queue.state.lock();
            let cancelled = state.cancel(queue_name, self.key, consumer_tag);
            (cancelled, state.consumers.is_empty())
        };

        if cancelled && unused && queue.definition.auto_delete {
            self.topology.delete_if_unused(queue_name);
        }
    }

    /// Closes the channel. Consumers are cancelled and every delivery still
    /// unsettled is requeued. Returns false when already closed.
    pub(crate) fn close(&self) -> bool {
        let closed = self.state.send_if_modified(|state| match state {
            ChannelState::Open => {
                *state = ChannelState::Closed;
                true
            }
            ChannelState::Closed => false,
        });

        if !closed {
            return false;
        }

        debug!("closing channel: {}", self.number);

        let consumers: Vec<(String, String)> = self.consumers.lock().drain().collect();
        for (consumer_tag, queue) in consumers {
            self.cancel_on_queue(&queue, &consumer_tag);
        }

        // deliveries taken with basic_get
        let leftover = {
            let mut unacked = self.unacked.lock();
            let mut by_queue: BTreeMap<String, Vec<DeliveryTag>> = BTreeMap::new();
            for (tag, queue) in std::mem::take(&mut *unacked) {
                by_queue.entry(queue).or_default().push(tag);
            }
            by_queue
        };
        if self.settle(leftover, Settlement::Requeue).is_err() {
            debug!("channel: {} had deliveries settled elsewhere", self.number);
        }

        if let Some(tracker) = self.confirms.lock().as_mut() {
            tracker.fail_all(AmqpError::ChannelClosed);
        }
        self.confirms_drained.notify_waiters();

        if let Some(connection) = self.connection.as_ref().and_then(Weak::upgrade) {
            connection.detach(self.number, self.key);
        }

        true
    }

    fn resolve_confirm(&self, sequence: u64, result: Result<Confirmation, AmqpError>) {
        let mut confirms = self.confirms.lock();

        if let Some(tracker) = confirms.as_mut() {
            tracker.resolve(sequence, result);
            if tracker.is_drained() {
                self.confirms_drained.notify_waiters();
            }
        }
    }
}

/// A session on a connection.
///
/// `Channel` is a cheap handle; clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.number)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Channel { inner }
    }

    /// The channel number on its connection.
    pub fn id(&self) -> u16 {
        self.inner.number
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Subscribes to state changes of this channel.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the channel is closed.
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        if state
            .wait_for(|state| *state == ChannelState::Closed)
            .await
            .is_err()
        {
            debug!("channel state dropped");
        }
    }

    /// Number of deliveries issued by this channel and not settled yet.
    pub fn unacked_count(&self) -> usize {
        self.inner.unacked.lock().len()
    }

    /// Default prefetch applied to consumers created from now on.
    pub fn prefetch(&self) -> u16 {
        self.inner.prefetch.load(Ordering::Relaxed)
    }

    /// Whether `confirm_select` was called on this channel.
    pub fn is_confirm_mode(&self) -> bool {
        self.inner.confirms.lock().is_some()
    }

    /// Puts the channel in confirm mode. Calling it again is a no-op.
    pub async fn confirm_select(&self, _options: ConfirmSelectOptions) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        let mut confirms = self.inner.confirms.lock();
        if confirms.is_none() {
            debug!("channel: {} in confirm mode", self.inner.number);
            *confirms = Some(ConfirmTracker::default());
        }

        Ok(())
    }

    /// Waits until every publish made in confirm mode was confirmed.
    pub async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        loop {
            let drained = self.inner.confirms_drained.notified();

            {
                let confirms = self.inner.confirms.lock();
                match confirms.as_ref() {
                    None => return Ok(()),
                    Some(_) if !self.inner.is_open() => return Err(AmqpError::ChannelClosed),
                    Some(tracker) if tracker.is_drained() => return Ok(()),
                    Some(_) => {}
                }
            }

            drained.await;
        }
    }
}

#[async_trait]
impl BrokerEngine for Channel {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        if options.passive {
            return match self.inner.topology.exchange(exchange) {
                Some(_) => Ok(()),
                None => Err(AmqpError::NotFound(format!("exchange `{exchange}`"))),
            };
        }

        let def = ExchangeDefinition::new(exchange)
            .kind(kind)
            .durable(options.durable)
            .auto_delete(options.auto_delete)
            .internal(options.internal)
            .params(arguments);

        debug!("declaring exchange: {} of kind: {}", exchange, kind);
        self.inner.topology.declare_exchange(def).map_err(|err| {
            error!(error = err.to_string(), "failure to declare exchange");
            err
        })
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;
        self.inner.topology.delete_exchange(exchange, options.if_unused)
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        self.inner.ensure_open()?;

        if options.passive {
            let queue = self
                .inner
                .topology
                .accessible_queue(queue, self.inner.connection_id)?;
            return Ok(queue.info());
        }

        let name = if queue.is_empty() {
            format!("{GENERATED_QUEUE_PREFIX}{}", Uuid::new_v4())
        } else {
            queue.to_owned()
        };

        let def = QueueDefinition::new(&name)
            .durable(options.durable)
            .auto_delete(options.auto_delete)
            .exclusive(options.exclusive)
            .params(arguments);

        debug!("declaring queue: {}", name);
        self.inner
            .topology
            .declare_queue(def, self.inner.connection_id)
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare queue");
                err
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;
        self.inner
            .topology
            .accessible_queue(queue, self.inner.connection_id)?;

        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key)
            .arguments(arguments);

        self.inner.topology.bind(binding).map_err(|err| {
            error!(error = err.to_string(), "error to bind queue");
            err
        })
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key)
            .arguments(arguments);

        self.inner.topology.unbind(&binding)
    }

    async fn queue_purge(&self, queue: &str, _options: QueuePurgeOptions) -> Result<u32, AmqpError> {
        self.inner.ensure_open()?;
        self.inner
            .topology
            .accessible_queue(queue, self.inner.connection_id)?;
        self.inner.topology.purge_queue(queue)
    }

    async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32, AmqpError> {
        self.inner.ensure_open()?;
        self.inner
            .topology
            .accessible_queue(queue, self.inner.connection_id)?;
        self.inner
            .topology
            .delete_queue(queue, options.if_unused, options.if_empty)
    }

    async fn basic_qos(&self, prefetch_count: u16, _options: BasicQosOptions) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;
        self.inner.prefetch.store(prefetch_count, Ordering::Relaxed);

        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublisherConfirm, AmqpError> {
        self.inner.ensure_open()?;

        let properties = otel::inject_context(&Context::current(), properties);
        let message = Message::new(exchange, routing_key, payload, properties);
        let pending = self.inner.confirms.lock().as_mut().map(ConfirmTracker::register);

        match self.inner.topology.publish(message, options.mandatory) {
            Ok(routed) => Ok(match pending {
                Some((sequence, receiver)) => {
                    self.inner.resolve_confirm(sequence, Ok(Confirmation::Ack));
                    PublisherConfirm::pending(sequence, routed > 0, receiver)
                }
                None => PublisherConfirm::not_requested(routed > 0),
            }),
            Err(err) => {
                if let Some((sequence, _)) = pending {
                    self.inner.resolve_confirm(sequence, Err(err.clone()));
                }
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> Result<Consumer, AmqpError> {
        self.inner.ensure_open()?;

        let target = self
            .inner
            .topology
            .accessible_queue(queue, self.inner.connection_id)?;

        let tag = if consumer_tag.is_empty() {
            format!("{GENERATED_CONSUMER_PREFIX}{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        {
            let mut consumers = self.inner.consumers.lock();
            if consumers.contains_key(&tag) {
                return Err(AmqpError::AccessRefused(format!(
                    "consumer tag `{tag}` is already in use on channel {}",
                    self.inner.number
                )));
            }
            consumers.insert(tag.clone(), queue.to_owned());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let slot = ConsumerSlot {
            tag: tag.clone(),
            channel: self.inner.clone(),
            prefetch: self.inner.prefetch.load(Ordering::Relaxed),
            exclusive: options.exclusive,
            no_ack: options.no_ack,
            unacked: 0,
            last_served: 0,
            sender,
        };

        let registered = {
            let mut state = target.state.lock();
            if state.deleted {
                Err(AmqpError::NotFound(format!("queue `{queue}`")))
            } else {
                state.register(queue, slot)
            }
        };

        if let Err(err) = registered {
            self.inner.forget_consumer(&tag);
            error!(error = err.to_string(), "error to create the consumer");
            return Err(err);
        }

        // the channel may have been closed while registering
        if !self.inner.is_open() {
            self.inner.cancel_on_queue(queue, &tag);
            return Err(AmqpError::ChannelClosed);
        }

        debug!("consumer: {} started on queue: {}", tag, queue);
        Ok(Consumer::new(tag, queue, receiver).owned_by(&self.inner))
    }

    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<Delivery>, AmqpError> {
        self.inner.ensure_open()?;

        let target = self
            .inner
            .topology
            .accessible_queue(queue, self.inner.connection_id)?;

        self.inner.get(&target, options.no_ack)
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.inner.ack(delivery_tag, options.multiple)
    }

    async fn basic_nack(&self, delivery_tag: DeliveryTag, options: BasicNackOptions) -> Result<(), AmqpError> {
        self.inner
            .nack(delivery_tag, options.multiple, options.requeue)
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.inner.nack(delivery_tag, false, options.requeue)
    }

    async fn basic_cancel(&self, consumer_tag: &str, _options: BasicCancelOptions) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        if !self.inner.cancel_consumer(consumer_tag) {
            debug!("consumer: {} is not registered", consumer_tag);
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close();
        Ok(())
    }
}
