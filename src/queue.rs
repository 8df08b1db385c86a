// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues and Queue Bindings
//!
//! This module holds the declared queue record, the binding record and the
//! per-queue mutable state: the FIFO ready sequence, the registered
//! consumers and the in-flight (delivered but unacknowledged) messages.
//! Every mutation of a queue happens behind its own mutex, which makes the
//! queue the unit of mutual exclusion for enqueue, dispatch and settlement.

use crate::{
    channel::ChannelInner,
    message::{Delivery, DeliveryTag, Message},
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio::sync::mpsc;

/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) max_length: Option<usize>,
    pub(crate) params: FieldTable,
}

impl QueueDefinition {
    /// Creates a new non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            max_length: None,
            params: FieldTable::default(),
        }
    }

    /// Durable queues are flagged as such; the engine keeps everything in memory.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are deleted when that connection closes.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Sets the maximum number of ready messages the queue holds. When the
    /// limit is exceeded the oldest ready message is dropped.
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self.params.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongLongInt(max as i64),
        );
        self
    }

    /// Sets the queue arguments. Recognised arguments (`x-max-length`) are
    /// applied, everything else is recorded as is.
    pub fn params(mut self, params: FieldTable) -> Self {
        self.max_length = params
            .inner()
            .get(AMQP_HEADERS_MAX_LENGTH)
            .and_then(as_length);
        self.params = params;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn conflicts_with(&self, other: &QueueDefinition) -> Option<String> {
        if self.durable != other.durable {
            return Some(format!(
                "queue `{}` already declared with durable={} (requested {})",
                self.name, self.durable, other.durable
            ));
        }

        None
    }
}

fn as_length(value: &AMQPValue) -> Option<usize> {
    let length = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    usize::try_from(length).ok()
}

/// Configuration for binding a queue to an exchange.
///
/// Multiple bindings between the same exchange and queue with different
/// routing keys or arguments are independent of each other.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

impl QueueBinding {
    /// Creates a new binding for the given queue with an empty exchange name
    /// and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            arguments: FieldTable::default(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key (or topic pattern) for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets the binding arguments, used by headers exchanges.
    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// Counters returned by queue declaration and inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A consumer registration on a queue.
pub(crate) struct ConsumerSlot {
    pub(crate) tag: String,
    pub(crate) channel: Arc<ChannelInner>,
    pub(crate) prefetch: u16,
    pub(crate) exclusive: bool,
    pub(crate) no_ack: bool,
    pub(crate) unacked: usize,
    pub(crate) last_served: u64,
    pub(crate) sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    pub(crate) fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }

    pub(crate) fn is(&self, channel_key: u64, tag: &str) -> bool {
        self.channel.key() == channel_key && self.tag == tag
    }
}

/// A delivered message awaiting settlement.
pub(crate) struct InFlight {
    pub(crate) message: Message,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) channel: Arc<ChannelInner>,
    pub(crate) delivered_at: Instant,
}

/// Mutable state of one queue. A message lives either in `ready` or in
/// `in_flight`, keyed by the delivering channel and its delivery tag.
#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) ready: VecDeque<Message>,
    pub(crate) consumers: Vec<ConsumerSlot>,
    pub(crate) in_flight: HashMap<(u64, DeliveryTag), InFlight>,
    pub(crate) serve_counter: u64,
    pub(crate) deleted: bool,
}

impl QueueState {
    /// Appends to the ready sequence, dropping the oldest ready message when
    /// the queue length limit is exceeded.
    pub(crate) fn enqueue(&mut self, max_length: Option<usize>, message: Message) {
        self.ready.push_back(message);

        if let Some(max) = max_length {
            while self.ready.len() > max {
                self.ready.pop_front();
            }
        }
    }

    /// Discards everything the queue holds and closes its consumers' streams.
    /// Returns the number of ready messages dropped.
    pub(crate) fn discard(&mut self) -> u32 {
        let dropped = self.ready.len();

        for ((_, tag), in_flight) in self.in_flight.drain() {
            in_flight.channel.untrack(tag);
        }

        for slot in self.consumers.drain(..) {
            slot.channel.forget_consumer(&slot.tag);
        }

        self.ready.clear();
        self.deleted = true;

        u32::try_from(dropped).unwrap_or(u32::MAX)
    }
}

/// A queue as held by the topology store.
pub(crate) struct Queue {
    pub(crate) definition: QueueDefinition,
    pub(crate) owner: Option<u64>,
    pub(crate) state: Mutex<QueueState>,
}

impl Queue {
    pub(crate) fn new(definition: QueueDefinition, owner: Option<u64>) -> Self {
        Queue {
            definition,
            owner,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.definition.name
    }

    pub(crate) fn info(&self) -> QueueInfo {
        let state = self.state.lock();

        QueueInfo {
            name: self.definition.name.clone(),
            message_count: u32::try_from(state.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(state.consumers.len()).unwrap_or(u32::MAX),
        }
    }
}
