// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory AMQP 0-9-1 broker engine: exchanges, queues, bindings, routing
//! and consumer delivery with acknowledgement and requeue semantics.

mod dispatcher;
mod otel;
mod router;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use broker::Broker;
pub use channel::{Channel, ChannelState};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use consumer::{Consumer, ConsumerDelegate};
pub use engine::BrokerEngine;
pub use errors::{AmqpError, AmqpResult};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use message::{Acker, Delivery, DeliveryTag, Message};
pub use publisher::{Confirmation, PublisherConfirm};
pub use queue::{QueueBinding, QueueDefinition, QueueInfo};
pub use router::{headers_match, topic_matches, HeadersMatch};
pub use topology::Topology;
