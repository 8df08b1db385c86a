// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! A `Message` is what a queue buffers. A `Delivery` is a message handed to a
//! consumer under a channel-scoped delivery tag, together with an `Acker`
//! that settles it through the owning channel.

use crate::{channel::ChannelInner, errors::AmqpError, otel};
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    types::FieldTable,
    BasicProperties,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    Context,
};
use std::{fmt, sync::Arc};

/// Channel-scoped, monotonically increasing delivery identifier.
pub type DeliveryTag = u64;

/// A published message as buffered by a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, data: &[u8], properties: BasicProperties) -> Self {
        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: data.to_vec(),
            redelivered: false,
        }
    }

    pub(crate) fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }
}

/// Settles a delivery through the channel that received it.
///
/// Deliveries taken with `no_ack` carry an acker without a channel; settling
/// them is a no-op.
#[derive(Clone, Default)]
pub struct Acker {
    delivery_tag: DeliveryTag,
    channel: Option<Arc<ChannelInner>>,
}

impl Acker {
    pub(crate) fn new(delivery_tag: DeliveryTag, channel: Option<Arc<ChannelInner>>) -> Self {
        Acker {
            delivery_tag,
            channel,
        }
    }

    pub async fn ack(&self, options: BasicAckOptions) -> Result<(), AmqpError> {
        match &self.channel {
            Some(channel) => channel.ack(self.delivery_tag, options.multiple),
            None => Ok(()),
        }
    }

    pub async fn nack(&self, options: BasicNackOptions) -> Result<(), AmqpError> {
        match &self.channel {
            Some(channel) => channel.nack(self.delivery_tag, options.multiple, options.requeue),
            None => Ok(()),
        }
    }

    pub async fn reject(&self, options: BasicRejectOptions) -> Result<(), AmqpError> {
        match &self.channel {
            Some(channel) => channel.nack(self.delivery_tag, false, options.requeue),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("delivery_tag", &self.delivery_tag)
            .field("tracked", &self.channel.is_some())
            .finish()
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub consumer_tag: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub acker: Acker,
}

impl Delivery {
    pub(crate) fn new(
        delivery_tag: DeliveryTag,
        consumer_tag: Option<String>,
        message: &Message,
        acker: Acker,
    ) -> Self {
        Delivery {
            delivery_tag,
            consumer_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            data: message.data.clone(),
            acker,
        }
    }

    pub async fn ack(&self, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.acker.ack(options).await
    }

    pub async fn nack(&self, options: BasicNackOptions) -> Result<(), AmqpError> {
        self.acker.nack(options).await
    }

    pub async fn reject(&self, options: BasicRejectOptions) -> Result<(), AmqpError> {
        self.acker.reject(options).await
    }

    /// Trace context propagated by the publisher, if any.
    pub fn context(&self) -> Context {
        otel::extract_context(&self.properties)
    }

    /// Starts a consumer span that continues the publisher's trace.
    pub fn span(&self, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
        otel::new_span(&self.properties, tracer, name)
    }
}
