// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Engine Contract
//!
//! The channel-level operations a broker client relies on. The in-memory
//! `Channel` implements it; a transport speaking the wire protocol to a real
//! broker can implement the same contract, so client code can be exercised
//! against either.

use crate::{
    consumer::Consumer,
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, DeliveryTag},
    publisher::PublisherConfirm,
    queue::QueueInfo,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    BasicProperties,
};

/// Channel-level broker operations.
#[async_trait]
pub trait BrokerEngine: Send + Sync {
    /// Declares an exchange. Redeclaring with a different kind or durability
    /// fails with `TopologyConflict`.
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Deletes an exchange and all of its bindings.
    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError>;

    /// Declares a queue, returning its message and consumer counts. An empty
    /// name asks the broker to generate one.
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Drops the ready messages of a queue, returning how many were dropped.
    async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<u32, AmqpError>;

    /// Deletes a queue. Its messages are discarded, including the ones
    /// delivered and not acknowledged yet; they cannot be recovered.
    async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32, AmqpError>;

    /// Sets the prefetch limit of consumers created afterwards on this channel.
    async fn basic_qos(&self, prefetch_count: u16, options: BasicQosOptions) -> Result<(), AmqpError>;

    /// Publishes a message. The returned confirm reports whether the message
    /// was routed and, in confirm mode, resolves once it was accepted.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublisherConfirm, AmqpError>;

    /// Starts a consumer. An empty tag asks the broker to generate one.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Consumer, AmqpError>;

    /// Takes one ready message outside of any consumer.
    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<Delivery>, AmqpError>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag, options: BasicAckOptions) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: DeliveryTag, options: BasicNackOptions) -> Result<(), AmqpError>;

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError>;

    /// Cancels a consumer. Unknown tags are ignored.
    async fn basic_cancel(&self, consumer_tag: &str, options: BasicCancelOptions) -> Result<(), AmqpError>;

    /// Closes the channel. Closing twice is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Publishes straight to a queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublisherConfirm, AmqpError> {
        self.basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
    }
}
