// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Engine
//!
//! Every engine operation reports exactly one of the `AmqpError` kinds below.
//! Errors are returned synchronously from the call that caused them and each
//! one names the queue, exchange, consumer or delivery tag involved.

use thiserror::Error;

/// Represents errors that can occur during broker engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Redeclaration with incompatible parameters, an invalid binding
    /// argument mode or an unmet delete precondition.
    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    /// The referenced queue, exchange or consumer does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ack, nack or reject on a tag this channel never issued or already resolved.
    #[error("unknown delivery tag `{0}`")]
    InvalidDeliveryTag(u64),

    /// Exclusivity conflicts and operations on reserved entities.
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// A mandatory publish matched no queue.
    #[error("message to exchange `{exchange}` with routing key `{routing_key}` is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// The owning connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Error loading connection configuration
    #[error("failure to load configuration `{0}`")]
    ConfigError(String),
}

/// Result alias used across the engine.
pub type AmqpResult<T> = Result<T, AmqpError>;
