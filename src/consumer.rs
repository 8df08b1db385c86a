// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A `Consumer` is the stream of deliveries the dispatcher hands to one
//! consumer registration. It ends when the consumer is cancelled, its
//! channel closes or its queue is deleted.
//!
//! Deliveries can be pulled with `StreamExt::next` or pushed to a
//! `ConsumerDelegate` running on a spawned task. Dropping a `Consumer`
//! cancels it, requeueing whatever it had not settled.

use crate::{channel::ChannelInner, errors::AmqpError, message::Delivery};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

/// Handles deliveries pushed by a consumer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerDelegate: Send + Sync {
    /// Called once per delivery, in delivery order. An error is logged and
    /// does not stop the consumer; settling the delivery is up to the
    /// delegate.
    async fn on_new_delivery(&self, delivery: Delivery) -> Result<(), AmqpError>;
}

#[async_trait]
impl<F, Fut> ConsumerDelegate for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn on_new_delivery(&self, delivery: Delivery) -> Result<(), AmqpError> {
        self(delivery).await
    }
}

/// Stream of deliveries for one consumer registration, as returned by
/// `basic_consume`.
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    channel: Weak<ChannelInner>,
}

impl Consumer {
    pub(crate) fn new(tag: String, queue: &str, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Consumer {
            tag,
            queue: queue.to_owned(),
            receiver,
            channel: Weak::new(),
        }
    }

    /// Ties the consumer to the channel that registered it, so that dropping
    /// it cancels the registration.
    pub(crate) fn owned_by(mut self, channel: &Arc<ChannelInner>) -> Self {
        self.channel = Arc::downgrade(channel);
        self
    }

    /// The consumer tag, unique on its channel.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Name of the queue this consumer reads from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Drives the consumer on a new task, handing each delivery to
    /// `delegate` in order. The task ends with the stream.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Parameters
    /// * `delegate` - Handler invoked for every delivery
    ///
    /// # Returns
    /// The handle of the spawned task
    pub fn set_delegate<D>(self, delegate: D) -> JoinHandle<()>
    where
        D: ConsumerDelegate + 'static,
    {
        let mut consumer = self;

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let tag = delivery.delivery_tag;
                if let Err(err) = delegate.on_new_delivery(delivery).await {
                    error!(error = err.to_string(), delivery_tag = tag, "error consume msg");
                }
            }

            debug!("consumer: {} stream ended", consumer.tag);
        })
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            if channel.cancel_consumer(&self.tag) {
                debug!("consumer: {} dropped", self.tag);
            }
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .finish()
    }
}
