// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! Hands ready messages to the consumers registered on a queue and resolves
//! acknowledgements, rejections and requeues. All functions here operate on
//! a `QueueState` whose mutex the caller holds.
//!
//! Dispatch picks, among the consumers that still have prefetch capacity,
//! the one served least recently. Handing a delivery over is a non-blocking
//! channel send, so a slow consumer never stalls the queue.

use crate::{
    channel::ChannelInner,
    errors::AmqpError,
    message::{Acker, Delivery, DeliveryTag, Message},
    queue::{ConsumerSlot, InFlight, QueueState},
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// How a set of in-flight deliveries is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Requeue,
    Discard,
}

impl QueueState {
    /// Registers a consumer, enforcing consumer exclusivity.
    pub(crate) fn register(&mut self, queue: &str, slot: ConsumerSlot) -> Result<(), AmqpError> {
        if self.consumers.iter().any(|c| c.exclusive) {
            return Err(AmqpError::AccessRefused(format!(
                "queue `{queue}` has an exclusive consumer"
            )));
        }

        if slot.exclusive && !self.consumers.is_empty() {
            return Err(AmqpError::AccessRefused(format!(
                "cannot consume exclusively from queue `{queue}`, it already has consumers"
            )));
        }

        debug!("consumer: {} registered on queue: {}", slot.tag, queue);
        self.consumers.push(slot);
        self.dispatch(queue);

        Ok(())
    }

    /// Delivers ready messages until the queue is empty or no consumer has
    /// capacity left.
    pub(crate) fn dispatch(&mut self, queue: &str) {
        while !self.ready.is_empty() {
            let Some(idx) = self.next_eligible() else {
                break;
            };

            let Some(message) = self.ready.pop_front() else {
                break;
            };

            if let Err(message) = self.deliver(queue, idx, message) {
                // the consumer's stream was dropped
                self.ready.push_front(message);
                let slot = self.consumers.remove(idx);
                debug!("consumer: {} went away, removing it", slot.tag);
                slot.channel.forget_consumer(&slot.tag);
                self.requeue_consumer(slot.channel.key(), &slot.tag);
            }
        }
    }

    fn next_eligible(&self) -> Option<usize> {
        self.consumers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.has_capacity() && slot.channel.is_open())
            .min_by_key(|(_, slot)| slot.last_served)
            .map(|(idx, _)| idx)
    }

    fn deliver(&mut self, queue: &str, idx: usize, message: Message) -> Result<(), Message> {
        self.serve_counter += 1;
        let slot = &mut self.consumers[idx];
        slot.last_served = self.serve_counter;

        let channel = slot.channel.clone();
        let tag = channel.next_delivery_tag();

        if slot.no_ack {
            let delivery = Delivery::new(tag, Some(slot.tag.clone()), &message, Acker::new(tag, None));
            return slot.sender.send(delivery).map_err(|_| message);
        }

        channel.track(tag, queue);
        let acker = Acker::new(tag, Some(channel.clone()));
        let delivery = Delivery::new(tag, Some(slot.tag.clone()), &message, acker);

        if slot.sender.send(delivery).is_err() {
            channel.untrack(tag);
            return Err(message);
        }

        slot.unacked += 1;
        let consumer_tag = Some(slot.tag.clone());
        self.in_flight.insert(
            (channel.key(), tag),
            InFlight {
                message,
                consumer_tag,
                channel,
                delivered_at: Instant::now(),
            },
        );

        Ok(())
    }

    /// Takes the head of the ready sequence outside of any consumer.
    pub(crate) fn get(
        &mut self,
        queue: &str,
        channel: &Arc<ChannelInner>,
        no_ack: bool,
    ) -> Option<Delivery> {
        let message = self.ready.pop_front()?;
        let tag = channel.next_delivery_tag();

        if no_ack {
            return Some(Delivery::new(tag, None, &message, Acker::new(tag, None)));
        }

        channel.track(tag, queue);
        let delivery = Delivery::new(tag, None, &message, Acker::new(tag, Some(channel.clone())));

        self.in_flight.insert(
            (channel.key(), tag),
            InFlight {
                message,
                consumer_tag: None,
                channel: channel.clone(),
                delivered_at: Instant::now(),
            },
        );

        Some(delivery)
    }

    /// Resolves deliveries the channel has already released from its own
    /// unacked registry, then redispatches into the freed capacity.
    ///
    /// Returns the tags that were no longer in flight, e.g. because the
    /// consumer timeout requeued them first.
    pub(crate) fn settle(
        &mut self,
        queue: &str,
        channel_key: u64,
        tags: &[DeliveryTag],
        settlement: Settlement,
    ) -> Vec<DeliveryTag> {
        let mut taken = Vec::with_capacity(tags.len());
        let mut unresolved = Vec::new();

        for tag in tags {
            match self.take_in_flight(channel_key, *tag) {
                Some(in_flight) => taken.push((*tag, in_flight)),
                None => unresolved.push(*tag),
            }
        }

        match settlement {
            Settlement::Ack | Settlement::Discard => {}
            Settlement::Requeue => self.push_front_in_order(taken),
        }

        self.dispatch(queue);

        unresolved
    }

    /// Removes a consumer, requeueing everything it still holds. Returns
    /// whether the consumer was registered here.
    pub(crate) fn cancel(&mut self, queue: &str, channel_key: u64, consumer_tag: &str) -> bool {
        let Some(idx) = self
            .consumers
            .iter()
            .position(|slot| slot.is(channel_key, consumer_tag))
        else {
            return false;
        };

        self.consumers.remove(idx);
        self.requeue_consumer(channel_key, consumer_tag);
        debug!("consumer: {} removed from queue: {}", consumer_tag, queue);
        self.dispatch(queue);

        true
    }

    /// Requeues in-flight deliveries older than `timeout`, invalidating their
    /// delivery tags on the owning channels.
    pub(crate) fn requeue_expired(&mut self, queue: &str, timeout: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, DeliveryTag)> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| now.duration_since(in_flight.delivered_at) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        let count = expired.len();
        let mut taken = Vec::with_capacity(count);

        for (channel_key, tag) in expired {
            if let Some(in_flight) = self.take_in_flight(channel_key, tag) {
                in_flight.channel.untrack(tag);
                taken.push((tag, in_flight));
            }
        }

        if count > 0 {
            debug!("requeueing {} expired deliveries on queue: {}", count, queue);
        }

        self.push_front_in_order(taken);
        self.dispatch(queue);

        count
    }

    fn requeue_consumer(&mut self, channel_key: u64, consumer_tag: &str) {
        let keys: Vec<(u64, DeliveryTag)> = self
            .in_flight
            .iter()
            .filter(|((key, _), in_flight)| {
                *key == channel_key && in_flight.consumer_tag.as_deref() == Some(consumer_tag)
            })
            .map(|(key, _)| *key)
            .collect();

        let mut taken = Vec::with_capacity(keys.len());
        for (key, tag) in keys {
            if let Some(in_flight) = self.in_flight.remove(&(key, tag)) {
                in_flight.channel.untrack(tag);
                taken.push((tag, in_flight));
            }
        }

        self.push_front_in_order(taken);
    }

    fn take_in_flight(&mut self, channel_key: u64, tag: DeliveryTag) -> Option<InFlight> {
        let in_flight = self.in_flight.remove(&(channel_key, tag))?;

        if let Some(consumer_tag) = &in_flight.consumer_tag {
            if let Some(slot) = self
                .consumers
                .iter_mut()
                .find(|slot| slot.is(channel_key, consumer_tag))
            {
                slot.unacked = slot.unacked.saturating_sub(1);
            }
        }

        Some(in_flight)
    }

    /// Returns messages to the front of the ready sequence so that the
    /// earliest delivered one is redelivered first.
    fn push_front_in_order(&mut self, mut taken: Vec<(DeliveryTag, InFlight)>) {
        taken.sort_by(|(a_tag, a), (b_tag, b)| {
            a.delivered_at.cmp(&b.delivered_at).then(a_tag.cmp(b_tag))
        });

        for (_, in_flight) in taken.into_iter().rev() {
            let mut message = in_flight.message;
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}
