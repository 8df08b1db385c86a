// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirms
//!
//! A channel in confirm mode numbers every publish with a sequence number
//! starting at 1 and resolves a `PublisherConfirm` once the message has been
//! accepted by every matched queue. Confirms still pending when the channel
//! closes fail with `ChannelClosed`.

use crate::errors::AmqpError;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Accepted by every matched queue.
    Ack,
    /// Refused by the broker. The engine itself never refuses a publish it
    /// accepted; the variant exists for adapters relaying a remote broker.
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack)
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, Confirmation::Nack)
    }
}

type ConfirmResult = Result<Confirmation, AmqpError>;

/// Returned by `basic_publish`. Awaiting it yields the publish confirmation.
///
/// Outside of confirm mode it resolves immediately to
/// `Confirmation::NotRequested`.
#[derive(Debug)]
pub struct PublisherConfirm {
    routed: bool,
    sequence: Option<u64>,
    receiver: Option<oneshot::Receiver<ConfirmResult>>,
}

impl PublisherConfirm {
    pub(crate) fn not_requested(routed: bool) -> Self {
        PublisherConfirm {
            routed,
            sequence: None,
            receiver: None,
        }
    }

    pub(crate) fn pending(
        sequence: u64,
        routed: bool,
        receiver: oneshot::Receiver<ConfirmResult>,
    ) -> Self {
        PublisherConfirm {
            routed,
            sequence: Some(sequence),
            receiver: Some(receiver),
        }
    }

    /// Whether the message reached at least one queue.
    pub fn is_routed(&self) -> bool {
        self.routed
    }

    /// Confirm sequence number, set in confirm mode only.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }
}

impl Future for PublisherConfirm {
    type Output = ConfirmResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.as_mut() {
            None => Poll::Ready(Ok(Confirmation::NotRequested)),
            Some(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(AmqpError::ChannelClosed))),
        }
    }
}

/// Confirm mode bookkeeping of one channel.
#[derive(Debug, Default)]
pub(crate) struct ConfirmTracker {
    last_sequence: u64,
    pending: BTreeMap<u64, oneshot::Sender<ConfirmResult>>,
}

impl ConfirmTracker {
    /// Allocates the next sequence number.
    pub(crate) fn register(&mut self) -> (u64, oneshot::Receiver<ConfirmResult>) {
        self.last_sequence += 1;
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(self.last_sequence, sender);

        (self.last_sequence, receiver)
    }

    pub(crate) fn resolve(&mut self, sequence: u64, result: ConfirmResult) {
        if let Some(sender) = self.pending.remove(&sequence) {
            // the publisher may have dropped its confirm
            let _ = sender.send(result);
        }
    }

    /// Fails every pending confirm.
    pub(crate) fn fail_all(&mut self, err: AmqpError) {
        for (_, sender) in std::mem::take(&mut self.pending) {
            let _ = sender.send(Err(err.clone()));
        }
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_start_at_one() {
        let mut tracker = ConfirmTracker::default();

        let (first, rx_first) = tracker.register();
        let (second, rx_second) = tracker.register();
        assert_eq!((first, second), (1, 2));
        assert!(!tracker.is_drained());

        tracker.resolve(second, Ok(Confirmation::Ack));
        tracker.resolve(first, Ok(Confirmation::Nack));
        assert!(tracker.is_drained());

        let second = PublisherConfirm::pending(2, true, rx_second);
        assert_eq!(second.sequence(), Some(2));
        assert_eq!(second.await, Ok(Confirmation::Ack));
        assert!(PublisherConfirm::pending(1, true, rx_first)
            .await
            .unwrap()
            .is_nack());
    }

    #[tokio::test]
    async fn pending_confirms_fail_when_abandoned() {
        let mut tracker = ConfirmTracker::default();
        let (seq, rx) = tracker.register();
        let (_, dropped) = tracker.register();

        tracker.fail_all(AmqpError::ChannelClosed);

        assert_eq!(
            PublisherConfirm::pending(seq, true, rx).await,
            Err(AmqpError::ChannelClosed)
        );
        drop(tracker);
        assert_eq!(
            PublisherConfirm::pending(2, false, dropped).await,
            Err(AmqpError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn confirm_outside_confirm_mode_is_not_requested() {
        let confirm = PublisherConfirm::not_requested(false);

        assert!(!confirm.is_routed());
        assert_eq!(confirm.sequence(), None);
        assert_eq!(confirm.await, Ok(Confirmation::NotRequested));
    }
}
