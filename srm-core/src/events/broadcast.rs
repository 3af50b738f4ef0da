//! A broadcast event source based on [`async_broadcast`]

use std::pin::Pin;

use async_broadcast::TrySendError;
use derive_where::derive_where;

/// An event source implementation based on the [`async_broadcast`]
/// channels.
///
/// When the internal queue is full, the oldest event will be dropped, so a
/// stalled subscriber never blocks the thread that emits events.
#[derive(Debug)]
#[derive_where(Clone)]
pub struct Ring<E>(
    async_broadcast::Sender<E>,
    async_broadcast::InactiveReceiver<E>,
);

impl<E> Ring<E> {
    /// Create a new ring broadcast event source
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity);
        tx.set_await_active(false);
        tx.set_overflow(true);
        Self(tx, rx.deactivate())
    }

    /// Change the number of events the ring event source can hold
    pub fn set_capacity(&mut self, capacity: usize) {
        self.0.set_capacity(capacity);
    }

    /// Number of subscribers currently listening
    pub fn receiver_count(&self) -> usize {
        self.0.receiver_count()
    }
}

impl<E: Clone> Ring<E> {
    /// Send a new event to all receivers
    pub fn broadcast(&self, msg: E) {
        // The sender is never closed because we hold an inactive receiver.
        debug_assert!(!self.0.is_closed());
        match self.0.try_broadcast(msg) {
            // No active receiver, nobody cares.
            Ok(_) | Err(TrySendError::Inactive(_)) => (),
            Err(e) => tracing::warn!("Failed to broadcast event: {e}"),
        }
    }
}

/// The event stream for [`Ring`] event sources
///
/// A wrapper of the broadcast receiver that deactivates the
/// receiver, without closing the sender, when dropped.
#[derive(Debug)]
pub struct Receiver<E>(Option<async_broadcast::Receiver<E>>);
impl<E> Drop for Receiver<E> {
    fn drop(&mut self) {
        if let Some(receiver) = self.0.take() {
            receiver.deactivate();
        }
    }
}
impl<E: Clone + 'static> futures_core::Stream for Receiver<E> {
    type Item = E;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.0.as_mut() {
            Some(this) => Pin::new(this).poll_next(cx),
            None => std::task::Poll::Ready(None),
        }
    }
}

impl<E: Clone + 'static> super::EventSource<E> for Ring<E> {
    type Source = Receiver<E>;

    fn subscribe(&self) -> Self::Source {
        Receiver(Some(self.0.new_receiver()))
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;

    use super::*;
    use crate::events::EventSource;

    #[test]
    fn ring_drops_oldest() {
        let ring = Ring::new(2);
        let mut rx = ring.subscribe();
        ring.broadcast(1);
        ring.broadcast(2);
        ring.broadcast(3);
        futures_executor::block_on(async {
            assert_eq!(rx.next().await, Some(2));
            assert_eq!(rx.next().await, Some(3));
        });
    }

    #[test]
    fn broadcast_without_receivers() {
        let ring = Ring::new(4);
        ring.broadcast(1u32);
        let mut rx = ring.subscribe();
        ring.broadcast(2);
        assert_eq!(ring.receiver_count(), 1);
        futures_executor::block_on(async {
            assert_eq!(rx.next().await, Some(2));
        });
        drop(rx);
        assert_eq!(ring.receiver_count(), 0);
    }
}
