//! Fire-and-forget change notifications.
//!
//! Registries publish a value every time their contents change. Publishing
//! never blocks and never fails: with no subscribers the value is dropped,
//! and a slow subscriber sees `RecvError::Lagged` instead of slowing the
//! publisher down. Subscribers treat every notification as "something
//! changed, re-read the registry", so skipped values lose nothing.

use tokio::sync::broadcast;

/// Default number of undelivered notifications kept per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A multi-subscriber change notification.
#[derive(Debug)]
pub struct ChangeEvent<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> ChangeEvent<T> {
    /// Create an event that buffers up to `capacity` values per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future notifications. Dropping the receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publish `value` to every current subscriber.
    ///
    /// Returns how many subscribers the value was queued for.
    pub fn broadcast(&self, value: T) -> usize {
        self.sender.send(value).unwrap_or(0)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for ChangeEvent<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Drain every queued notification without waiting.
///
/// Returns `false` once the publisher is gone.
pub fn drain_pending<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> bool {
    loop {
        match receiver.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Empty) => return true,
            Err(broadcast::error::TryRecvError::Closed) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_subscribers_is_dropped() {
        let event = ChangeEvent::<u32>::default();
        assert_eq!(event.broadcast(1), 0);
        assert_eq!(event.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_values() {
        let event = ChangeEvent::<u32>::default();
        let mut first = event.subscribe();
        let mut second = event.subscribe();

        assert_eq!(event.broadcast(7), 2);

        assert_eq!(first.recv().await.unwrap(), 7);
        assert_eq!(second.recv().await.unwrap(), 7);
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let event = ChangeEvent::<u32>::default();
        let receiver = event.subscribe();
        assert_eq!(event.subscriber_count(), 1);
        drop(receiver);
        assert_eq!(event.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_does_not_block_publisher() {
        let event = ChangeEvent::<u32>::new(2);
        let mut receiver = event.subscribe();
        for value in 0..10 {
            event.broadcast(value);
        }
        assert!(drain_pending(&mut receiver));
        assert!(matches!(
            receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn drain_reports_closed_publisher() {
        let event = ChangeEvent::<u32>::default();
        let mut receiver = event.subscribe();
        drop(event);
        assert!(!drain_pending(&mut receiver));
    }
}
