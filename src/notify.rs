//! Broadcast Variables
//!
//! A `Var<T>` holds a current value and hands every reader a channel that
//! fires on the next change. Readers never miss a wakeup: the subscription
//! returned by [`Var::get`] is created under the same lock that guards the
//! value, so a concurrent `set` is always observable either in the value or
//! through the channel.

use tokio::sync::watch;

/// A mutable value with change notification for any number of observers.
#[derive(Debug)]
pub struct Var<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Var<T> {
    /// Create a variable holding an initial value.
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Read the current value and a subscription that resolves after the
    /// next [`Var::set`]. Await `rx.changed()` to park until then.
    pub fn get(&self) -> (T, watch::Receiver<T>) {
        let rx = self.tx.subscribe();
        let value = rx.borrow().clone();
        (value, rx)
    }

    /// Read the current value without subscribing.
    pub fn peek(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value, waking every outstanding subscription.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }
}

impl<T: Clone + Default> Default for Var<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_then_set_wakes() {
        let v = Var::new(1u64);
        let (value, mut updated) = v.get();
        assert_eq!(value, 1);

        let waiter = tokio::spawn(async move {
            updated.changed().await.unwrap();
            *updated.borrow()
        });

        v.set(2);
        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(v.peek(), 2);
    }

    #[tokio::test]
    async fn test_no_spurious_wakeup() {
        let v = Var::new("a".to_string());
        let (_, mut updated) = v.get();

        // Nothing was set, so the subscription must still be pending.
        let pending =
            tokio::time::timeout(Duration::from_millis(20), updated.changed()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_multiple_observers() {
        let v = Var::new(0i32);
        let (_, mut rx1) = v.get();
        let (_, mut rx2) = v.get();

        v.set(7);

        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), 7);
        assert_eq!(*rx2.borrow(), 7);
    }
}
