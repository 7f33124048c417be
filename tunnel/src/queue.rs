//! Bounded blocking queue: a single mutex + condvar guarding a `VecDeque`,
//! with a `pop` that accepts both a timeout and a cancellation predicate.
//!
//! `tokio::sync::Notify` plays the role of the condition variable: `push`
//! wakes one waiter after enqueueing, `pop` re-checks the queue (and the
//! cancel predicate) every time it wakes, exactly as the original
//! `LockedQueue<T>::pop` loop does around `std::condition_variable::wait_for`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// How long `pop` is willing to wait for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Try-pop: return immediately if the queue is empty.
    Immediate,
    /// Wait up to the given duration.
    After(Duration),
    /// Block until an item arrives or the cancel predicate fires.
    Forever,
}

impl Timeout {
    pub fn from_millis(ms: i64) -> Self {
        match ms.cmp(&0) {
            std::cmp::Ordering::Equal => Timeout::Immediate,
            std::cmp::Ordering::Greater => Timeout::After(Duration::from_millis(ms as u64)),
            std::cmp::Ordering::Less => Timeout::Forever,
        }
    }
}

pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be positive");

        Self {
            capacity,
            state: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Non-blocking. Returns `false` (and drops nothing — the caller still
    /// owns `item`, since it's returned) if the queue is at capacity.
    pub async fn push(&self, item: T) -> Result<(), T> {
        let mut q = self.state.lock().await;

        if q.len() >= self.capacity {
            return Err(item);
        }

        q.push_back(item);
        drop(q);
        self.notify.notify_one();

        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pops the front element, waiting according to `timeout` and polling
    /// `cancel` alongside the queue's own emptiness check (mirroring
    /// `LockedQueue::pop`'s `cond() || !_data.empty()` predicate). Returns
    /// `None` on timeout or cancellation; the caller disambiguates using its
    /// own cancellation flag, same as the original.
    pub async fn pop(&self, timeout: Timeout, cancel: impl Fn() -> bool) -> Option<T> {
        match timeout {
            Timeout::Immediate => {
                let mut q = self.state.lock().await;
                q.pop_front()
            }
            Timeout::After(duration) => {
                tokio::time::timeout(duration, self.wait_and_pop(&cancel))
                    .await
                    .ok()
                    .flatten()
            }
            Timeout::Forever => self.wait_and_pop(&cancel).await,
        }
    }

    /// Waits on the notifier until either the queue is non-empty or `cancel`
    /// returns true, then re-checks state. Loops because `Notify` can wake
    /// spuriously relative to the specific predicate we care about.
    async fn wait_and_pop(&self, cancel: &impl Fn() -> bool) -> Option<T> {
        loop {
            {
                let mut q = self.state.lock().await;
                if let Some(item) = q.pop_front() {
                    return Some(item);
                }
            }

            if cancel() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);

            // Re-check immediately after registering interest, in case a
            // push raced us between the unlock above and `notified()`.
            {
                let mut q = self.state.lock().await;
                if let Some(item) = q.pop_front() {
                    return Some(item);
                }
            }

            if cancel() {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    // periodic wake so `cancel` is re-polled even without a push
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn push_rejects_when_full() {
        let q = BoundedQueue::new(1);
        assert!(q.push(1).await.is_ok());
        assert_eq!(q.push(2).await, Err(2));
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn pop_immediate_on_empty_returns_none() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4);
        assert!(q.pop(Timeout::Immediate, || false).await.is_none());
    }

    #[tokio::test]
    async fn pop_returns_pushed_item_in_fifo_order() {
        let q = BoundedQueue::new(4);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();

        assert_eq!(q.pop(Timeout::Immediate, || false).await, Some(1));
        assert_eq!(q.pop(Timeout::Immediate, || false).await, Some(2));
    }

    #[tokio::test]
    async fn pop_times_out_when_nothing_arrives() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        let start = tokio::time::Instant::now();
        let got = q.pop(Timeout::After(Duration::from_millis(50)), || false).await;
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn pop_wakes_up_on_push() {
        let q = Arc::new(BoundedQueue::new(1));
        let q2 = q.clone();

        let handle = tokio::spawn(async move { q2.pop(Timeout::Forever, || false).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(42).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pop should have woken up")
            .unwrap();

        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn pop_forever_respects_cancel_predicate() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let c2 = cancelled.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c2.store(true, Ordering::SeqCst);
        });

        let got = tokio::time::timeout(
            Duration::from_secs(2),
            q.pop(Timeout::Forever, || cancelled.load(Ordering::SeqCst)),
        )
        .await
        .expect("cancel predicate should have unblocked pop");

        assert!(got.is_none());
    }

    #[tokio::test]
    async fn capacity_invariant_holds_under_interleaving() {
        let q = Arc::new(BoundedQueue::new(3));

        for i in 0..10 {
            let _ = q.push(i).await;
            assert!(q.len().await <= 3);
        }
    }
}
