//! Generic per-key debounce coalescer
//!
//! Collapses a burst of rapid events on the same key into one delayed,
//! last-value-wins delivery. At most one timer is live per key; scheduling
//! again before the delay elapses cancels the previous timer and restarts
//! the window with the newer payload.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct TimerEntry {
    /// Distinguishes this timer from any later one for the same key
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-key delayed-execution coalescer
///
/// Payloads for a key that quiesced for the configured delay are delivered
/// on the receiver returned by [`DebounceCoalescer::new`]. Intermediate
/// payloads are discarded.
pub struct DebounceCoalescer<K, P> {
    delay: Duration,
    timers: Arc<Mutex<HashMap<K, TimerEntry>>>,
    generation: AtomicU64,
    tx: mpsc::UnboundedSender<(K, P)>,
}

impl<K, P> DebounceCoalescer<K, P>
where
    K: Eq + Hash + Clone + Send + 'static,
    P: Send + 'static,
{
    /// Create a coalescer and the channel its deliveries arrive on
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<(K, P)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                timers: Arc::new(Mutex::new(HashMap::new())),
                generation: AtomicU64::new(0),
                tx,
            },
            rx,
        )
    }

    /// Schedule a delivery for `key`, superseding any pending one
    pub fn schedule(&self, key: K, payload: P) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock();

        if let Some(previous) = timers.remove(&key) {
            previous.handle.abort();
        }

        let tx = self.tx.clone();
        let registry = Arc::clone(&self.timers);
        let delay = self.delay;
        let fire_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // abort() cannot stop a task already past its last await, so a
            // superseded timer may still reach this point; it must neither
            // deliver nor evict the timer that replaced it.
            {
                let mut timers = registry.lock();
                match timers.get(&fire_key) {
                    Some(entry) if entry.generation == generation => {
                        timers.remove(&fire_key);
                    }
                    _ => return,
                }
            }
            // Receiver gone means shutdown; nothing to deliver to
            let _ = tx.send((fire_key, payload));
        });

        timers.insert(key, TimerEntry { generation, handle });
    }

    /// Cancel the pending timer for `key`, if any
    pub fn cancel(&self, key: &K) {
        if let Some(entry) = self.timers.lock().remove(key) {
            entry.handle.abort();
        }
    }

    /// Cancel every pending timer (used at shutdown)
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock();
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
    }

    /// Number of keys with a live timer
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl<K, P> Drop for DebounceCoalescer<K, P> {
    fn drop(&mut self) {
        for (_, entry) in self.timers.lock().drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    const DELAY: Duration = Duration::from_millis(30);

    #[tokio::test]
    async fn test_burst_collapses_to_last_payload() {
        let (coalescer, mut rx) = DebounceCoalescer::new(DELAY);

        for value in [10u8, 20, 30] {
            coalescer.schedule("key", value);
        }

        let (key, payload) = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(key, "key");
        assert_eq!(payload, 30);

        // Exactly one delivery for the burst
        sleep(DELAY * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (coalescer, mut rx) = DebounceCoalescer::new(DELAY);

        coalescer.schedule("a", 1u8);
        coalescer.schedule("b", 2u8);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let delivered = timeout(Duration::from_millis(500), rx.recv())
                .await
                .expect("delivery timed out")
                .unwrap();
            seen.push(delivered);
        }
        seen.sort();
        assert_eq!(seen, vec![("a", 1), ("b", 2)]);
    }

    #[tokio::test]
    async fn test_quiescent_periods_deliver_separately() {
        let (coalescer, mut rx) = DebounceCoalescer::new(DELAY);

        coalescer.schedule("key", 1u8);
        let first = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.1, 1);

        coalescer.schedule("key", 2u8);
        let second = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.1, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reschedule_storm_ends_on_latest_payload() {
        // Reschedules land right around timer expiry, so expired-but-not-yet
        // -delivered tasks race fresh ones; the last delivery must still be
        // the last scheduled payload and stale payloads must not trail it.
        let (coalescer, mut rx) = DebounceCoalescer::new(Duration::from_millis(1));

        for value in 0..200u32 {
            coalescer.schedule("key", value);
            sleep(Duration::from_micros(500)).await;
        }

        let mut last = None;
        while let Ok(Some((_, payload))) =
            timeout(Duration::from_millis(200), rx.recv()).await
        {
            last = Some(payload);
        }
        assert_eq!(last, Some(199));
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_delivery() {
        let (coalescer, mut rx) = DebounceCoalescer::new(DELAY);

        coalescer.schedule("key", 1u8);
        coalescer.cancel(&"key");

        sleep(DELAY * 3).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_suppresses_everything() {
        let (coalescer, mut rx) = DebounceCoalescer::new(DELAY);

        coalescer.schedule("a", 1u8);
        coalescer.schedule("b", 2u8);
        coalescer.cancel_all();

        sleep(DELAY * 3).await;
        assert!(rx.try_recv().is_err());
    }
}
