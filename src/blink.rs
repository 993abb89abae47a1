//! Blink scheduler - periodic indicator toggling
//!
//! A single driver task flips a global phase at a fixed interval and calls
//! every registered callback with the phase-selected value. Registrations
//! are keyed by id: registering an id again replaces the prior entry, and a
//! callback that fails on a tick removes only its own registration (the
//! driver never stops).

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Driver tick interval
pub const BLINK_INTERVAL: Duration = Duration::from_millis(666);

/// Callback invoked on every driver tick with the phase-selected value
pub type BlinkCallback = Arc<dyn Fn(u8) -> Result<()> + Send + Sync>;

struct Registration {
    /// Distinguishes this registration from any later one under the same id
    generation: u64,
    on_value: u8,
    off_value: u8,
    callback: BlinkCallback,
}

/// Periodic toggle mechanism for indicator feedback
///
/// At most one registration is live per id at any time.
pub struct BlinkScheduler {
    registrations: Arc<Mutex<HashMap<String, Registration>>>,
    generation: AtomicU64,
    driver: JoinHandle<()>,
}

impl BlinkScheduler {
    /// Spawn the scheduler with the standard interval
    pub fn spawn() -> Self {
        Self::spawn_with_interval(BLINK_INTERVAL)
    }

    /// Spawn the scheduler with a custom interval (tests use short ones)
    pub fn spawn_with_interval(interval: Duration) -> Self {
        let registrations: Arc<Mutex<HashMap<String, Registration>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let driver_registrations = Arc::clone(&registrations);
        let driver = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut phase = false;

            loop {
                ticker.tick().await;
                phase = !phase;

                // Snapshot under the lock, call outside it
                let snapshot: Vec<(String, u64, u8, BlinkCallback)> = driver_registrations
                    .lock()
                    .iter()
                    .map(|(id, reg)| {
                        let value = if phase { reg.on_value } else { reg.off_value };
                        (id.clone(), reg.generation, value, Arc::clone(&reg.callback))
                    })
                    .collect();

                for (id, generation, value, callback) in snapshot {
                    if let Err(e) = callback(value) {
                        warn!("Blink callback '{}' failed, removing: {}", id, e);
                        remove_if_generation(&driver_registrations, &id, generation);
                    }
                }
            }
        });

        Self {
            registrations,
            generation: AtomicU64::new(0),
            driver,
        }
    }

    /// Register (or replace) a blinking indicator
    ///
    /// `input` is the current value of the signal driving the indicator. If
    /// it is absent or equals `off_value`, the callback is invoked once with
    /// `off_value` and no repeating entry is stored (steady off). Otherwise
    /// the indicator alternates between `on_value` and `off_value` on every
    /// driver tick until the id is replaced or removed.
    pub fn register(
        &self,
        id: impl Into<String>,
        input: Option<u8>,
        on_value: u8,
        off_value: u8,
        callback: BlinkCallback,
    ) {
        let id = id.into();

        // Replacing always cancels the prior registration for this id
        self.registrations.lock().remove(&id);

        match input {
            None => {
                debug!("Blink '{}': no input value, steady off", id);
                if let Err(e) = callback(off_value) {
                    warn!("Blink '{}' steady-off send failed: {}", id, e);
                }
            }
            Some(value) if value == off_value => {
                debug!("Blink '{}': input equals off value, steady off", id);
                if let Err(e) = callback(off_value) {
                    warn!("Blink '{}' steady-off send failed: {}", id, e);
                }
            }
            Some(_) => {
                self.registrations.lock().insert(
                    id,
                    Registration {
                        generation: self.generation.fetch_add(1, Ordering::Relaxed),
                        on_value,
                        off_value,
                        callback,
                    },
                );
            }
        }
    }

    /// Remove the registration for `id`, if any
    pub fn unregister(&self, id: &str) {
        self.registrations.lock().remove(id);
    }

    /// Number of live registrations
    pub fn active(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Stop the driver (process shutdown)
    pub fn shutdown(&self) {
        self.driver.abort();
    }

    #[cfg(test)]
    fn generation_of(&self, id: &str) -> Option<u64> {
        self.registrations.lock().get(id).map(|reg| reg.generation)
    }
}

/// Remove `id` only if it still carries `generation`
///
/// Callbacks run outside the lock, so a failing tick may race a replacement
/// for the same id; the failure must only ever remove the registration it
/// observed, never the replacement.
fn remove_if_generation(
    registrations: &Mutex<HashMap<String, Registration>>,
    id: &str,
    generation: u64,
) -> bool {
    let mut registrations = registrations.lock();
    match registrations.get(id) {
        Some(reg) if reg.generation == generation => {
            registrations.remove(id);
            true
        }
        _ => false,
    }
}

impl Drop for BlinkScheduler {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const TICK: Duration = Duration::from_millis(20);

    fn collector() -> (BlinkCallback, Arc<Mutex<Vec<u8>>>) {
        let values: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&values);
        let callback: BlinkCallback = Arc::new(move |v| {
            sink.lock().push(v);
            Ok(())
        });
        (callback, values)
    }

    #[tokio::test]
    async fn test_alternating_sequence() {
        let scheduler = BlinkScheduler::spawn_with_interval(TICK);
        let (callback, values) = collector();

        scheduler.register("led", Some(1), 1, 0, callback);
        sleep(TICK * 6).await;

        let seen = values.lock().clone();
        assert!(seen.len() >= 3, "expected several ticks, got {:?}", seen);
        for pair in seen.windows(2) {
            assert_ne!(pair[0], pair[1], "sequence must alternate: {:?}", seen);
        }
        assert!(seen.contains(&1) && seen.contains(&0));
    }

    #[tokio::test]
    async fn test_steady_off_short_circuit() {
        let scheduler = BlinkScheduler::spawn_with_interval(TICK);
        let (callback, values) = collector();

        scheduler.register("led", Some(0), 1, 0, callback);
        sleep(TICK * 4).await;

        assert_eq!(*values.lock(), vec![0]);
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test]
    async fn test_absent_input_is_steady_off() {
        let scheduler = BlinkScheduler::spawn_with_interval(TICK);
        let (callback, values) = collector();

        scheduler.register("led", None, 1, 0, callback);
        sleep(TICK * 4).await;

        assert_eq!(*values.lock(), vec![0]);
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test]
    async fn test_reregister_replaces_prior() {
        let scheduler = BlinkScheduler::spawn_with_interval(TICK);
        let (callback_a, _values_a) = collector();
        let (callback_b, _values_b) = collector();

        scheduler.register("led", Some(1), 1, 0, callback_a);
        scheduler.register("led", Some(1), 5, 0, callback_b);
        assert_eq!(scheduler.active(), 1);

        // Steady-off replacement clears the entry entirely
        let (callback_c, _) = collector();
        scheduler.register("led", Some(0), 1, 0, callback_c);
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test]
    async fn test_failing_callback_removed_driver_survives() {
        let scheduler = BlinkScheduler::spawn_with_interval(TICK);

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let failing: BlinkCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("dead indicator"))
        });
        let (healthy, values) = collector();

        scheduler.register("bad", Some(1), 1, 0, failing);
        scheduler.register("good", Some(1), 1, 0, healthy);

        sleep(TICK * 6).await;

        // Removed after its first failing tick
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active(), 1);
        // The healthy registration kept ticking
        assert!(values.lock().len() >= 3);
    }

    #[tokio::test]
    async fn test_stale_failure_leaves_replacement_alive() {
        // Long interval keeps the driver idle so registrations are stable
        let scheduler = BlinkScheduler::spawn_with_interval(Duration::from_secs(3600));
        let (callback_a, _) = collector();
        let (callback_b, _) = collector();

        scheduler.register("led", Some(1), 1, 0, callback_a);
        let stale = scheduler.generation_of("led").unwrap();
        scheduler.register("led", Some(1), 5, 0, callback_b);

        // A failure observed against the old registration must not evict
        // the replacement
        assert!(!remove_if_generation(&scheduler.registrations, "led", stale));
        assert_eq!(scheduler.active(), 1);

        let current = scheduler.generation_of("led").unwrap();
        assert!(remove_if_generation(&scheduler.registrations, "led", current));
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test]
    async fn test_unregister_stops_ticks() {
        let scheduler = BlinkScheduler::spawn_with_interval(TICK);
        let (callback, values) = collector();

        scheduler.register("led", Some(1), 1, 0, callback);
        sleep(TICK * 3).await;
        scheduler.unregister("led");
        let count = values.lock().len();

        sleep(TICK * 3).await;
        assert_eq!(values.lock().len(), count);
    }
}
