//! Snapshot actor - debounced last-known-state persistence over sled
//!
//! The actor owns the accumulated [`StateSnapshot`] in memory (loaded from
//! the database at spawn) and merges per-address updates into it. Writes
//! are trailing-debounced: a burst of fader moves produces at most one disk
//! write per debounce window, carrying the final state of the burst.

use super::persistence::{SnapshotEntry, StateSnapshot};
use anyhow::{Context, Result};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Default trailing debounce window in milliseconds
pub const DEFAULT_SNAPSHOT_DEBOUNCE_MS: u64 = 1000;

/// Key used to store the snapshot in sled
const SNAPSHOT_KEY: &[u8] = b"mixer_snapshot";

/// Commands sent to the snapshot actor
#[derive(Debug)]
pub enum SnapshotCommand {
    /// Merge an entry for one address (write debounced)
    Save {
        address: String,
        entry: SnapshotEntry,
    },
    /// Read the current snapshot (pending merges included)
    Load(oneshot::Sender<StateSnapshot>),
    /// Force any pending merge to disk
    Flush(oneshot::Sender<Result<()>>),
    /// Shut down, flushing first
    Shutdown,
}

/// Actor managing debounced snapshot writes to sled
pub struct SnapshotActor {
    db: sled::Db,
    command_rx: mpsc::Receiver<SnapshotCommand>,
    /// Accumulated snapshot; merges land here immediately
    snapshot: StateSnapshot,
    /// True when the in-memory snapshot is newer than the database
    dirty: bool,
    last_save_ts: Instant,
    debounce_ms: u64,
    write_count: u64,
}

/// Cheap-to-clone handle for talking to the actor
#[derive(Clone)]
pub struct SnapshotActorHandle {
    cmd_tx: mpsc::Sender<SnapshotCommand>,
}

impl SnapshotActor {
    /// Open the database, load any existing snapshot, and spawn the actor
    pub fn spawn(db_path: &str, debounce_ms: u64) -> Result<SnapshotActorHandle> {
        let db = sled::open(db_path)
            .with_context(|| format!("Failed to open snapshot database at: {}", db_path))?;

        let snapshot = load_from_db(&db).unwrap_or_else(StateSnapshot::new);
        if !snapshot.entries.is_empty() {
            info!(
                "Loaded snapshot with {} entries from {}",
                snapshot.entries.len(),
                db_path
            );
        }

        let (cmd_tx, command_rx) = mpsc::channel(100);

        let actor = SnapshotActor {
            db,
            command_rx,
            snapshot,
            dirty: false,
            last_save_ts: Instant::now(),
            debounce_ms,
            write_count: 0,
        };

        tokio::spawn(actor.run());

        Ok(SnapshotActorHandle { cmd_tx })
    }

    async fn run(mut self) {
        debug!("Snapshot actor started (debounce: {}ms)", self.debounce_ms);

        let tick_ms = if self.debounce_ms > 0 {
            self.debounce_ms
        } else {
            1000
        };
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));

        loop {
            tokio::select! {
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SnapshotCommand::Save { address, entry } => {
                            trace!("Snapshot merge for {}", address);
                            self.snapshot.entries.insert(address, entry);
                            self.snapshot.timestamp = now_ms();
                            self.dirty = true;
                            self.last_save_ts = Instant::now();

                            if self.debounce_ms == 0 {
                                self.flush_pending().await;
                            }
                        }
                        SnapshotCommand::Load(response_tx) => {
                            let _ = response_tx.send(self.snapshot.clone());
                        }
                        SnapshotCommand::Flush(response_tx) => {
                            self.flush_pending().await;
                            let _ = response_tx.send(Ok(()));
                        }
                        SnapshotCommand::Shutdown => {
                            info!("Snapshot actor shutting down, flushing");
                            self.flush_pending().await;
                            debug!(
                                "Snapshot actor shutdown complete (total writes: {})",
                                self.write_count
                            );
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.dirty
                        && self.debounce_ms > 0
                        && self.last_save_ts.elapsed() >= Duration::from_millis(self.debounce_ms)
                    {
                        trace!("Snapshot debounce window expired, flushing");
                        self.flush_pending().await;
                    }
                }
            }
        }
    }

    /// Write the accumulated snapshot to disk if it changed
    async fn flush_pending(&mut self) {
        if !self.dirty {
            return;
        }

        let json = match serde_json::to_vec(&self.snapshot) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize snapshot: {}", e);
                return;
            }
        };

        let db = self.db.clone();
        let write_result = tokio::task::spawn_blocking(move || {
            db.insert(SNAPSHOT_KEY, json)?;
            db.flush()?;
            Ok::<_, sled::Error>(())
        })
        .await;

        match write_result {
            Ok(Ok(())) => {
                self.dirty = false;
                self.write_count += 1;
                trace!("Snapshot flushed (write #{})", self.write_count);
            }
            Ok(Err(e)) => {
                // Stays dirty; the next window retries with fresh data
                error!("Failed to write snapshot: {}", e);
            }
            Err(e) => {
                error!("Snapshot write task panicked: {}", e);
            }
        }
    }
}

fn load_from_db(db: &sled::Db) -> Option<StateSnapshot> {
    match db.get(SNAPSHOT_KEY) {
        Ok(Some(data)) => match serde_json::from_slice::<StateSnapshot>(&data) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Failed to deserialize stored snapshot: {}", e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            error!("Failed to read snapshot from database: {}", e);
            None
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SnapshotActorHandle {
    /// Merge the last-known state for one address (debounced write)
    pub async fn save(&self, address: String, entry: SnapshotEntry) -> Result<()> {
        self.cmd_tx
            .send(SnapshotCommand::Save { address, entry })
            .await
            .context("Failed to send save command: snapshot actor shut down")
    }

    /// Read the current snapshot, including not-yet-flushed merges
    pub async fn load(&self) -> Result<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SnapshotCommand::Load(tx))
            .await
            .context("Failed to send load command: snapshot actor shut down")?;
        rx.await.context("Failed to receive load response")
    }

    /// Force any pending merge to disk (use before shutdown)
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SnapshotCommand::Flush(tx))
            .await
            .context("Failed to send flush command: snapshot actor shut down")?;
        rx.await.context("Failed to receive flush response")?
    }

    /// Fire-and-forget shutdown; the actor flushes before terminating
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(SnapshotCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;
    use crate::mixer::{MixerArg, MixerMessage};
    use crate::state::paths::PathState;
    use crate::state::persistence::SurfaceFrame;
    use tempfile::tempdir;

    fn entry(value: f32, raw: u8) -> SnapshotEntry {
        SnapshotEntry {
            mixer: MixerMessage::with_arg("/ch/01/mix/fader", MixerArg::Float(value)),
            surface: Some(SurfaceFrame {
                device: None,
                message: MidiMessage::ControlChange {
                    channel: 0,
                    controller: 3,
                    value: raw,
                },
            }),
            path: PathState {
                current: Some(raw),
                max: None,
            },
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let handle = SnapshotActor::spawn(temp.path().join("db").to_str().unwrap(), 0).unwrap();

        handle
            .save("/ch/01/mix/fader".to_string(), entry(0.5, 85))
            .await
            .unwrap();

        let snapshot = handle.load().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries["/ch/01/mix/fader"], entry(0.5, 85));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_merges_accumulate_across_restart() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let path = path.to_str().unwrap();

        {
            let handle = SnapshotActor::spawn(path, 0).unwrap();
            handle
                .save("/ch/01/mix/fader".to_string(), entry(0.5, 85))
                .await
                .unwrap();
            handle.flush().await.unwrap();
            handle.shutdown();
            // Give the actor time to release the db lock
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let handle = SnapshotActor::spawn(path, 0).unwrap();
        handle
            .save("/ch/03/mix/fader".to_string(), entry(0.25, 42))
            .await
            .unwrap();

        let snapshot = handle.load().await.unwrap();
        assert_eq!(snapshot.entries.len(), 2);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_debounce_last_write_wins() {
        let temp = tempdir().unwrap();
        let handle = SnapshotActor::spawn(temp.path().join("db").to_str().unwrap(), 100).unwrap();

        for raw in [10u8, 20, 30, 40] {
            handle
                .save("/ch/01/mix/fader".to_string(), entry(0.1, raw))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = handle.load().await.unwrap();
        assert_eq!(
            snapshot.entries["/ch/01/mix/fader"].path.current,
            Some(40)
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_flush_overrides_debounce() {
        let temp = tempdir().unwrap();
        let handle = SnapshotActor::spawn(temp.path().join("db").to_str().unwrap(), 10_000).unwrap();

        handle
            .save("/lr/mix/on".to_string(), entry(1.0, 127))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        let snapshot = handle.load().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);

        handle.shutdown();
    }
}
