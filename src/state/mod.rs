//! Gateway state: per-path conversion state and snapshot persistence

pub mod paths;
pub mod persistence;
pub mod snapshot_actor;

pub use paths::{PathState, PathStateStore, DEFAULT_PATH_MAX};
pub use persistence::{SnapshotEntry, StateSnapshot, SurfaceFrame};
pub use snapshot_actor::{SnapshotActor, SnapshotActorHandle, DEFAULT_SNAPSHOT_DEBOUNCE_MS};
