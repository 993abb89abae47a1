//! Snapshot types for last-known-state persistence
//!
//! A snapshot maps each mixer target address to the last outbound mixer
//! message, the surface frame that produced it, and the path state at that
//! moment. On restart the snapshot is replayed as synthetic outbound sends
//! so surfaces and the adaptive ceilings pick up where they left off.

use crate::midi::MidiMessage;
use crate::mixer::MixerMessage;
use crate::state::paths::PathState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A MIDI frame addressed to a (possibly default) output device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceFrame {
    /// Logical device name; `None` targets the default output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub message: MidiMessage,
}

/// Last-known state for one mixer target address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Last outbound mixer message for this address
    pub mixer: MixerMessage,
    /// Surface frame to replay on restart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surface: Option<SurfaceFrame>,
    /// Path state (current raw value, adaptive max) at save time
    #[serde(default)]
    pub path: PathState,
}

/// Full persisted snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Schema version for forward compatibility
    #[serde(default)]
    pub version: String,
    /// Unix timestamp (ms) of the last merge
    #[serde(default)]
    pub timestamp: u64,
    /// Entries keyed by mixer target address
    #[serde(default)]
    pub entries: HashMap<String, SnapshotEntry>,
}

impl StateSnapshot {
    pub const VERSION: &'static str = "1";

    pub fn new() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            timestamp: 0,
            entries: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::MixerArg;

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut snapshot = StateSnapshot::new();
        snapshot.entries.insert(
            "/ch/01/mix/fader".to_string(),
            SnapshotEntry {
                mixer: MixerMessage::with_arg("/ch/01/mix/fader", MixerArg::Float(0.378)),
                surface: Some(SurfaceFrame {
                    device: None,
                    message: MidiMessage::ControlChange {
                        channel: 0,
                        controller: 3,
                        value: 64,
                    },
                }),
                path: PathState {
                    current: Some(64),
                    max: Some(0.9),
                },
            },
        );

        let json = serde_json::to_vec(&snapshot).unwrap();
        let restored: StateSnapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(restored.entries, snapshot.entries);
    }

    #[test]
    fn test_missing_path_defaults() {
        let raw = r#"{
            "version": "1",
            "timestamp": 0,
            "entries": {
                "/lr/mix/on": {
                    "mixer": {"address": "/lr/mix/on", "args": [{"type": "i", "value": 1}]}
                }
            }
        }"#;
        let snapshot: StateSnapshot = serde_json::from_str(raw).unwrap();
        let entry = &snapshot.entries["/lr/mix/on"];
        assert_eq!(entry.surface, None);
        assert_eq!(entry.path, PathState::default());
    }
}
