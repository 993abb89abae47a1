//! Per-target path state and value conversion
//!
//! Each mixer target address owns at most one [`PathState`], holding the
//! last raw value seen and an adaptive ceiling ("max") that a secondary
//! control can move within [0.75, 1.0]. Stateless conversions (toggle,
//! constant) never touch the store.

use crate::mapping::Conversion;
use crate::mixer::MixerArg;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Input protocol maximum (MIDI 7-bit)
pub const RAW_MAX: f32 = 127.0;

/// Default ceiling for float targets without an adaptive max
pub const DEFAULT_PATH_MAX: f32 = 0.75;

/// Width of the fine-adjustment range above the default ceiling
pub const FINE_RANGE: f32 = 0.25;

/// Mutable state for one target address
///
/// Absent values are represented as `None` throughout; there is no NaN or
/// sentinel encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PathState {
    /// Last raw value routed to this path by a stateful conversion
    pub current: Option<u8>,
    /// Adaptive ceiling in [0.75, 1.0]; `None` means the default applies
    pub max: Option<f32>,
}

/// Store of path states keyed by target address
///
/// Entries are created lazily on first stateful conversion and live for the
/// process lifetime.
#[derive(Debug, Default)]
pub struct PathStateStore {
    states: DashMap<String, PathState>,
}

impl PathStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for an address (default when never written)
    pub fn get(&self, address: &str) -> PathState {
        self.states
            .get(address)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// Seed a path from a restored snapshot
    pub fn seed(&self, address: &str, state: PathState) {
        self.states.insert(address.to_string(), state);
    }

    /// Convert a raw 0-127 value for the given address
    ///
    /// Stateful conversions (fader, range max) read and update the path
    /// entry; toggle and constant are pure.
    pub fn convert(&self, address: &str, conversion: &Conversion, raw: u8) -> MixerArg {
        match conversion {
            Conversion::Fader { fixed_max } => {
                let mut entry = self.states.entry(address.to_string()).or_default();
                entry.current = Some(raw);
                let max = fixed_max.unwrap_or_else(|| entry.max.unwrap_or(DEFAULT_PATH_MAX));
                MixerArg::Float(scale(raw, max))
            }
            Conversion::RangeMax => {
                let mut entry = self.states.entry(address.to_string()).or_default();
                let max = DEFAULT_PATH_MAX + scale(raw, FINE_RANGE);
                entry.max = Some(max);
                // Re-emit the primary control at the new ceiling; before the
                // primary has ever moved, the adjusting raw stands in
                let primary = entry.current.unwrap_or(raw);
                MixerArg::Float(scale(primary, max))
            }
            Conversion::Toggle { invert } => {
                let on = (raw != 0) ^ invert;
                MixerArg::Int(if on { 1 } else { 0 })
            }
            Conversion::Constant { value } => MixerArg::Int(*value),
        }
    }
}

/// `raw / 127 * max`
fn scale(raw: u8, max: f32) -> f32 {
    f32::from(raw) / RAW_MAX * max
}
