//! Mapping table - declarative control/target associations
//!
//! Built once from configuration at startup; immutable afterwards. Forward
//! lookups resolve a physical control to its mixer target and conversion;
//! reverse lookups resolve a mixer address to the ordered list of outbound
//! feedback actions.

use crate::config::{AppConfig, ControlConfig, ConvertKind, FeedbackConfig, FrameKind};
use crate::midi::SurfaceEventKind;
use std::collections::HashMap;
use tracing::warn;

/// Value conversion attached to a mapping entry
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    /// `raw / 127 * effective_max`; updates the path's `current` raw value.
    /// `fixed_max` bypasses the adaptive per-path ceiling.
    Fader { fixed_max: Option<f32> },
    /// Recompute the path's adaptive ceiling from the raw value and re-emit
    /// the primary control's converted value
    RangeMax,
    /// Non-zero becomes 1, zero becomes 0; `invert` swaps the literals.
    /// Stateless.
    Toggle { invert: bool },
    /// Always emit a fixed value, ignoring the input. Stateless.
    Constant { value: i32 },
}

/// A control-surface control mapped to a mixer target address
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Target mixer address
    pub target: String,
    /// Conversion from raw 0-127 values to mixer arguments
    pub conversion: Conversion,
}

/// Key identifying a physical control: (device, message type, number)
pub type SourceKey = (String, SurfaceEventKind, u8);

/// Surface feedback parameters for a reverse mapping
#[derive(Debug, Clone)]
pub struct SurfaceFeedback {
    /// Target device (logical prefix); `None` falls back to the default
    /// output device
    pub device: Option<String>,
    pub frame: FrameKind,
    pub number: u8,
    pub channel: u8,
    /// Literal for the "on" state
    pub on_value: u8,
    /// Literal for the "off" state
    pub off_value: u8,
    /// Drive the indicator through the blink scheduler instead of a single
    /// send
    pub blink: bool,
}

/// One outbound action in a reverse mapping
///
/// A mixer address may fan out to several actions; they run in order and
/// failures are isolated per action.
#[derive(Debug, Clone)]
pub enum FeedbackAction {
    /// Send a frame to a control surface
    Surface(SurfaceFeedback),
    /// Mirror the value to the message bus
    Publish,
}

/// Immutable registry of forward and reverse mappings
#[derive(Debug, Default)]
pub struct MappingTable {
    forward: HashMap<SourceKey, MappingEntry>,
    reverse: HashMap<String, Vec<FeedbackAction>>,
}

impl MappingTable {
    /// Build the table from configuration
    ///
    /// Controls without an explicit device default to the main input device.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut forward = HashMap::new();
        let mut reverse: HashMap<String, Vec<FeedbackAction>> = HashMap::new();

        for control in &config.controls {
            let device = control
                .device
                .clone()
                .unwrap_or_else(|| config.midi.input_device.clone());
            let key = (device, control.kind, control.number);

            let entry = MappingEntry {
                target: control.target.clone(),
                conversion: conversion_from_config(control),
            };

            if forward.insert(key.clone(), entry).is_some() {
                warn!(
                    "Duplicate control mapping for {:?}; keeping the last one",
                    key
                );
            }
        }

        for feedback in &config.feedback {
            match action_from_config(feedback) {
                Some(action) => {
                    reverse
                        .entry(feedback.address.clone())
                        .or_default()
                        .push(action);
                }
                None => warn!(
                    "Skipping incomplete feedback mapping for '{}'",
                    feedback.address
                ),
            }
        }

        Self { forward, reverse }
    }

    /// Forward lookup by (device, message type, number)
    ///
    /// A miss is not an error; the caller skips the event.
    pub fn lookup(&self, device: &str, kind: SurfaceEventKind, number: u8) -> Option<&MappingEntry> {
        self.forward
            .get(&(device.to_string(), kind, number))
    }

    /// Reverse lookup: all outbound actions for a mixer address, in order
    ///
    /// Returns an empty slice when the address is unmapped.
    pub fn feedback_for(&self, address: &str) -> &[FeedbackAction] {
        self.reverse
            .get(address)
            .map(|actions| actions.as_slice())
            .unwrap_or(&[])
    }

    /// All forward target addresses (deduplicated), used for `/set`
    /// subscriptions
    pub fn forward_targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self
            .forward
            .values()
            .map(|entry| entry.target.as_str())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// All reverse-mapped addresses, used for state-echo subscriptions
    pub fn feedback_addresses(&self) -> Vec<&str> {
        let mut addresses: Vec<&str> = self.reverse.keys().map(|a| a.as_str()).collect();
        addresses.sort_unstable();
        addresses
    }

    /// Number of forward mappings
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True when no forward mapping is configured
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

fn conversion_from_config(control: &ControlConfig) -> Conversion {
    match control.convert {
        ConvertKind::Fader => Conversion::Fader {
            fixed_max: control.max,
        },
        ConvertKind::RangeMax => Conversion::RangeMax,
        ConvertKind::Toggle => Conversion::Toggle {
            invert: control.invert,
        },
        ConvertKind::Constant => Conversion::Constant {
            // Validated at config load
            value: control.value.unwrap_or_default(),
        },
    }
}

fn action_from_config(feedback: &FeedbackConfig) -> Option<FeedbackAction> {
    if feedback.publish {
        return Some(FeedbackAction::Publish);
    }

    let frame = feedback.action?;
    let number = feedback.number?;

    Some(FeedbackAction::Surface(SurfaceFeedback {
        device: feedback.device.clone(),
        frame,
        number,
        channel: feedback.channel,
        on_value: feedback.on_value.unwrap_or(127),
        off_value: feedback.off_value.unwrap_or(0),
        blink: feedback.blink,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn sample_table() -> MappingTable {
        let config = AppConfig::from_yaml(
            r#"
midi:
  input_device: "WORLDE"
mixer:
  address: "127.0.0.1"
bus:
  host: "localhost"
  base_topic: "dev/midimix-gw"
controls:
  - { number: 3, target: /ch/01/mix/fader }
  - { number: 14, target: /ch/01/mix/fader, convert: range_max }
  - { number: 23, target: /ch/01/mix/on, convert: toggle }
  - { device: LPD8, kind: noteon, number: 40, target: /ch/03/mix/on, convert: toggle }
feedback:
  - { address: /ch/01/mix/on, device: LPD8, action: note, number: 44, blink: true }
  - { address: /ch/01/mix/on, publish: true }
"#,
        )
        .unwrap();
        MappingTable::from_config(&config)
    }

    #[test]
    fn test_forward_lookup_hit() {
        let table = sample_table();
        let entry = table.lookup("WORLDE", SurfaceEventKind::Cc, 3).unwrap();
        assert_eq!(entry.target, "/ch/01/mix/fader");
        assert_eq!(entry.conversion, Conversion::Fader { fixed_max: None });
    }

    #[test]
    fn test_forward_lookup_respects_device_and_kind() {
        let table = sample_table();
        assert!(table.lookup("LPD8", SurfaceEventKind::NoteOn, 40).is_some());
        // Same number, wrong device or kind
        assert!(table.lookup("WORLDE", SurfaceEventKind::NoteOn, 40).is_none());
        assert!(table.lookup("LPD8", SurfaceEventKind::Cc, 40).is_none());
    }

    #[test]
    fn test_forward_lookup_miss_is_none() {
        let table = sample_table();
        assert!(table.lookup("WORLDE", SurfaceEventKind::Cc, 99).is_none());
    }

    #[test]
    fn test_reverse_lookup_preserves_order() {
        let table = sample_table();
        let actions = table.feedback_for("/ch/01/mix/on");
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], FeedbackAction::Surface(fb) if fb.blink));
        assert!(matches!(&actions[1], FeedbackAction::Publish));
    }

    #[test]
    fn test_reverse_lookup_miss_is_empty() {
        let table = sample_table();
        assert!(table.feedback_for("/ch/99/mix/on").is_empty());
    }

    #[test]
    fn test_target_listings() {
        let table = sample_table();
        assert_eq!(
            table.forward_targets(),
            vec!["/ch/01/mix/fader", "/ch/01/mix/on", "/ch/03/mix/on"]
        );
        assert_eq!(table.feedback_addresses(), vec!["/ch/01/mix/on"]);
    }
}
