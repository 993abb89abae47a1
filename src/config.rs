//! Configuration management for MidiMix GW
//!
//! Handles loading and parsing of the YAML configuration file describing
//! MIDI devices, the mixer endpoint, the MQTT bus, and the control mappings.

use crate::midi::SurfaceEventKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub midi: MidiConfig,
    pub mixer: MixerConfig,
    pub bus: BusConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub controls: Vec<ControlConfig>,
    #[serde(default)]
    pub feedback: Vec<FeedbackConfig>,
}

/// MIDI device configuration
///
/// Device names are logical prefixes, matched against the live port listing
/// (e.g. "WORLDE easy CTRL" matches "WORLDE easy CTRL:WORLDE easy CTRL MIDI 1 24:0").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MidiConfig {
    /// Input device the control-surface events arrive on
    pub input_device: String,
    /// Default output device for feedback when a mapping names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

/// Mixer (OSC over UDP) endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MixerConfig {
    /// Mixer IP address or hostname
    pub address: String,
    #[serde(default = "default_mixer_port")]
    pub port: u16,
    /// Local UDP port to bind for inbound mixer traffic
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

/// MQTT message bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Prefix for all state/command topics (e.g. "dev/midimix-gw")
    pub base_topic: String,
}

/// State snapshot persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// Path to the sled database directory
    #[serde(default = "default_state_path")]
    pub path: String,
    /// Trailing debounce for snapshot writes, in milliseconds
    #[serde(default = "default_state_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            debounce_ms: default_state_debounce_ms(),
        }
    }
}

/// Conversion applied to a control's raw value before it reaches the mixer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertKind {
    /// Scale raw/127 into [0, effective max] (float target)
    Fader,
    /// Non-zero raw becomes 1, zero becomes 0 (integer target)
    Toggle,
    /// Fine adjustment: move the target's adaptive ceiling and re-emit
    RangeMax,
    /// Ignore the input, always emit a fixed value
    Constant,
}

/// A single control-surface control mapped to a mixer target
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Source device; defaults to `midi.input_device`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Message type the control emits
    #[serde(default = "default_control_kind")]
    pub kind: SurfaceEventKind,
    /// Controller / note / program number
    pub number: u8,
    /// Mixer target address (e.g. "/ch/01/mix/fader")
    pub target: String,
    #[serde(default = "default_convert")]
    pub convert: ConvertKind,
    /// Fixed ceiling for `fader`, bypassing the adaptive per-path max
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f32>,
    /// Swap the true/false output literals for `toggle`
    #[serde(default)]
    pub invert: bool,
    /// Output literal for `constant`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,
}

/// Frame type sent back to a control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Note,
    Cc,
}

/// An outbound action triggered by an inbound mixer message
///
/// Several entries may share the same address; they run in declaration order
/// and each failure is isolated from its siblings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedbackConfig {
    /// Mixer address this action reacts to
    pub address: String,
    /// Publish the value to the bus instead of driving a surface
    #[serde(default)]
    pub publish: bool,
    /// Target device; falls back to `midi.output_device`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<FrameKind>,
    /// Note or controller number on the target surface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u8>,
    #[serde(default)]
    pub channel: u8,
    /// Alternate the indicator between on/off values at the blink interval
    #[serde(default)]
    pub blink: bool,
    /// Literal sent for the "on" state (default 127); lets a feedback color
    /// be decoupled from the toggle semantics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_value: Option<u8>,
    /// Literal sent for the "off" state (default 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub off_value: Option<u8>,
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(raw).context("Invalid YAML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express
    fn validate(&self) -> Result<()> {
        for control in &self.controls {
            if control.convert == ConvertKind::Constant && control.value.is_none() {
                anyhow::bail!(
                    "Control {} -> {}: convert 'constant' requires a 'value'",
                    control.number,
                    control.target
                );
            }
            if !control.target.starts_with('/') {
                anyhow::bail!(
                    "Control {}: target '{}' must be an absolute mixer address",
                    control.number,
                    control.target
                );
            }
        }
        for feedback in &self.feedback {
            if !feedback.publish && (feedback.action.is_none() || feedback.number.is_none()) {
                anyhow::bail!(
                    "Feedback for '{}': surface actions require 'action' and 'number'",
                    feedback.address
                );
            }
        }
        Ok(())
    }
}

fn default_mixer_port() -> u16 {
    10024
}

fn default_local_port() -> u16 {
    10023
}

fn default_bus_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "midimix-gw".to_string()
}

fn default_state_path() -> String {
    ".state/snapshot".to_string()
}

fn default_state_debounce_ms() -> u64 {
    1000
}

fn default_control_kind() -> SurfaceEventKind {
    SurfaceEventKind::Cc
}

fn default_convert() -> ConvertKind {
    ConvertKind::Fader
}
