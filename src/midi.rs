//! MIDI utilities and message types
//!
//! Provides parsing, encoding, and classification of the control-surface
//! messages this gateway routes (CC, note on/off, program change).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of control-surface event, used as part of mapping lookup keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceEventKind {
    /// Control Change
    Cc,
    /// Note On
    NoteOn,
    /// Note Off
    NoteOff,
    /// Program Change
    Program,
}

impl fmt::Display for SurfaceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceEventKind::Cc => write!(f, "cc"),
            SurfaceEventKind::NoteOn => write!(f, "noteon"),
            SurfaceEventKind::NoteOff => write!(f, "noteoff"),
            SurfaceEventKind::Program => write!(f, "program"),
        }
    }
}

/// MIDI messages handled by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Control Change: channel (0-15), controller (0-127), value (0-127)
    #[serde(rename = "cc")]
    ControlChange { channel: u8, controller: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    Program { channel: u8, program: u8 },
}

impl MidiMessage {
    /// Parse a MIDI message from raw bytes
    ///
    /// Returns `None` for message types the gateway does not route
    /// (pitch bend, aftertouch, system messages).
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }

        let status = data[0];

        // Running status (data byte first) is not supported
        if status < 0x80 {
            return None;
        }

        let message_type = status & 0xF0;
        let channel = status & 0x0F;

        match message_type {
            0x80 => {
                if data.len() < 3 {
                    return None;
                }
                Some(MidiMessage::NoteOff {
                    channel,
                    note: data[1] & 0x7F,
                    velocity: data[2] & 0x7F,
                })
            }
            0x90 => {
                // Note On with velocity 0 is Note Off
                if data.len() < 3 {
                    return None;
                }
                let note = data[1] & 0x7F;
                let velocity = data[2] & 0x7F;

                if velocity == 0 {
                    Some(MidiMessage::NoteOff { channel, note, velocity: 0 })
                } else {
                    Some(MidiMessage::NoteOn { channel, note, velocity })
                }
            }
            0xB0 => {
                if data.len() < 3 {
                    return None;
                }
                Some(MidiMessage::ControlChange {
                    channel,
                    controller: data[1] & 0x7F,
                    value: data[2] & 0x7F,
                })
            }
            0xC0 => {
                if data.len() < 2 {
                    return None;
                }
                Some(MidiMessage::Program {
                    channel,
                    program: data[1] & 0x7F,
                })
            }
            _ => None,
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                vec![0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F]
            }
            MidiMessage::Program { channel, program } => {
                vec![0xC0 | (channel & 0x0F), program & 0x7F]
            }
        }
    }

    /// Classify the message for mapping lookup
    pub fn kind(&self) -> SurfaceEventKind {
        match self {
            MidiMessage::NoteOff { .. } => SurfaceEventKind::NoteOff,
            MidiMessage::NoteOn { .. } => SurfaceEventKind::NoteOn,
            MidiMessage::ControlChange { .. } => SurfaceEventKind::Cc,
            MidiMessage::Program { .. } => SurfaceEventKind::Program,
        }
    }

    /// Controller, note, or program number used as the mapping key
    pub fn number(&self) -> u8 {
        match *self {
            MidiMessage::NoteOff { note, .. } | MidiMessage::NoteOn { note, .. } => note,
            MidiMessage::ControlChange { controller, .. } => controller,
            MidiMessage::Program { program, .. } => program,
        }
    }

    /// Raw value carried by the message (velocity, CC value; program numbers
    /// act as their own value)
    pub fn value(&self) -> u8 {
        match *self {
            MidiMessage::NoteOff { velocity, .. } | MidiMessage::NoteOn { velocity, .. } => velocity,
            MidiMessage::ControlChange { value, .. } => value,
            MidiMessage::Program { program, .. } => program,
        }
    }

    /// MIDI channel (0-15)
    pub fn channel(&self) -> u8 {
        match *self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::Program { channel, .. } => channel,
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, controller, value)
            }
            MidiMessage::Program { channel, program } => {
                write!(f, "Program ch:{} p:{}", channel + 1, program)
            }
        }
    }
}

/// An inbound event from a control surface, tagged with the logical device
/// name it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEvent {
    /// Logical device name (as configured, not the full port name)
    pub device: String,
    /// Parsed MIDI message
    pub message: MidiMessage,
}
