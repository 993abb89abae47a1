//! midimix-gw - MIDI control surface to mixer gateway
//!
//! Bridges three protocols: MIDI control surfaces (faders, knobs, pads),
//! an XR18-style address/value mixer protocol over UDP, and an MQTT message
//! bus for state mirroring and remote commands. A declarative mapping table
//! associates physical controls with mixer target addresses; the router
//! converts values, coalesces fader bursts, drives indicator feedback, and
//! persists the last-known state for replay on restart.

pub mod blink;
pub mod bus;
pub mod config;
pub mod debounce;
pub mod devices;
pub mod mapping;
pub mod midi;
pub mod mixer;
pub mod router;
pub mod state;

pub use config::AppConfig;
pub use router::Router;
