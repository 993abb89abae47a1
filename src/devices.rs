//! Device registry - logical name resolution for MIDI ports
//!
//! Logical device names from the configuration are prefixes of real port
//! names. The registry resolves a logical name against the port listing
//! captured at startup, opens the port on first use, and caches the handle
//! for the process lifetime. Resolution failures are reported and absorbed;
//! callers fall back to the configured default output where one exists. A
//! cached handle is never re-resolved: an unplugged device surfaces as a
//! send error at use time.

use crate::midi::{MidiMessage, SurfaceEvent};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An opened output endpoint of a control surface
pub trait OutputHandle: Send + Sync {
    fn send(&self, message: &MidiMessage) -> Result<()>;
}

/// An opened input endpoint; dropping it closes the connection
pub trait InputHandle: Send {}

/// Port enumeration and opening, mockable in tests
pub trait MidiPorts: Send + Sync {
    fn input_names(&self) -> Vec<String>;
    fn output_names(&self) -> Vec<String>;

    /// Open an input by its full port name; parsed events are delivered on
    /// `tx` tagged with `device`
    fn open_input(
        &self,
        name: &str,
        device: String,
        tx: mpsc::UnboundedSender<SurfaceEvent>,
    ) -> Result<Box<dyn InputHandle>>;

    /// Open an output by its full port name
    fn open_output(&self, name: &str) -> Result<Arc<dyn OutputHandle>>;
}

/// Resolves logical device names to live handles, lazily, with caching
pub struct DeviceRegistry {
    ports: Arc<dyn MidiPorts>,
    /// Port listings captured at startup; prefix matching runs against these
    input_listing: Vec<String>,
    output_listing: Vec<String>,
    /// First successful resolution per logical name, kept for the process
    /// lifetime
    output_cache: DashMap<String, Arc<dyn OutputHandle>>,
    /// Fallback for actions whose device is missing or unresolvable
    default_output: Option<Arc<dyn OutputHandle>>,
}

impl DeviceRegistry {
    /// Capture the port listings and open the default output, if configured
    pub fn new(ports: Arc<dyn MidiPorts>, default_output: Option<&str>) -> Self {
        let input_listing = ports.input_names();
        let output_listing = ports.output_names();

        let mut registry = Self {
            ports,
            input_listing,
            output_listing,
            output_cache: DashMap::new(),
            default_output: None,
        };

        if let Some(logical) = default_output {
            match registry.resolve_output(logical) {
                Some(handle) => registry.default_output = Some(handle),
                None => warn!(
                    "Default output device '{}' unavailable; unresolvable actions will be dropped",
                    logical
                ),
            }
        }

        registry
    }

    /// Resolve a logical input name to its full port name
    pub fn resolve_input_name(&self, logical: &str) -> Option<&str> {
        let name = self
            .input_listing
            .iter()
            .find(|name| name.starts_with(logical))
            .map(|name| name.as_str());
        if name.is_none() {
            warn!("No MIDI input matching prefix '{}'", logical);
        }
        name
    }

    /// Open the input matching a logical name, delivering events on `tx`
    pub fn open_input(
        &self,
        logical: &str,
        tx: mpsc::UnboundedSender<SurfaceEvent>,
    ) -> Result<Box<dyn InputHandle>> {
        let name = self
            .resolve_input_name(logical)
            .ok_or_else(|| anyhow!("No MIDI input matching prefix '{}'", logical))?
            .to_string();
        debug!("Opening MIDI input '{}' for '{}'", name, logical);
        self.ports.open_input(&name, logical.to_string(), tx)
    }

    /// Resolve a logical output name, opening and caching on first use
    ///
    /// Returns `None` on failure; the failure is logged, never raised.
    pub fn resolve_output(&self, logical: &str) -> Option<Arc<dyn OutputHandle>> {
        if let Some(handle) = self.output_cache.get(logical) {
            debug!("Resolved MIDI output from cache: '{}'", logical);
            return Some(Arc::clone(&handle));
        }

        let name = match self
            .output_listing
            .iter()
            .find(|name| name.starts_with(logical))
        {
            Some(name) => name.clone(),
            None => {
                warn!("No MIDI output matching prefix '{}'", logical);
                return None;
            }
        };

        match self.ports.open_output(&name) {
            Ok(handle) => {
                debug!("Opened MIDI output '{}' for '{}'", name, logical);
                self.output_cache
                    .insert(logical.to_string(), Arc::clone(&handle));
                Some(handle)
            }
            Err(e) => {
                warn!("Unable to open MIDI output '{}': {}", name, e);
                None
            }
        }
    }

    /// Resolve `logical` with fallback to the default output
    ///
    /// `None` logical goes straight to the default. Returns `None` only when
    /// neither resolves; the caller drops the action with a warning.
    pub fn resolve_or_default(&self, logical: Option<&str>) -> Option<Arc<dyn OutputHandle>> {
        match logical {
            Some(name) => self.resolve_output(name).or_else(|| {
                if self.default_output.is_some() {
                    debug!("Falling back to default output for '{}'", name);
                }
                self.default_output.clone()
            }),
            None => self.default_output.clone(),
        }
    }

    /// The configured default output, if it opened
    pub fn default_output(&self) -> Option<Arc<dyn OutputHandle>> {
        self.default_output.clone()
    }
}

/// Production backend over midir
pub struct MidirPorts;

impl MidiPorts for MidirPorts {
    fn input_names(&self) -> Vec<String> {
        match midir::MidiInput::new("midimix-gw-list-in") {
            Ok(input) => input
                .ports()
                .iter()
                .filter_map(|port| input.port_name(port).ok())
                .collect(),
            Err(e) => {
                warn!("Unable to enumerate MIDI inputs: {}", e);
                Vec::new()
            }
        }
    }

    fn output_names(&self) -> Vec<String> {
        match midir::MidiOutput::new("midimix-gw-list-out") {
            Ok(output) => output
                .ports()
                .iter()
                .filter_map(|port| output.port_name(port).ok())
                .collect(),
            Err(e) => {
                warn!("Unable to enumerate MIDI outputs: {}", e);
                Vec::new()
            }
        }
    }

    fn open_input(
        &self,
        name: &str,
        device: String,
        tx: mpsc::UnboundedSender<SurfaceEvent>,
    ) -> Result<Box<dyn InputHandle>> {
        let input = midir::MidiInput::new("midimix-gw-in")
            .map_err(|e| anyhow!("Failed to create MIDI input: {}", e))?;

        let port = input
            .ports()
            .into_iter()
            .find(|port| input.port_name(port).map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("MIDI input port '{}' disappeared", name))?;

        let connection = input
            .connect(
                &port,
                "midimix-gw",
                move |_timestamp, data, _| {
                    // Unrouted message types parse to None and are dropped here
                    if let Some(message) = MidiMessage::parse(data) {
                        let _ = tx.send(SurfaceEvent {
                            device: device.clone(),
                            message,
                        });
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("Failed to open MIDI input '{}': {}", name, e))?;

        Ok(Box::new(MidirInput {
            _connection: connection,
        }))
    }

    fn open_output(&self, name: &str) -> Result<Arc<dyn OutputHandle>> {
        let output = midir::MidiOutput::new("midimix-gw-out")
            .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;

        let port = output
            .ports()
            .into_iter()
            .find(|port| output.port_name(port).map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("MIDI output port '{}' disappeared", name))?;

        let connection = output
            .connect(&port, "midimix-gw")
            .map_err(|e| anyhow!("Failed to open MIDI output '{}': {}", name, e))?;

        Ok(Arc::new(MidirOutput {
            connection: Mutex::new(connection),
        }))
    }
}

struct MidirInput {
    _connection: midir::MidiInputConnection<()>,
}

impl InputHandle for MidirInput {}

struct MidirOutput {
    connection: Mutex<midir::MidiOutputConnection>,
}

impl OutputHandle for MidirOutput {
    fn send(&self, message: &MidiMessage) -> Result<()> {
        self.connection
            .lock()
            .send(&message.encode())
            .map_err(|e| anyhow!("MIDI send failed: {}", e))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory backend for registry and router tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake port backend with a fixed listing and recording outputs
    pub struct FakePorts {
        pub inputs: Vec<String>,
        pub outputs: Vec<String>,
        pub opened: AtomicUsize,
        /// Sent frames per full port name
        pub sent: Arc<Mutex<Vec<(String, MidiMessage)>>>,
        /// Full port names that refuse sends
        pub failing: Vec<String>,
    }

    impl FakePorts {
        pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
            Self {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                opened: AtomicUsize::new(0),
                sent: Arc::new(Mutex::new(Vec::new())),
                failing: Vec::new(),
            }
        }

        pub fn sent_frames(&self) -> Vec<(String, MidiMessage)> {
            self.sent.lock().clone()
        }
    }

    struct FakeInput;
    impl InputHandle for FakeInput {}

    struct FakeOutput {
        name: String,
        sent: Arc<Mutex<Vec<(String, MidiMessage)>>>,
        failing: bool,
    }

    impl OutputHandle for FakeOutput {
        fn send(&self, message: &MidiMessage) -> Result<()> {
            if self.failing {
                return Err(anyhow!("port '{}' is dead", self.name));
            }
            self.sent.lock().push((self.name.clone(), message.clone()));
            Ok(())
        }
    }

    impl MidiPorts for FakePorts {
        fn input_names(&self) -> Vec<String> {
            self.inputs.clone()
        }

        fn output_names(&self) -> Vec<String> {
            self.outputs.clone()
        }

        fn open_input(
            &self,
            _name: &str,
            _device: String,
            _tx: mpsc::UnboundedSender<SurfaceEvent>,
        ) -> Result<Box<dyn InputHandle>> {
            Ok(Box::new(FakeInput))
        }

        fn open_output(&self, name: &str) -> Result<Arc<dyn OutputHandle>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeOutput {
                name: name.to_string(),
                sent: Arc::clone(&self.sent),
                failing: self.failing.iter().any(|f| f == name),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakePorts;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_prefix_resolution() {
        let ports = Arc::new(FakePorts::new(
            &["WORLDE easy CTRL:MIDI 1 24:0"],
            &["LPD8:LPD8 MIDI 1 20:0", "WORLDE easy CTRL:MIDI 1 24:0"],
        ));
        let registry = DeviceRegistry::new(ports, None);

        assert!(registry.resolve_output("LPD8").is_some());
        assert_eq!(
            registry.resolve_input_name("WORLDE"),
            Some("WORLDE easy CTRL:MIDI 1 24:0")
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let ports = Arc::new(FakePorts::new(&[], &["LPD8:LPD8 MIDI 1 20:0"]));
        let registry = DeviceRegistry::new(Arc::clone(&ports) as Arc<dyn MidiPorts>, None);

        let first = registry.resolve_output("LPD8").unwrap();
        let second = registry.resolve_output("LPD8").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ports.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absent_name_fails_gracefully() {
        let ports = Arc::new(FakePorts::new(&[], &["LPD8:LPD8 MIDI 1 20:0"]));
        let registry = DeviceRegistry::new(ports, None);

        assert!(registry.resolve_output("nanoKONTROL").is_none());
        // Still usable afterwards
        assert!(registry.resolve_output("LPD8").is_some());
    }

    #[test]
    fn test_fallback_to_default_output() {
        let ports = Arc::new(FakePorts::new(&[], &["WORLDE easy CTRL:MIDI 1 24:0"]));
        let registry = DeviceRegistry::new(ports, Some("WORLDE"));

        let handle = registry.resolve_or_default(Some("nanoKONTROL")).unwrap();
        let default = registry.default_output().unwrap();
        assert!(Arc::ptr_eq(&handle, &default));

        // No logical name goes straight to the default
        assert!(registry.resolve_or_default(None).is_some());
    }

    #[test]
    fn test_no_default_drops_action() {
        let ports = Arc::new(FakePorts::new(&[], &[]));
        let registry = DeviceRegistry::new(ports, None);

        assert!(registry.resolve_or_default(Some("LPD8")).is_none());
        assert!(registry.resolve_or_default(None).is_none());
    }
}
