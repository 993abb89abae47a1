//! Router module - translation and dispatch between the three protocols
//!
//! The router is pure dispatch: it classifies each inbound event, resolves
//! the mapping table, applies value conversion against the per-path state,
//! and fans the result out to the mixer, the message bus, and control
//! surfaces. Errors at any step are caught, logged, and isolated to the
//! event (or the single action) that raised them; the router never aborts
//! and never retries within a dispatch cycle.

mod feedback;


use crate::blink::{BlinkScheduler, BLINK_INTERVAL};
use crate::bus::{self, BusMessage, BusPublisher};
use crate::debounce::DebounceCoalescer;
use crate::devices::DeviceRegistry;
use crate::mapping::MappingTable;
use crate::midi::{MidiMessage, SurfaceEvent, SurfaceEventKind};
use crate::mixer::{MixerArg, MixerMessage, MixerPort};
use crate::state::{PathStateStore, SnapshotActorHandle, SnapshotEntry, SurfaceFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Debounce window for control-surface CC bursts
pub const CC_DEBOUNCE: Duration = Duration::from_millis(20);

/// Debounce key: (device, controller)
pub type DebounceKey = (String, u8);

/// Latest CC data carried through the coalescer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcPayload {
    pub channel: u8,
    pub value: u8,
}

/// Receiver for coalesced CC deliveries; drained by the main event loop
pub type DebounceRx = mpsc::UnboundedReceiver<(DebounceKey, CcPayload)>;

/// Composes the mapping table, path state, device registry, coalescer, and
/// blink scheduler into one dispatcher
pub struct Router {
    table: Arc<MappingTable>,
    paths: Arc<PathStateStore>,
    registry: Arc<DeviceRegistry>,
    mixer: Arc<dyn MixerPort>,
    bus: Arc<dyn BusPublisher>,
    blink: Arc<BlinkScheduler>,
    snapshots: Option<SnapshotActorHandle>,
    base_topic: String,
    debounce: DebounceCoalescer<DebounceKey, CcPayload>,
}

impl Router {
    /// Create a router with the standard debounce and blink timing
    pub fn new(
        table: Arc<MappingTable>,
        registry: Arc<DeviceRegistry>,
        mixer: Arc<dyn MixerPort>,
        bus: Arc<dyn BusPublisher>,
        snapshots: Option<SnapshotActorHandle>,
        base_topic: String,
    ) -> (Self, DebounceRx) {
        Self::with_timing(
            table,
            registry,
            mixer,
            bus,
            snapshots,
            base_topic,
            CC_DEBOUNCE,
            BLINK_INTERVAL,
        )
    }

    /// Create a router with custom timing (tests use short windows)
    #[allow(clippy::too_many_arguments)]
    pub fn with_timing(
        table: Arc<MappingTable>,
        registry: Arc<DeviceRegistry>,
        mixer: Arc<dyn MixerPort>,
        bus: Arc<dyn BusPublisher>,
        snapshots: Option<SnapshotActorHandle>,
        base_topic: String,
        cc_debounce: Duration,
        blink_interval: Duration,
    ) -> (Self, DebounceRx) {
        let (debounce, debounce_rx) = DebounceCoalescer::new(cc_debounce);

        let router = Self {
            table,
            paths: Arc::new(PathStateStore::new()),
            registry,
            mixer,
            bus,
            blink: Arc::new(BlinkScheduler::spawn_with_interval(blink_interval)),
            snapshots,
            base_topic,
            debounce,
        };

        (router, debounce_rx)
    }

    /// Handle an inbound control-surface event
    ///
    /// CC events go through the coalescer (the delivery comes back via
    /// [`Router::on_coalesced_cc`]); other types dispatch immediately.
    pub async fn on_surface_event(&self, event: SurfaceEvent) {
        debug!("Surface RX [{}]: {}", event.device, event.message);

        match event.message {
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => {
                self.debounce
                    .schedule((event.device, controller), CcPayload { channel, value });
            }
            other => {
                self.dispatch_control(
                    &event.device,
                    other.kind(),
                    other.number(),
                    other.value(),
                    other.channel(),
                )
                .await;
            }
        }
    }

    /// Handle a coalesced CC delivery from the debounce channel
    pub async fn on_coalesced_cc(&self, key: DebounceKey, payload: CcPayload) {
        self.dispatch_control(
            &key.0,
            SurfaceEventKind::Cc,
            key.1,
            payload.value,
            payload.channel,
        )
        .await;
    }

    /// Forward path: control-surface event -> mixer + bus publication
    ///
    /// A lookup miss is not an error; the event is skipped. Mixer and bus
    /// failures are logged independently and do not suppress each other.
    pub(crate) async fn dispatch_control(
        &self,
        device: &str,
        kind: SurfaceEventKind,
        number: u8,
        value: u8,
        channel: u8,
    ) {
        let Some(entry) = self.table.lookup(device, kind, number) else {
            debug!("No mapping for {} {} on '{}', skipping", kind, number, device);
            return;
        };

        let arg = self.paths.convert(&entry.target, &entry.conversion, value);
        let message = MixerMessage::with_arg(entry.target.clone(), arg);

        debug!(
            "Mapping hit: [{}] {} {} -> {} {:?}",
            device, kind, number, entry.target, arg
        );

        if let Err(e) = self.mixer.send(&message).await {
            warn!("Mixer send failed for '{}': {}", entry.target, e);
        }

        let topic = format!("{}{}", self.base_topic, entry.target);
        match serde_json::to_vec(&bus::state_payload(&arg, value)) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&topic, payload).await {
                    warn!("Bus publish failed for '{}': {}", topic, e);
                }
            }
            Err(e) => warn!("Failed to serialize state payload: {}", e),
        }

        if let Some(snapshots) = &self.snapshots {
            let snapshot_entry = SnapshotEntry {
                mixer: message,
                surface: Some(SurfaceFrame {
                    device: None,
                    message: surface_frame(kind, number, value, channel),
                }),
                path: self.paths.get(&entry.target),
            };
            if let Err(e) = snapshots.save(entry.target.clone(), snapshot_entry).await {
                warn!("Snapshot save failed for '{}': {}", entry.target, e);
            }
        }
    }

    /// Handle an inbound message from the bus
    ///
    /// `/set` topics forward their payload to the mixer; plain state topics
    /// are mapped back to an address and treated like inbound mixer traffic.
    pub async fn on_bus_message(&self, message: BusMessage) {
        let Some(rest) = message.topic.strip_prefix(self.base_topic.as_str()) else {
            debug!("Ignoring bus message outside base topic: '{}'", message.topic);
            return;
        };

        if let Some(address) = rest.strip_suffix("/set") {
            self.forward_set_command(address, &message.payload).await;
        } else {
            match parse_inbound_value(&message.payload) {
                Some(arg) => {
                    let synthetic = MixerMessage::with_arg(rest, arg);
                    self.dispatch_feedback(&synthetic, false).await;
                }
                None => warn!(
                    "Malformed bus payload on '{}', dropping event",
                    message.topic
                ),
            }
        }
    }

    /// Forward a `/set` command payload to the mixer
    ///
    /// Accepts the full mixer-protocol JSON shape or a bare numeric value
    /// (re-addressed from the topic).
    async fn forward_set_command(&self, address: &str, payload: &[u8]) {
        let message = match serde_json::from_slice::<MixerMessage>(payload) {
            Ok(msg) if !msg.address.is_empty() => msg,
            _ => {
                let bare = std::str::from_utf8(payload)
                    .ok()
                    .and_then(|s| s.trim().parse::<f32>().ok());
                match bare {
                    Some(value) => MixerMessage::with_arg(address, MixerArg::Float(value)),
                    None => {
                        warn!("Malformed /set payload for '{}', dropping event", address);
                        return;
                    }
                }
            }
        };

        debug!("Bus /set -> mixer: {} {:?}", message.address, message.args);
        if let Err(e) = self.mixer.send(&message).await {
            warn!("Failed to forward /set command for '{}': {}", address, e);
        }
    }

    /// Replay the persisted snapshot: seed path state and re-send the last
    /// surface frames as synthetic outbound sends
    ///
    /// Best-effort; failures are logged per entry and never block startup.
    pub async fn replay_snapshot(&self) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };

        let snapshot = match snapshots.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Unable to load snapshot for replay: {}", e);
                return;
            }
        };

        if snapshot.entries.is_empty() {
            return;
        }
        info!("Replaying {} snapshot entries", snapshot.entries.len());

        for (address, entry) in &snapshot.entries {
            self.paths.seed(address, entry.path);

            if let Some(frame) = &entry.surface {
                match self.registry.resolve_or_default(frame.device.as_deref()) {
                    Some(handle) => {
                        if let Err(e) = handle.send(&frame.message) {
                            warn!("Replay send failed for '{}': {}", address, e);
                        }
                    }
                    None => warn!("Replay for '{}' dropped: no output device", address),
                }
            }
        }
    }

    /// Cancel timers, stop the blink driver, and flush the snapshot
    pub async fn shutdown(&self) {
        self.debounce.cancel_all();
        self.blink.shutdown();

        if let Some(snapshots) = &self.snapshots {
            if let Err(e) = snapshots.flush().await {
                warn!("Snapshot flush on shutdown failed: {}", e);
            }
            snapshots.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn blink_scheduler(&self) -> &BlinkScheduler {
        &self.blink
    }

    #[cfg(test)]
    pub(crate) fn path_state(&self) -> &PathStateStore {
        &self.paths
    }
}

/// Reconstruct the MIDI frame a forward dispatch originated from, for the
/// snapshot
fn surface_frame(kind: SurfaceEventKind, number: u8, value: u8, channel: u8) -> MidiMessage {
    match kind {
        SurfaceEventKind::Cc => MidiMessage::ControlChange {
            channel,
            controller: number,
            value,
        },
        SurfaceEventKind::NoteOn => MidiMessage::NoteOn {
            channel,
            note: number,
            velocity: value,
        },
        SurfaceEventKind::NoteOff => MidiMessage::NoteOff {
            channel,
            note: number,
            velocity: value,
        },
        SurfaceEventKind::Program => MidiMessage::Program {
            channel,
            program: number,
        },
    }
}

/// Extract a numeric value from a state-topic payload: either a bare JSON
/// number or an object with a `value` field
fn parse_inbound_value(payload: &[u8]) -> Option<MixerArg> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let value = if value.is_object() {
        value.get("value")?.clone()
    } else {
        value
    };

    if let Some(i) = value.as_i64() {
        Some(MixerArg::Int(i as i32))
    } else {
        value.as_f64().map(|f| MixerArg::Float(f as f32))
    }
}
