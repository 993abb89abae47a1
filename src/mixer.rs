//! Mixer transport - OSC over UDP
//!
//! Speaks the XR18-style address/value protocol: messages carry an address
//! and a list of typed arguments. The transport owns the UDP socket, feeds
//! inbound messages into a channel, and keeps the remote subscription alive
//! with a periodic `/xremote` ping.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rosc::{OscMessage, OscPacket, OscType};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Keep-alive interval required by the mixer to maintain the remote
/// subscription
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

/// Address of the keep-alive ping
pub const KEEPALIVE_ADDRESS: &str = "/xremote";

/// Receive buffer size for OSC datagrams
const RECV_BUF_SIZE: usize = 1536;

/// A typed mixer-protocol argument
///
/// Serializes as `{"type":"f","value":0.5}` - the same shape used on the
/// wire-level JSON carried over the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum MixerArg {
    #[serde(rename = "f")]
    Float(f32),
    #[serde(rename = "i")]
    Int(i32),
}

impl MixerArg {
    /// Non-zero check used by feedback actions
    pub fn is_truthy(&self) -> bool {
        match *self {
            MixerArg::Float(f) => f != 0.0,
            MixerArg::Int(i) => i != 0,
        }
    }

    /// Numeric value as JSON (float or integer)
    pub fn to_json_value(&self) -> serde_json::Value {
        match *self {
            MixerArg::Float(f) => serde_json::json!(f),
            MixerArg::Int(i) => serde_json::json!(i),
        }
    }

    /// One-character type tag ("f" or "i")
    pub fn type_tag(&self) -> &'static str {
        match self {
            MixerArg::Float(_) => "f",
            MixerArg::Int(_) => "i",
        }
    }
}

/// An address/value message exchanged with the mixer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerMessage {
    pub address: String,
    #[serde(default)]
    pub args: Vec<MixerArg>,
}

impl MixerMessage {
    /// Build a message with a single argument
    pub fn with_arg(address: impl Into<String>, arg: MixerArg) -> Self {
        Self {
            address: address.into(),
            args: vec![arg],
        }
    }

    /// Convert to an OSC packet for the wire
    pub fn to_osc(&self) -> OscPacket {
        OscPacket::Message(OscMessage {
            addr: self.address.clone(),
            args: self
                .args
                .iter()
                .map(|arg| match *arg {
                    MixerArg::Float(f) => OscType::Float(f),
                    MixerArg::Int(i) => OscType::Int(i),
                })
                .collect(),
        })
    }

    /// Convert from a decoded OSC message, keeping only float/int arguments
    pub fn from_osc(msg: OscMessage) -> Self {
        let args = msg
            .args
            .into_iter()
            .filter_map(|arg| match arg {
                OscType::Float(f) => Some(MixerArg::Float(f)),
                OscType::Int(i) => Some(MixerArg::Int(i)),
                other => {
                    debug!("Ignoring unsupported OSC argument: {:?}", other);
                    None
                }
            })
            .collect();
        Self {
            address: msg.addr,
            args,
        }
    }
}

/// Events emitted by the mixer transport
#[derive(Debug)]
pub enum MixerEvent {
    /// An inbound address/value message
    Message(MixerMessage),
    /// The transport failed and will deliver nothing further; the process
    /// should exit after a short grace delay
    Closed,
}

/// Outbound seam to the mixer, mockable in tests
#[async_trait]
pub trait MixerPort: Send + Sync {
    async fn send(&self, msg: &MixerMessage) -> Result<()>;
}

/// Production mixer transport over a UDP socket
pub struct UdpMixerPort {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpMixerPort {
    /// Bind the local port, start the receive loop and the keep-alive task
    ///
    /// Returns the port (for outbound sends) and the inbound event channel.
    pub async fn connect(
        local_port: u16,
        remote: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<MixerEvent>)> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("Failed to bind local UDP port {}", local_port))?;
        let socket = Arc::new(socket);

        info!("Mixer transport bound on 0.0.0.0:{} -> {}", local_port, remote);

        let port = Arc::new(Self {
            socket: socket.clone(),
            remote,
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(recv_loop(socket, event_tx));
        tokio::spawn(keepalive_loop(port.clone()));

        Ok((port, event_rx))
    }
}

#[async_trait]
impl MixerPort for UdpMixerPort {
    async fn send(&self, msg: &MixerMessage) -> Result<()> {
        let bytes = rosc::encoder::encode(&msg.to_osc())
            .map_err(|e| anyhow!("Failed to encode OSC message '{}': {:?}", msg.address, e))?;
        self.socket
            .send_to(&bytes, self.remote)
            .await
            .with_context(|| format!("Failed to send OSC message to {}", self.remote))?;
        Ok(())
    }
}

/// Receive datagrams and forward decoded messages to the router channel
///
/// A socket error is treated as a remote closure: `MixerEvent::Closed` is
/// emitted once and the loop terminates.
async fn recv_loop(socket: Arc<UdpSocket>, event_tx: mpsc::UnboundedSender<MixerEvent>) {
    let mut buf = [0u8; RECV_BUF_SIZE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let packet = match rosc::decoder::decode_udp(&buf[..len]) {
                    Ok((_, packet)) => packet,
                    Err(e) => {
                        warn!("Failed to decode OSC datagram from {}: {:?}", from, e);
                        continue;
                    }
                };
                deliver_packet(packet, &event_tx);
            }
            Err(e) => {
                error!("Mixer UDP socket error: {}", e);
                let _ = event_tx.send(MixerEvent::Closed);
                return;
            }
        }
    }
}

/// Flatten bundles and deliver each message
fn deliver_packet(packet: OscPacket, event_tx: &mpsc::UnboundedSender<MixerEvent>) {
    match packet {
        OscPacket::Message(msg) => {
            let msg = MixerMessage::from_osc(msg);
            debug!("Mixer RX: {} {:?}", msg.address, msg.args);
            let _ = event_tx.send(MixerEvent::Message(msg));
        }
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                deliver_packet(inner, event_tx);
            }
        }
    }
}

/// Send `/xremote` immediately and then at the keep-alive interval
async fn keepalive_loop(port: Arc<UdpMixerPort>) {
    let ping = MixerMessage {
        address: KEEPALIVE_ADDRESS.to_string(),
        args: Vec::new(),
    };
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);

    loop {
        ticker.tick().await;
        if let Err(e) = port.send(&ping).await {
            warn!("Mixer keep-alive failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_json_shape() {
        let json = serde_json::to_value(MixerArg::Float(0.5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "f", "value": 0.5}));

        let json = serde_json::to_value(MixerArg::Int(1)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "i", "value": 1}));
    }

    #[test]
    fn test_message_json_roundtrip() {
        let raw = r#"{"address":"/ch/01/mix/fader","args":[{"type":"f","value":0.75}]}"#;
        let msg: MixerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.address, "/ch/01/mix/fader");
        assert_eq!(msg.args, vec![MixerArg::Float(0.75)]);
    }

    #[test]
    fn test_from_osc_drops_unsupported_args() {
        let msg = OscMessage {
            addr: "/ch/01/mix/on".to_string(),
            args: vec![
                OscType::Int(1),
                OscType::String("ignored".to_string()),
            ],
        };
        let converted = MixerMessage::from_osc(msg);
        assert_eq!(converted.args, vec![MixerArg::Int(1)]);
    }

    #[test]
    fn test_osc_wire_roundtrip() {
        let msg = MixerMessage::with_arg("/lr/mix/fader", MixerArg::Float(0.33));
        let bytes = rosc::encoder::encode(&msg.to_osc()).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&bytes).unwrap();
        match packet {
            OscPacket::Message(m) => assert_eq!(MixerMessage::from_osc(m), msg),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(MixerArg::Int(1).is_truthy());
        assert!(!MixerArg::Int(0).is_truthy());
        assert!(MixerArg::Float(0.01).is_truthy());
        assert!(!MixerArg::Float(0.0).is_truthy());
    }
}
