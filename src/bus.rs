//! Message bus - MQTT state mirroring and command injection
//!
//! Converted values are published under `{base_topic}{address}`; remote
//! commands arrive on `{base_topic}{address}/set`. The event loop task owns
//! the rumqttc connection, re-subscribes on every (re)connect, and forwards
//! inbound publishes to the router channel.

use crate::config::BusConfig;
use crate::mixer::MixerArg;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An inbound message from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Outbound seam to the bus, mockable in tests
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Production MQTT client
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Connect to the broker and subscribe to `topics`
    ///
    /// Returns the publisher and the inbound message channel. Connection
    /// errors are retried by the event loop task; subscriptions are replayed
    /// on every successful (re)connect.
    pub fn connect(
        config: &BusConfig,
        topics: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let subscriber = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Bus connected, subscribing to {} topics", topics.len());
                        for topic in &topics {
                            debug!("Subscribing to bus topic: '{}'", topic);
                            if let Err(e) =
                                subscriber.subscribe(topic.clone(), QoS::AtLeastOnce).await
                            {
                                warn!("Failed to subscribe to '{}': {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = message_tx.send(BusMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Bus connection error, retrying: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (Self { client }, message_rx)
    }
}

#[async_trait]
impl BusPublisher for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("Failed to publish to bus topic '{}'", topic))
    }
}

/// Build the state-publication payload: `{"type", "value", "raw_value"}`
pub fn state_payload(arg: &MixerArg, raw_value: u8) -> serde_json::Value {
    serde_json::json!({
        "type": arg.type_tag(),
        "value": arg.to_json_value(),
        "raw_value": raw_value,
    })
}

/// Build the feedback-mirror payload: `{"type", "value"}` (no raw source)
pub fn mirror_payload(arg: &MixerArg) -> serde_json::Value {
    serde_json::json!({
        "type": arg.type_tag(),
        "value": arg.to_json_value(),
    })
}

/// The set of topics the gateway subscribes to: `/set` command topics for
/// every forward target and plain state topics for every feedback address
pub fn subscription_topics(
    base_topic: &str,
    forward_targets: &[&str],
    feedback_addresses: &[&str],
) -> Vec<String> {
    let mut topics: Vec<String> = forward_targets
        .iter()
        .map(|address| format!("{}{}/set", base_topic, address))
        .chain(
            feedback_addresses
                .iter()
                .map(|address| format!("{}{}", base_topic, address)),
        )
        .collect();
    topics.sort_unstable();
    topics.dedup();
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_payload_shape() {
        let payload = state_payload(&MixerArg::Float(0.378), 64);
        assert_eq!(
            payload,
            serde_json::json!({"type": "f", "value": 0.378f32, "raw_value": 64})
        );
    }

    #[test]
    fn test_mirror_payload_shape() {
        let payload = mirror_payload(&MixerArg::Int(1));
        assert_eq!(payload, serde_json::json!({"type": "i", "value": 1}));
    }

    #[test]
    fn test_subscription_topics() {
        let topics = subscription_topics(
            "dev/midimix-gw",
            &["/ch/01/mix/fader", "/ch/01/mix/on"],
            &["/ch/01/mix/on"],
        );
        assert_eq!(
            topics,
            vec![
                "dev/midimix-gw/ch/01/mix/fader/set",
                "dev/midimix-gw/ch/01/mix/on",
                "dev/midimix-gw/ch/01/mix/on/set",
            ]
        );
    }
}
