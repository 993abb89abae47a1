//! Reverse path: mixer state changes fanned out to surfaces and the bus

use super::Router;
use crate::blink::BlinkCallback;
use crate::bus;
use crate::config::FrameKind;
use crate::mapping::FeedbackAction;
use crate::midi::MidiMessage;
use crate::mixer::{MixerArg, MixerMessage};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{debug, warn};

impl Router {
    /// Handle an inbound mixer message: run every feedback action registered
    /// for its address
    ///
    /// Actions run in configuration order; a failing action is logged and
    /// the rest still run.
    pub async fn on_mixer_message(&self, message: &MixerMessage) {
        self.dispatch_feedback(message, true).await;
    }

    /// `include_publish` is false for values that arrived over the bus:
    /// mirroring those back out would echo through our own subscription.
    pub(crate) async fn dispatch_feedback(&self, message: &MixerMessage, include_publish: bool) {
        let actions = self.table.feedback_for(&message.address);
        if actions.is_empty() {
            debug!("No feedback mapping for '{}', skipping", message.address);
            return;
        }

        let value = message.args.first().copied();
        debug!(
            "Feedback: {} {:?} -> {} action(s)",
            message.address,
            value,
            actions.len()
        );

        for (index, action) in actions.iter().enumerate() {
            if matches!(action, FeedbackAction::Publish) && !include_publish {
                continue;
            }
            if let Err(e) = self.run_feedback_action(&message.address, action, value).await {
                warn!(
                    "Feedback action #{} for '{}' failed: {}",
                    index, message.address, e
                );
            }
        }
    }

    async fn run_feedback_action(
        &self,
        address: &str,
        action: &FeedbackAction,
        value: Option<MixerArg>,
    ) -> Result<()> {
        match action {
            FeedbackAction::Publish => {
                let arg = value.ok_or_else(|| anyhow!("message carries no value to mirror"))?;
                let topic = format!("{}{}", self.base_topic, address);
                let payload = serde_json::to_vec(&bus::mirror_payload(&arg))?;
                self.bus.publish(&topic, payload).await
            }
            FeedbackAction::Surface(feedback) => {
                let Some(handle) = self.registry.resolve_or_default(feedback.device.as_deref())
                else {
                    warn!(
                        "Dropping surface feedback for '{}': no output device for {:?}",
                        address, feedback.device
                    );
                    return Ok(());
                };

                // Missing value stays None and renders as steady off
                let level = value.map(|arg| {
                    if arg.is_truthy() {
                        feedback.on_value
                    } else {
                        feedback.off_value
                    }
                });

                if feedback.blink {
                    let id = format!("{}#{}", address, feedback.number);
                    let frame = feedback.frame;
                    let number = feedback.number;
                    let channel = feedback.channel;
                    let callback: BlinkCallback =
                        Arc::new(move |v| handle.send(&feedback_frame(frame, number, channel, v)));
                    self.blink
                        .register(id, level, feedback.on_value, feedback.off_value, callback);
                    Ok(())
                } else {
                    let v = level.unwrap_or(feedback.off_value);
                    handle.send(&feedback_frame(
                        feedback.frame,
                        feedback.number,
                        feedback.channel,
                        v,
                    ))
                }
            }
        }
    }
}

/// Build the outbound MIDI frame for an indicator value
fn feedback_frame(kind: FrameKind, number: u8, channel: u8, value: u8) -> MidiMessage {
    match kind {
        FrameKind::Note => {
            if value > 0 {
                MidiMessage::NoteOn {
                    channel,
                    note: number,
                    velocity: value,
                }
            } else {
                MidiMessage::NoteOff {
                    channel,
                    note: number,
                    velocity: 0,
                }
            }
        }
        FrameKind::Cc => MidiMessage::ControlChange {
            channel,
            controller: number,
            value,
        },
    }
}
