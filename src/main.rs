//! MidiMix GW - MIDI control surface to mixer gateway
//!
//! Bridges MIDI control surfaces, an XR18-style mixer (OSC over UDP), and an
//! MQTT message bus.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midimix_gw::bus::{self, MqttBus};
use midimix_gw::config::AppConfig;
use midimix_gw::devices::{DeviceRegistry, MidiPorts, MidirPorts};
use midimix_gw::mapping::MappingTable;
use midimix_gw::mixer::{MixerEvent, UdpMixerPort};
use midimix_gw::router::Router;
use midimix_gw::state::SnapshotActor;

/// MidiMix Gateway - drive a digital mixer from MIDI control surfaces
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    if args.list_devices {
        list_devices();
        return Ok(());
    }

    info!("Starting MidiMix GW...");
    info!("Configuration file: {}", args.config);

    let config = AppConfig::load(&args.config)?;
    run_app(config).await?;

    info!("MidiMix GW shutdown complete");
    Ok(())
}

async fn run_app(config: AppConfig) -> Result<()> {
    let table = Arc::new(MappingTable::from_config(&config));
    info!("Mapping table loaded: {} forward mapping(s)", table.len());
    if table.is_empty() {
        warn!("No control mappings configured; only bus commands will be routed");
    }

    // MIDI devices
    let ports: Arc<dyn MidiPorts> = Arc::new(MidirPorts);
    let registry = Arc::new(DeviceRegistry::new(
        Arc::clone(&ports),
        config.midi.output_device.as_deref(),
    ));

    let (surface_tx, mut surface_rx) = mpsc::unbounded_channel();
    // Held for the process lifetime; dropping it closes the input port
    let _input = registry
        .open_input(&config.midi.input_device, surface_tx)
        .with_context(|| {
            format!(
                "Failed to open MIDI input device '{}'",
                config.midi.input_device
            )
        })?;
    info!("MIDI input '{}' open", config.midi.input_device);

    // Mixer transport
    let remote = format!("{}:{}", config.mixer.address, config.mixer.port)
        .to_socket_addrs()
        .with_context(|| format!("Invalid mixer address '{}'", config.mixer.address))?
        .next()
        .ok_or_else(|| anyhow!("Mixer address '{}' did not resolve", config.mixer.address))?;
    let (mixer, mut mixer_rx) = UdpMixerPort::connect(config.mixer.local_port, remote).await?;

    // Message bus
    let topics = bus::subscription_topics(
        &config.bus.base_topic,
        &table.forward_targets(),
        &table.feedback_addresses(),
    );
    let (mqtt, mut bus_rx) = MqttBus::connect(&config.bus, topics);

    // Snapshot persistence
    let snapshots = match SnapshotActor::spawn(&config.state.path, config.state.debounce_ms) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("State persistence disabled: {}", e);
            None
        }
    };

    let (router, mut debounce_rx) = Router::new(
        table,
        registry,
        mixer,
        Arc::new(mqtt),
        snapshots,
        config.bus.base_topic.clone(),
    );

    router.replay_snapshot().await;

    info!("Ready to process events");

    let mut fatal = Ok(());
    loop {
        tokio::select! {
            Some(event) = surface_rx.recv() => {
                router.on_surface_event(event).await;
            }
            Some((key, payload)) = debounce_rx.recv() => {
                router.on_coalesced_cc(key, payload).await;
            }
            Some(event) = mixer_rx.recv() => {
                match event {
                    MixerEvent::Message(message) => router.on_mixer_message(&message).await,
                    MixerEvent::Closed => {
                        error!("Mixer connection closed; exiting");
                        // Grace delay so the log line lands before the exit
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        fatal = Err(anyhow!("mixer connection closed"));
                        break;
                    }
                }
            }
            Some(message) = bus_rx.recv() => {
                debug!("Bus RX: '{}' ({} bytes)", message.topic, message.payload.len());
                router.on_bus_message(message).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    info!("Shutting down...");
    router.shutdown().await;
    fatal
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

fn list_devices() {
    use colored::*;

    let ports = MidirPorts;

    println!("\n{}", "=== MIDI Devices ===".bold().cyan());

    println!("\n{}", "Inputs:".bold());
    let inputs = ports.input_names();
    if inputs.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for (i, name) in inputs.iter().enumerate() {
        println!("  [{}] {}", i.to_string().yellow(), name.green());
    }

    println!("\n{}", "Outputs:".bold());
    let outputs = ports.output_names();
    if outputs.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for (i, name) in outputs.iter().enumerate() {
        println!("  [{}] {}", i.to_string().yellow(), name.green());
    }

    println!();
}
