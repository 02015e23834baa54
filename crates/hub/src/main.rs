mod automation;
mod config;
mod control;
mod error;
mod gateway;
mod ingress;
mod mqtt;
mod sampler;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use automation::{AutomationSettings, Hysteresis};
use config::{Config, Transport};
use control::Controller;
use gateway::{Actuator, Gateway, GatewayActuator};
use state::ControlHandle;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::resolve(&config_path)?;
    info!(
        transport = ?cfg.transport,
        interval_sec = cfg.control.interval_sec,
        low = cfg.control.low_threshold,
        high = cfg.control.high_threshold,
        "config loaded"
    );

    let settings = AutomationSettings {
        band: Hysteresis {
            low: cfg.control.low_threshold,
            high: cfg.control.high_threshold,
        },
        interval: cfg.control.interval(),
        command_timeout: cfg.control.command_timeout(),
    };

    // ── Shared state (lives for the whole process) ──────────────────
    let state = ControlHandle::new();
    state.record_system("hub started".to_string()).await;

    let actuator: Arc<dyn Actuator> = match cfg.transport {
        Transport::Direct => start_direct(&cfg, &state)?,
        Transport::Mqtt => start_mqtt(&cfg, &state),
    };

    let controller = Controller::new(state, actuator, settings);
    web::serve(controller, cfg.web.port).await
}

/// Variant A: sensors and relay are wired to this host.
fn start_direct(cfg: &Config, state: &ControlHandle) -> Result<Arc<dyn Actuator>> {
    let gateway = build_gateway(cfg)?;
    tokio::spawn(sampler::run(
        state.clone(),
        Arc::clone(&gateway),
        Duration::from_secs(cfg.sampler.interval_sec),
        cfg.control.command_timeout(),
    ));
    Ok(Arc::new(GatewayActuator::new(gateway)))
}

#[cfg(feature = "gpio")]
fn build_gateway(cfg: &Config) -> Result<Arc<dyn Gateway>> {
    use anyhow::Context;
    let gpio = gateway::GpioGateway::new(&cfg.gpio).context("failed to initialise gpio gateway")?;
    Ok(Arc::new(gpio))
}

#[cfg(not(feature = "gpio"))]
fn build_gateway(_cfg: &Config) -> Result<Arc<dyn Gateway>> {
    Ok(Arc::new(gateway::SimGateway::drifting()))
}

/// Variant B: telemetry arrives over MQTT and commands are published.
fn start_mqtt(cfg: &Config, state: &ControlHandle) -> Arc<dyn Actuator> {
    let (client, eventloop) = mqtt::connect(&cfg.mqtt);
    let (dispatch, deliveries) = ingress::queues(cfg.mqtt.queue_capacity);

    tokio::spawn(ingress::run(state.clone(), deliveries));
    tokio::spawn(mqtt::drive(
        eventloop,
        client.clone(),
        cfg.mqtt.topics.clone(),
        dispatch,
        state.clone(),
    ));

    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        sensors = %cfg.mqtt.topics.sensors,
        pump_state = %cfg.mqtt.topics.pump_state,
        "mqtt transport started"
    );

    Arc::new(mqtt::MqttActuator::new(client, &cfg.mqtt.topics))
}
