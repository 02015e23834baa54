use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, TopicConfig};
use crate::error::ControlError;
use crate::gateway::Actuator;
use crate::ingress::Dispatch;
use crate::state::{soil_in_range, ControlHandle, Mode, PumpState, SensorReading};

/// Delay before polling again after a transport error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Flat sensor payload. Absent and `null` fields are both "not reported".
#[derive(Debug, Deserialize)]
pub(crate) struct SensorMsg {
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) humidity: Option<f64>,
    #[serde(default)]
    pub(crate) soil_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Parse a sensor payload into a reading delta.
pub(crate) fn parse_sensor_payload(payload: &[u8]) -> Result<SensorReading, ControlError> {
    let msg: SensorMsg = serde_json::from_slice(payload)
        .map_err(|e| ControlError::MalformedTelemetry(format!("bad sensor json: {e}")))?;

    if let Some(soil) = msg.soil_percent {
        if !soil_in_range(soil) {
            return Err(ControlError::MalformedTelemetry(format!(
                "soil_percent {soil} out of range [0, 100]"
            )));
        }
    }

    Ok(SensorReading {
        temperature: msg.temperature,
        humidity: msg.humidity,
        soil_percent: msg.soil_percent,
    })
}

/// Parse an "on"/"off" payload (case-insensitive, trims whitespace).
pub(crate) fn parse_pump_report(payload: &[u8]) -> Result<PumpState, ControlError> {
    let s = String::from_utf8_lossy(payload).trim().to_ascii_lowercase();
    match s.as_str() {
        "on" => Ok(PumpState::On),
        "off" => Ok(PumpState::Off),
        _ => Err(ControlError::MalformedTelemetry(format!(
            "unknown pump state '{s}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Issues pump commands and mode announcements by publishing. The relay
/// owner reports the resulting state back on the pump-state topic.
pub struct MqttActuator {
    client: AsyncClient,
    command_topic: String,
    mode_topic: String,
}

impl MqttActuator {
    pub fn new(client: AsyncClient, topics: &TopicConfig) -> Self {
        Self {
            client,
            command_topic: topics.pump_command.clone(),
            mode_topic: topics.mode.clone(),
        }
    }
}

#[async_trait]
impl Actuator for MqttActuator {
    async fn command(&self, state: PumpState) -> Result<()> {
        self.client
            .publish(
                self.command_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                state.as_str().as_bytes().to_vec(),
            )
            .await
            .with_context(|| format!("failed to publish pump {state}"))
    }

    async fn announce_mode(&self, mode: Mode) -> Result<()> {
        self.client
            .publish(
                self.mode_topic.as_str(),
                QoS::AtLeastOnce,
                true,
                mode.as_str().as_bytes().to_vec(),
            )
            .await
            .with_context(|| format!("failed to announce mode {mode}"))
    }
}

// ---------------------------------------------------------------------------
// Transport driver
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    AsyncClient::new(options, cfg.queue_capacity)
}

/// Poll the event loop forever, (re)subscribing on every ConnAck and handing
/// inbound publishes to the per-topic ingress queues.
pub async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: TopicConfig,
    dispatch: Dispatch,
    state: ControlHandle,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                route(&topics, &p.topic, p.payload.to_vec(), &dispatch).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                subscribe(&client, &topics);
                state.set_transport_connected(true).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                state.set_transport_connected(false).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                state.set_transport_connected(false).await;
                state.record_error(format!("mqtt error: {e}")).await;
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn subscribe(client: &AsyncClient, topics: &TopicConfig) {
    for topic in [&topics.sensors, &topics.pump_state] {
        // Non-blocking: this runs on the task that drains the request queue.
        match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!(topic = %topic, "subscribed"),
            Err(e) => error!(topic = %topic, "subscribe failed: {e}"),
        }
    }
}

async fn route(topics: &TopicConfig, topic: &str, payload: Vec<u8>, dispatch: &Dispatch) {
    let delivered = if topic == topics.sensors {
        dispatch.sensors(payload).await
    } else if topic == topics.pump_state {
        dispatch.pump_state(payload).await
    } else {
        debug!(topic, "unhandled topic");
        return;
    };
    if !delivered {
        error!(topic, "ingress queue closed, message dropped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
