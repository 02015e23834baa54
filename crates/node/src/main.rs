mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FieldSample, FieldSim, Scenario};

/// Flat reading published on the sensor topic.
#[derive(Debug, Serialize)]
struct SensorMsg {
    temperature: f64,
    humidity: f64,
    soil_percent: f64,
}

impl From<FieldSample> for SensorMsg {
    fn from(s: FieldSample) -> Self {
        Self {
            temperature: s.temperature,
            humidity: s.humidity,
            soil_percent: s.soil_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Topics {
    sensors: String,
    pump_state: String,
    pump_command: String,
}

impl Topics {
    fn with_prefix(prefix: &str) -> Self {
        Self {
            sensors: format!("{prefix}/sensors"),
            pump_state: format!("{prefix}/pump/state"),
            pump_command: format!("{prefix}/pump/set"),
        }
    }
}

/// Parse an "on"/"off" command (case-insensitive, trims whitespace).
fn parse_pump_command(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_ascii_lowercase();
    match s.as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(format!("unknown pump command '{s}'")),
    }
}

fn state_payload(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "field-1".to_string());
    let prefix = env::var("TOPIC_PREFIX").unwrap_or_else(|_| "farm".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let topics = Topics::with_prefix(&prefix);

    let mut mqttoptions = MqttOptions::new(format!("smartfarm-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // The relay lives on the event-loop task; the sampler only reads it.
    let (pump_tx, pump_rx) = watch::channel(false);
    let loop_client = client.clone();
    let loop_topics = topics.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) =
                        loop_client.try_subscribe(loop_topics.pump_command.as_str(), QoS::AtLeastOnce)
                    {
                        error!("subscribe failed: {e}");
                    }
                    report(&loop_client, &loop_topics, *pump_tx.borrow());
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == loop_topics.pump_command => {
                    match parse_pump_command(&p.payload) {
                        Ok(on) => {
                            pump_tx.send_replace(on);
                            info!("[sim-relay] pump set {}", state_payload(on));
                            report(&loop_client, &loop_topics, on);
                        }
                        Err(msg) => warn!("{msg} (use on/off)"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        node_id = %node_id,
        %scenario,
        sensors = %topics.sensors,
        sample_every_s,
        "node started"
    );

    let mut field = FieldSim::new(scenario);
    loop {
        let sample = field.step(*pump_rx.borrow());
        let msg = SensorMsg::from(sample);
        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client
            .publish(topics.sensors.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("publish error: {e}");
        } else {
            info!(
                soil = msg.soil_percent,
                temperature = msg.temperature,
                humidity = msg.humidity,
                "published reading"
            );
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

/// Publish the relay state. Non-blocking: called from the event-loop task.
fn report(client: &AsyncClient, topics: &Topics, on: bool) {
    if let Err(e) = client.try_publish(
        topics.pump_state.as_str(),
        QoS::AtLeastOnce,
        false,
        state_payload(on).as_bytes().to_vec(),
    ) {
        error!("pump state report failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
