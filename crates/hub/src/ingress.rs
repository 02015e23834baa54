//! Telemetry ingress: merges readings and externally reported pump state
//! from the pub/sub transport into the control state.
//!
//! The transport driver pushes each inbound publish into a bounded queue for
//! its topic; this module is the single consumer of both queues, so delivery
//! order within a topic is preserved.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::mqtt::{parse_pump_report, parse_sensor_payload};
use crate::state::{ControlHandle, PumpState, SensorReading};

/// Producer side, held by the transport driver.
#[derive(Clone)]
pub struct Dispatch {
    sensors: mpsc::Sender<Vec<u8>>,
    pump_state: mpsc::Sender<Vec<u8>>,
}

/// Consumer side, owned by [`run`].
pub struct Deliveries {
    pub(crate) sensors: mpsc::Receiver<Vec<u8>>,
    pub(crate) pump_state: mpsc::Receiver<Vec<u8>>,
}

pub fn queues(capacity: usize) -> (Dispatch, Deliveries) {
    let (sensors_tx, sensors_rx) = mpsc::channel(capacity);
    let (pump_tx, pump_rx) = mpsc::channel(capacity);
    (
        Dispatch {
            sensors: sensors_tx,
            pump_state: pump_tx,
        },
        Deliveries {
            sensors: sensors_rx,
            pump_state: pump_rx,
        },
    )
}

impl Dispatch {
    /// Returns false once the consumer is gone.
    pub async fn sensors(&self, payload: Vec<u8>) -> bool {
        self.sensors.send(payload).await.is_ok()
    }

    /// Returns false once the consumer is gone.
    pub async fn pump_state(&self, payload: Vec<u8>) -> bool {
        self.pump_state.send(payload).await.is_ok()
    }
}

/// Consume both queues until every producer has gone away. A bad payload is
/// logged and dropped; it never ends the loop.
pub async fn run(state: ControlHandle, mut deliveries: Deliveries) {
    info!("telemetry ingress started");
    loop {
        tokio::select! {
            Some(payload) = deliveries.sensors.recv() => {
                let _ = handle_sensor_payload(&state, &payload).await;
            }
            Some(payload) = deliveries.pump_state.recv() => {
                let _ = handle_pump_report(&state, &payload).await;
            }
            else => break,
        }
    }
    info!("telemetry ingress stopped");
}

pub async fn handle_sensor_payload(
    state: &ControlHandle,
    payload: &[u8],
) -> Result<SensorReading, ControlError> {
    match parse_sensor_payload(payload) {
        Ok(reading) => {
            if reading.is_empty() {
                debug!("sensor payload carried no fields");
            } else {
                debug!(?reading, "sensor reading");
                state.apply_reading(&reading).await;
            }
            Ok(reading)
        }
        Err(e) => {
            warn!(
                payload = %String::from_utf8_lossy(payload),
                "dropping sensor payload: {e}"
            );
            state.record_error(e.to_string()).await;
            Err(e)
        }
    }
}

/// The reported state is authoritative and overwrites whatever the hub last
/// commanded.
pub async fn handle_pump_report(
    state: &ControlHandle,
    payload: &[u8],
) -> Result<PumpState, ControlError> {
    match parse_pump_report(payload) {
        Ok(pump) => {
            if state.set_pump_state(pump).await {
                info!("pump reported {pump}");
            }
            Ok(pump)
        }
        Err(e) => {
            warn!("dropping pump report: {e}");
            state.record_error(e.to_string()).await;
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
