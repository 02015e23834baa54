//! Direct-wired deployments: periodically read the gateway into the control
//! state. In this mode the relay itself is the pump-state authority.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::warn;

use crate::error::ControlError;
use crate::gateway::Gateway;
use crate::state::{soil_in_range, ControlHandle, SensorReading};

/// Bound one gateway call by `limit`.
async fn bounded<T>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| anyhow!("{what} timed out after {limit:?}"))?
}

/// Read every sensor once. A failed, hung or out-of-range read leaves that
/// field undefined instead of failing the whole sample.
pub async fn sample(gateway: &dyn Gateway, read_timeout: Duration) -> SensorReading {
    let climate = bounded(
        read_timeout,
        "temperature/humidity read",
        gateway.read_temperature_humidity(),
    )
    .await;
    let (temperature, humidity) = match climate {
        Ok(v) => v,
        Err(e) => {
            warn!("{}", ControlError::SensorRead(format!("temperature/humidity: {e:#}")));
            (None, None)
        }
    };

    let soil = bounded(read_timeout, "soil read", gateway.read_soil_moisture()).await;
    let soil_percent = match soil {
        Ok(Some(v)) if soil_in_range(v) => Some(v),
        Ok(Some(v)) => {
            warn!("{}", ControlError::SensorRead(format!("soil {v} out of range")));
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!("{}", ControlError::SensorRead(format!("soil: {e:#}")));
            None
        }
    };

    SensorReading {
        temperature,
        humidity,
        soil_percent,
    }
}

/// Sample once and sync the pump state from the relay.
///
/// The relay read and the state write happen under one write guard, the
/// same one `toggle` holds across its command, so a toggle can never land
/// between them and be overwritten by a stale relay value.
pub async fn poll_once(state: &ControlHandle, gateway: &dyn Gateway, read_timeout: Duration) {
    let reading = sample(gateway, read_timeout).await;

    let mut st = state.write().await;
    st.record_sample(reading);
    match bounded(read_timeout, "pump state read", gateway.get_pump_state()).await {
        Ok(pump) => {
            st.set_pump_state(pump);
        }
        Err(e) => warn!("pump state read failed: {e:#}"),
    }
}

pub async fn run(
    state: ControlHandle,
    gateway: Arc<dyn Gateway>,
    interval: Duration,
    read_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        poll_once(&state, gateway.as_ref(), read_timeout).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
