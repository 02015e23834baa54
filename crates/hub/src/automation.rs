//! Automatic pump control: a background loop that applies a hysteresis band
//! to soil moisture while the controller is in Auto mode.
//!
//! Each loop instance captures the generation it was started with and exits
//! as soon as that generation is no longer current (or the mode is no longer
//! Auto). The check runs at the top of every iteration and again right after
//! waking, so a superseded loop issues at most one more command.
//!
//! ```text
//! Idle ──[spawned with generation G]──▶ Running ──[G stale or mode Manual]──▶ Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::ControlError;
use crate::gateway::Actuator;
use crate::state::{ControlHandle, PumpState};

/// Low/high soil thresholds in percent. Both comparisons are strict, so the
/// closed band `[low, high]` never causes a transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    pub low: f64,
    pub high: f64,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            low: 20.0,
            high: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutomationSettings {
    pub band: Hysteresis,
    pub interval: Duration,
    pub command_timeout: Duration,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            band: Hysteresis::default(),
            interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// Pure hysteresis decision. Returns the command to issue, if any.
pub fn decide(soil: Option<f64>, pump: PumpState, band: &Hysteresis) -> Option<PumpState> {
    let soil = soil?;
    match pump {
        PumpState::Off if soil < band.low => Some(PumpState::On),
        PumpState::On if soil > band.high => Some(PumpState::Off),
        _ => None,
    }
}

/// Send one pump command, bounded by `timeout`.
pub async fn send_command(
    actuator: &dyn Actuator,
    state: PumpState,
    timeout: Duration,
) -> Result<(), ControlError> {
    match tokio::time::timeout(timeout, actuator.command(state)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ControlError::ActuatorCommand(format!("{e:#}"))),
        Err(_) => Err(ControlError::ActuatorCommand(format!(
            "no response within {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Run the loop until it is superseded. Intended to be `tokio::spawn`-ed by
/// the mode handler; returns the last generation it observed as current.
pub async fn run(
    state: ControlHandle,
    actuator: Arc<dyn Actuator>,
    settings: AutomationSettings,
    generation: u64,
) -> u64 {
    info!(
        generation,
        interval_sec = settings.interval.as_secs_f64(),
        low = settings.band.low,
        high = settings.band.high,
        "automation loop started"
    );

    loop {
        let Some((soil, pump)) = state.automation_view(generation).await else {
            break;
        };

        tick(&state, actuator.as_ref(), &settings, generation, soil, pump).await;

        tokio::time::sleep(settings.interval).await;

        if !state.is_authoritative(generation).await {
            break;
        }
    }

    let current = state.snapshot().await.loop_generation;
    info!(generation, current, "automation loop stopped");
    current
}

async fn tick(
    state: &ControlHandle,
    actuator: &dyn Actuator,
    settings: &AutomationSettings,
    generation: u64,
    soil: Option<f64>,
    pump: PumpState,
) {
    let Some(soil_value) = soil else {
        debug!(generation, "no soil reading, skipping tick");
        return;
    };

    let Some(command) = decide(soil, pump, &settings.band) else {
        return;
    };

    match send_command(actuator, command, settings.command_timeout).await {
        Ok(()) => {
            info!(
                generation,
                soil = format!("{soil_value:.2}"),
                "auto pump {command}"
            );
            state.set_pump_state(command).await;
        }
        Err(e) => {
            // Not retried here: the next tick is the retry.
            error!(generation, "auto pump {command} failed: {e}");
            state.record_error(format!("auto pump {command} failed: {e}")).await;
        }
    }
}

/// Log a loop task that ended abnormally (panicked). Loops never return
/// errors.
pub fn watch(handle: tokio::task::JoinHandle<u64>, generation: u64) {
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            warn!(generation, "automation loop task ended abnormally: {e}");
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================
