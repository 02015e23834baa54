use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::error::ControlError;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    On,
    #[default]
    Off,
}

impl PumpState {
    pub fn inverse(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Manual,
    Auto,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(ControlError::InvalidModeValue(other.to_string())),
        }
    }
}

/// Latest known environment values. Each field is independently optional:
/// a sensor that failed or never reported is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_percent: Option<f64>,
}

impl SensorReading {
    /// Copy every field that is present in `delta`, leaving the rest alone.
    pub fn merge(&mut self, delta: &SensorReading) {
        if delta.temperature.is_some() {
            self.temperature = delta.temperature;
        }
        if delta.humidity.is_some() {
            self.humidity = delta.humidity;
        }
        if delta.soil_percent.is_some() {
            self.soil_percent = delta.soil_percent;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none() && self.soil_percent.is_none()
    }

    fn describe(&self) -> String {
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
        format!(
            "temperature={} humidity={} soil={}",
            fmt(self.temperature),
            fmt(self.humidity),
            fmt(self.soil_percent)
        )
    }
}

/// Returns true when `v` is a usable soil moisture percentage.
pub fn soil_in_range(v: f64) -> bool {
    (0.0..=100.0).contains(&v)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Pump,
    Mode,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

/// The single record every execution context reads and writes. It is only
/// reachable through a [`ControlHandle`].
pub struct ControlState {
    reading: SensorReading,
    pump_state: PumpState,
    mode: Mode,
    loop_generation: u64,
    started_at: Instant,
    transport_connected: bool,
    events: VecDeque<SystemEvent>,
}

/// Consistent copy of the control fields, taken under one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub reading: SensorReading,
    pub pump_state: PumpState,
    pub mode: Mode,
    pub loop_generation: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub transport_connected: bool,
    pub loop_generation: u64,
    pub mode: Mode,
    pub pump: PumpState,
    pub reading: SensorReading,
    pub events: Vec<SystemEvent>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            reading: SensorReading::default(),
            pump_state: PumpState::Off,
            mode: Mode::Manual,
            loop_generation: 0,
            started_at: Instant::now(),
            transport_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pump_state(&self) -> PumpState {
        self.pump_state
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            reading: self.reading,
            pump_state: self.pump_state,
            mode: self.mode,
            loop_generation: self.loop_generation,
        }
    }

    /// Merge the fields present in `delta` into the latest reading.
    pub fn apply_reading(&mut self, delta: &SensorReading) {
        self.reading.merge(delta);
        self.push_event(EventKind::Reading, delta.describe());
    }

    /// Replace the whole reading with a complete sample. Fields that failed
    /// to read are `None` in `sample` and become undefined here.
    pub fn record_sample(&mut self, sample: SensorReading) {
        self.reading = sample;
        self.push_event(EventKind::Reading, sample.describe());
    }

    /// Returns true if the stored state actually changed.
    pub fn set_pump_state(&mut self, state: PumpState) -> bool {
        if self.pump_state == state {
            return false;
        }
        self.pump_state = state;
        self.push_event(EventKind::Pump, format!("pump {state}"));
        true
    }

    /// Plain field write. Use [`ControlState::enter_auto`] for the
    /// Manual→Auto transition so the generation moves with the mode.
    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.mode = mode;
            self.push_event(EventKind::Mode, format!("mode {mode}"));
        }
    }

    /// Switch to Auto and open a new loop generation. Returns the generation
    /// the new automation loop must capture.
    pub fn enter_auto(&mut self) -> u64 {
        self.loop_generation += 1;
        self.mode = Mode::Auto;
        self.push_event(
            EventKind::Mode,
            format!("mode auto (generation {})", self.loop_generation),
        );
        self.loop_generation
    }

    /// Whether a loop holding `generation` is still the authoritative one.
    pub fn is_authoritative(&self, generation: u64) -> bool {
        self.mode == Mode::Auto && self.loop_generation == generation
    }

    pub fn set_transport_connected(&mut self, connected: bool) {
        self.transport_connected = connected;
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    #[cfg(test)]
    pub fn events(&self) -> impl Iterator<Item = &SystemEvent> {
        self.events.iter()
    }

    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            transport_connected: self.transport_connected,
            loop_generation: self.loop_generation,
            mode: self.mode,
            pump: self.pump_state,
            reading: self.reading,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable owner of the one [`ControlState`]. Every read and write goes
/// through the same lock, so observers never see a partial cross-field write.
#[derive(Clone, Default)]
pub struct ControlHandle {
    inner: Arc<RwLock<ControlState>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn status(&self) -> StatusResponse {
        self.inner.read().await.to_status()
    }

    pub async fn apply_reading(&self, delta: &SensorReading) {
        self.inner.write().await.apply_reading(delta);
    }

    pub async fn set_pump_state(&self, state: PumpState) -> bool {
        self.inner.write().await.set_pump_state(state)
    }

    #[cfg(test)]
    pub async fn set_mode(&self, mode: Mode) {
        self.inner.write().await.set_mode(mode);
    }

    pub async fn set_transport_connected(&self, connected: bool) {
        let mut st = self.inner.write().await;
        if st.transport_connected != connected {
            st.set_transport_connected(connected);
            let detail = if connected {
                "transport connected"
            } else {
                "transport disconnected"
            };
            st.record_system(detail.to_string());
        }
    }

    pub async fn record_error(&self, detail: String) {
        self.inner.write().await.record_error(detail);
    }

    pub async fn record_system(&self, detail: String) {
        self.inner.write().await.record_system(detail);
    }

    /// What an automation loop holding `generation` needs for one decision,
    /// or `None` once that loop has been superseded.
    pub async fn automation_view(&self, generation: u64) -> Option<(Option<f64>, PumpState)> {
        let st = self.inner.read().await;
        st.is_authoritative(generation)
            .then(|| (st.reading.soil_percent, st.pump_state))
    }

    pub async fn is_authoritative(&self, generation: u64) -> bool {
        self.inner.read().await.is_authoritative(generation)
    }

    /// Exclusive access for compound read-modify-write sequences.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, ControlState> {
        self.inner.write().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
