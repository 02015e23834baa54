//! Stateful field simulator for local development.
//!
//! Models a single bed with one pump:
//! - Soil moisture (percent) drifts toward dry, rises while the pump runs
//! - Per-reading sensor noise, bounded so readings stay in `[0, 100]`
//! - Temperature and humidity follow a slow mean-reverting random walk

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-band and dries steadily, so the hub's auto mode will start
    /// the pump within a few minutes.
    Drying,
    /// Hovers in the dead zone. Good for exercising manual mode.
    Stable,
    /// Starts near saturation; auto mode should leave the pump alone.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSample {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_percent: f64,
}

pub struct FieldSim {
    soil: f64,
    temperature: f64,
    humidity: f64,

    /// Percent lost per sample while the pump is off.
    dry_rate: f64,
    /// Percent gained per sample while the pump is on.
    wet_rate: f64,
    noise_sigma: f64,
}

const TEMP_CENTER: f64 = 26.0;
const HUMIDITY_CENTER: f64 = 60.0;
const MEAN_REVERSION: f64 = 0.05;

impl FieldSim {
    pub fn new(scenario: Scenario) -> Self {
        let (soil, dry_rate, wet_rate, noise_sigma) = match scenario {
            Scenario::Drying => (35.0, 0.8, 3.0, 0.4),
            Scenario::Stable => (40.0, 0.05, 3.0, 0.2),
            Scenario::Wet => (85.0, 0.1, 3.0, 0.3),
        };
        Self {
            soil,
            temperature: TEMP_CENTER,
            humidity: HUMIDITY_CENTER,
            dry_rate,
            wet_rate,
            noise_sigma,
        }
    }

    /// True soil moisture without sensor noise.
    pub fn soil(&self) -> f64 {
        self.soil
    }

    /// Advance one sample period and return what the sensors would read.
    pub fn step(&mut self, pump_on: bool) -> FieldSample {
        let delta = if pump_on { self.wet_rate } else { -self.dry_rate };
        self.soil = (self.soil + delta).clamp(0.0, 100.0);

        self.temperature += MEAN_REVERSION * (TEMP_CENTER - self.temperature) + gaussian(0.0, 0.2);
        self.humidity = (self.humidity
            + MEAN_REVERSION * (HUMIDITY_CENTER - self.humidity)
            + gaussian(0.0, 0.5))
        .clamp(0.0, 100.0);

        let measured = (self.soil + gaussian(0.0, self.noise_sigma)).clamp(0.0, 100.0);

        FieldSample {
            temperature: round2(self.temperature),
            humidity: round2(self.humidity),
            soil_percent: round2(measured),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_parse_defaults_to_drying() {
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy("monsoon"), Scenario::Drying);
    }

    #[test]
    fn scenario_display_round_trips() {
        for s in [Scenario::Drying, Scenario::Stable, Scenario::Wet] {
            assert_eq!(Scenario::from_str_lossy(&s.to_string()), s);
        }
    }

    #[test]
    fn soil_dries_without_pump() {
        let mut sim = FieldSim::new(Scenario::Drying);
        let start = sim.soil();
        for _ in 0..10 {
            sim.step(false);
        }
        assert!(sim.soil() < start);
    }

    #[test]
    fn soil_rises_with_pump() {
        let mut sim = FieldSim::new(Scenario::Drying);
        let start = sim.soil();
        for _ in 0..5 {
            sim.step(true);
        }
        assert!(sim.soil() > start);
    }

    #[test]
    fn readings_stay_in_range() {
        let mut sim = FieldSim::new(Scenario::Wet);
        for i in 0..500 {
            let s = sim.step(i < 250);
            assert!((0.0..=100.0).contains(&s.soil_percent), "soil {}", s.soil_percent);
            assert!((0.0..=100.0).contains(&s.humidity), "humidity {}", s.humidity);
        }
    }

    #[test]
    fn readings_have_two_decimals() {
        let mut sim = FieldSim::new(Scenario::Stable);
        let s = sim.step(false);
        assert_eq!(round2(s.soil_percent), s.soil_percent);
        assert_eq!(round2(s.temperature), s.temperature);
    }
}
