//! Sensor/relay access. The `gpio` feature adds the real rppal-backed
//! gateway; [`SimGateway`] is always available for development and tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::state::{Mode, PumpState};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Minimal read/command interface to the hardware.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn read_temperature_humidity(&self) -> Result<(Option<f64>, Option<f64>)>;
    /// Soil moisture as a percentage in `[0, 100]`.
    async fn read_soil_moisture(&self) -> Result<Option<f64>>;
    async fn get_pump_state(&self) -> Result<PumpState>;
    async fn set_pump(&self, state: PumpState) -> Result<()>;
}

/// Where pump commands and mode announcements go. Direct deployments write
/// the relay, pub/sub deployments publish.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn command(&self, state: PumpState) -> Result<()>;

    async fn announce_mode(&self, _mode: Mode) -> Result<()> {
        Ok(())
    }
}

/// Drives the relay through a locally attached [`Gateway`].
pub struct GatewayActuator {
    gateway: Arc<dyn Gateway>,
}

impl GatewayActuator {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Actuator for GatewayActuator {
    async fn command(&self, state: PumpState) -> Result<()> {
        self.gateway.set_pump(state).await
    }
}

// ---------------------------------------------------------------------------
// Simulated gateway
// ---------------------------------------------------------------------------

/// Moisture lost per soil read while the pump is off.
const SIM_DRY_RATE: f64 = 0.5;
/// Moisture gained per soil read while the pump is on.
const SIM_WET_RATE: f64 = 2.0;

struct SimInner {
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil: Option<f64>,
    pump: PumpState,
    drift: bool,
    fail_reads: bool,
    fail_commands: bool,
    commands: Vec<PumpState>,
}

/// In-memory stand-in for the sensor board and pump relay.
pub struct SimGateway {
    inner: Mutex<SimInner>,
}

impl Default for SimGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGateway {
    /// Static values, no drift.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                temperature: Some(24.0),
                humidity: Some(55.0),
                soil: Some(45.0),
                pump: PumpState::Off,
                drift: false,
                fail_reads: false,
                fail_commands: false,
                commands: Vec::new(),
            }),
        }
    }

    /// Soil dries while the pump is off and wets while it runs.
    pub fn drifting() -> Self {
        let sim = Self::new();
        sim.lock().drift = true;
        tracing::info!("[sim-gateway] drifting soil model enabled (no hardware)");
        sim
    }

    #[cfg(test)]
    pub fn set_soil(&self, soil: Option<f64>) {
        self.lock().soil = soil;
    }

    #[cfg(test)]
    pub fn set_climate(&self, temperature: Option<f64>, humidity: Option<f64>) {
        let mut inner = self.lock();
        inner.temperature = temperature;
        inner.humidity = humidity;
    }

    #[cfg(test)]
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    #[cfg(test)]
    pub fn fail_commands(&self, fail: bool) {
        self.lock().fail_commands = fail;
    }

    /// Every command that reached the relay, in order.
    #[cfg(test)]
    pub fn commands(&self) -> Vec<PumpState> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Gateway for SimGateway {
    async fn read_temperature_humidity(&self) -> Result<(Option<f64>, Option<f64>)> {
        let inner = self.lock();
        if inner.fail_reads {
            return Ok((None, None));
        }
        Ok((inner.temperature, inner.humidity))
    }

    async fn read_soil_moisture(&self) -> Result<Option<f64>> {
        let mut inner = self.lock();
        if inner.fail_reads {
            bail!("simulated soil sensor fault");
        }
        if inner.drift {
            let step = match inner.pump {
                PumpState::On => SIM_WET_RATE,
                PumpState::Off => -SIM_DRY_RATE,
            };
            inner.soil = inner.soil.map(|s| (s + step).clamp(0.0, 100.0));
        }
        Ok(inner.soil)
    }

    async fn get_pump_state(&self) -> Result<PumpState> {
        Ok(self.lock().pump)
    }

    async fn set_pump(&self, state: PumpState) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_commands {
            bail!("simulated relay fault");
        }
        inner.pump = state;
        inner.commands.push(state);
        tracing::debug!("[sim-gateway] pump set {state}");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real hardware (requires rppal + Raspberry Pi)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use self::gpio::GpioGateway;

#[cfg(feature = "gpio")]
mod gpio {
    use anyhow::{ensure, Context, Result};
    use async_trait::async_trait;
    use rppal::gpio::{Gpio, OutputPin};
    use rppal::i2c::I2c;
    use rppal::spi::{Bus, Mode as SpiMode, SlaveSelect, Spi};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread;
    use std::time::Duration;

    use super::Gateway;
    use crate::config::GpioConfig;
    use crate::state::PumpState;

    /// SHT31 single-shot, high repeatability, clock stretching disabled.
    const SHT31_MEASURE: [u8; 2] = [0x24, 0x00];
    /// Worst-case high-repeatability measurement time is 15 ms.
    const SHT31_WAIT: Duration = Duration::from_millis(16);
    const MCP3008_MAX: f64 = 1023.0;
    const SPI_CLOCK_HZ: u32 = 1_350_000;

    pub struct GpioGateway {
        relay: Mutex<OutputPin>,
        active_low: bool,
        spi: Mutex<Spi>,
        soil_channel: u8,
        i2c: Arc<Mutex<I2c>>,
    }

    impl GpioGateway {
        pub fn new(cfg: &GpioConfig) -> Result<Self> {
            let gpio = Gpio::new().context("failed to open gpio")?;
            let mut relay = gpio
                .get(cfg.relay_pin)
                .with_context(|| format!("failed to claim relay pin {}", cfg.relay_pin))?
                .into_output();

            // Fail-safe: relay OFF at startup
            if cfg.relay_active_low {
                relay.set_high();
            } else {
                relay.set_low();
            }

            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, SpiMode::Mode0)
                .context("failed to open spi0 for mcp3008")?;

            let mut i2c = I2c::new().context("failed to open i2c bus")?;
            i2c.set_slave_address(cfg.sht31_address)
                .context("failed to address sht31")?;

            tracing::info!(
                relay_pin = cfg.relay_pin,
                active_low = cfg.relay_active_low,
                soil_channel = cfg.soil_channel,
                "gpio gateway initialised"
            );

            Ok(Self {
                relay: Mutex::new(relay),
                active_low: cfg.relay_active_low,
                spi: Mutex::new(spi),
                soil_channel: cfg.soil_channel,
                i2c: Arc::new(Mutex::new(i2c)),
            })
        }

        /// The SHT31 transaction blocks for the conversion time, so it runs on
        /// the blocking pool.
        async fn read_climate(&self) -> Result<(f64, f64)> {
            let i2c = Arc::clone(&self.i2c);
            tokio::task::spawn_blocking(move || read_sht31(&i2c))
                .await
                .context("sht31 read task failed")?
        }

        fn read_mcp3008(&self) -> Result<u16> {
            let spi = self.spi.lock().unwrap_or_else(PoisonError::into_inner);
            let write = [0x01, (0x08 | self.soil_channel) << 4, 0x00];
            let mut read = [0u8; 3];
            spi.transfer(&mut read, &write)?;
            Ok((((read[1] & 0x03) as u16) << 8) | read[2] as u16)
        }
    }

    #[async_trait]
    impl Gateway for GpioGateway {
        async fn read_temperature_humidity(&self) -> Result<(Option<f64>, Option<f64>)> {
            match self.read_climate().await {
                Ok((t, h)) => Ok((Some(t), Some(h))),
                Err(e) => {
                    tracing::warn!("sht31 read failed: {e:#}");
                    Ok((None, None))
                }
            }
        }

        async fn read_soil_moisture(&self) -> Result<Option<f64>> {
            let raw = self.read_mcp3008()?;
            Ok(Some(round2(raw as f64 / MCP3008_MAX * 100.0)))
        }

        async fn get_pump_state(&self) -> Result<PumpState> {
            let relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
            let energised = relay.is_set_high() != self.active_low;
            Ok(if energised { PumpState::On } else { PumpState::Off })
        }

        async fn set_pump(&self, state: PumpState) -> Result<()> {
            let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
            let high = (state == PumpState::On) != self.active_low;
            if high {
                relay.set_high();
            } else {
                relay.set_low();
            }
            tracing::info!("relay set {state}");
            Ok(())
        }
    }

    fn read_sht31(i2c: &Mutex<I2c>) -> Result<(f64, f64)> {
        let i2c = i2c.lock().unwrap_or_else(PoisonError::into_inner);
        i2c.write(&SHT31_MEASURE)?;
        thread::sleep(SHT31_WAIT);
        let mut buf = [0u8; 6];
        i2c.read(&mut buf)?;
        ensure!(crc8(&buf[0..2]) == buf[2], "sht31 temperature crc mismatch");
        ensure!(crc8(&buf[3..5]) == buf[5], "sht31 humidity crc mismatch");

        let raw_t = u16::from_be_bytes([buf[0], buf[1]]) as f64;
        let raw_h = u16::from_be_bytes([buf[3], buf[4]]) as f64;
        let t = -45.0 + 175.0 * raw_t / 65535.0;
        let h = 100.0 * raw_h / 65535.0;
        Ok((round2(t), round2(h)))
    }

    fn round2(v: f64) -> f64 {
        (v * 100.0).round() / 100.0
    }

    /// Sensirion CRC-8 (poly 0x31, init 0xFF).
    fn crc8(data: &[u8]) -> u8 {
        let mut crc: u8 = 0xFF;
        for &b in data {
            crc ^= b;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 {
                    (crc << 1) ^ 0x31
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_starts_off_and_records_commands() {
        let sim = SimGateway::new();
        assert_eq!(sim.get_pump_state().await.unwrap(), PumpState::Off);

        sim.set_pump(PumpState::On).await.unwrap();
        sim.set_pump(PumpState::Off).await.unwrap();

        assert_eq!(sim.commands(), vec![PumpState::On, PumpState::Off]);
        assert_eq!(sim.get_pump_state().await.unwrap(), PumpState::Off);
    }

    #[tokio::test]
    async fn sim_command_failure_keeps_previous_state() {
        let sim = SimGateway::new();
        sim.fail_commands(true);
        assert!(sim.set_pump(PumpState::On).await.is_err());
        assert_eq!(sim.get_pump_state().await.unwrap(), PumpState::Off);
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn sim_read_failure() {
        let sim = SimGateway::new();
        sim.fail_reads(true);
        assert!(sim.read_soil_moisture().await.is_err());
        assert_eq!(sim.read_temperature_humidity().await.unwrap(), (None, None));
    }

    #[tokio::test]
    async fn drifting_sim_dries_then_wets() {
        let sim = SimGateway::drifting();
        sim.set_soil(Some(10.0));

        let dry = sim.read_soil_moisture().await.unwrap().unwrap();
        assert!(dry < 10.0);

        sim.set_pump(PumpState::On).await.unwrap();
        let wet = sim.read_soil_moisture().await.unwrap().unwrap();
        assert!(wet > dry);
    }

    #[tokio::test]
    async fn drifting_sim_clamps_to_range() {
        let sim = SimGateway::drifting();
        sim.set_soil(Some(0.2));
        assert_eq!(sim.read_soil_moisture().await.unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn gateway_actuator_forwards_to_relay() {
        let sim = Arc::new(SimGateway::new());
        let actuator = GatewayActuator::new(sim.clone());
        actuator.command(PumpState::On).await.unwrap();
        actuator.announce_mode(Mode::Auto).await.unwrap();
        assert_eq!(sim.commands(), vec![PumpState::On]);
    }
}
