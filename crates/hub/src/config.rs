//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Sensors and relay are wired to this host.
    Direct,
    /// Readings and pump state arrive over MQTT; commands are published.
    Mqtt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: Transport,
    pub control: ControlConfig,
    pub sampler: SamplerConfig,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub gpio: GpioConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub interval_sec: u64,
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_sec: u64,
    pub queue_capacity: usize,
    pub topics: TopicConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub sensors: String,
    pub pump_state: String,
    pub pump_command: String,
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub relay_pin: u8,
    pub relay_active_low: bool,
    pub soil_channel: u8,
    pub sht31_address: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Direct,
            control: ControlConfig::default(),
            sampler: SamplerConfig::default(),
            mqtt: MqttConfig::default(),
            web: WebConfig::default(),
            gpio: GpioConfig::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            interval_sec: 5,
            low_threshold: 20.0,
            high_threshold: 60.0,
            command_timeout_ms: 2000,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { interval_sec: 2 }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "smartfarm-hub".to_string(),
            keep_alive_sec: 30,
            queue_capacity: 32,
            topics: TopicConfig::default(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            sensors: "farm/sensors".to_string(),
            pump_state: "farm/pump/state".to_string(),
            pump_command: "farm/pump/set".to_string(),
            mode: "farm/pump/mode".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            relay_pin: 27,
            relay_active_low: false,
            soil_channel: 0,
            sht31_address: 0x44,
        }
    }
}

impl ControlConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Highest MCP3008 input channel.
const MCP3008_MAX_CHANNEL: u8 = 7;

/// BCM GPIO pins on the 40-pin header usable for a relay. GPIO 0-1 are
/// reserved for the ID EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_control(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_gpio(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;

        if c.interval_sec == 0 {
            errors.push("control.interval_sec must be positive".to_string());
        }
        if c.command_timeout_ms == 0 {
            errors.push("control.command_timeout_ms must be positive".to_string());
        }
        if self.sampler.interval_sec == 0 {
            errors.push("sampler.interval_sec must be positive".to_string());
        }

        for (name, v) in [
            ("low_threshold", c.low_threshold),
            ("high_threshold", c.high_threshold),
        ] {
            if !(0.0..=100.0).contains(&v) {
                errors.push(format!("control.{name} {v} out of range [0, 100]"));
            }
        }
        if c.low_threshold >= c.high_threshold {
            errors.push(format!(
                "control.low_threshold ({}) must be below high_threshold ({})",
                c.low_threshold, c.high_threshold
            ));
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if m.queue_capacity == 0 {
            errors.push("mqtt.queue_capacity must be positive".to_string());
        }

        let t = &m.topics;
        let mut seen: HashSet<&str> = HashSet::new();
        for (name, topic) in [
            ("sensors", &t.sensors),
            ("pump_state", &t.pump_state),
            ("pump_command", &t.pump_command),
            ("mode", &t.mode),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("mqtt.topics.{name} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!(
                    "mqtt.topics.{name} '{topic}' must not contain wildcards"
                ));
            } else if !seen.insert(topic.as_str()) {
                errors.push(format!(
                    "mqtt.topics.{name} '{topic}' is already used by another topic"
                ));
            }
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let g = &self.gpio;

        if !VALID_GPIO_PINS.contains(&g.relay_pin) {
            errors.push(format!(
                "gpio.relay_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                g.relay_pin
            ));
        }
        if g.soil_channel > MCP3008_MAX_CHANNEL {
            errors.push(format!(
                "gpio.soil_channel {} out of MCP3008 range [0, {MCP3008_MAX_CHANNEL}]",
                g.soil_channel
            ));
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `WEB_PORT` and `TRANSPORT` from
    /// `lookup` on top of the file values.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT '{port}' is not a port number"))?;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        if let Some(transport) = lookup("TRANSPORT") {
            self.transport = match transport.to_ascii_lowercase().as_str() {
                "direct" => Transport::Direct,
                "mqtt" => Transport::Mqtt,
                other => bail!("TRANSPORT '{other}' must be 'direct' or 'mqtt'"),
            };
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. Validation is left to the caller so
/// environment overrides can be applied first.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Load `path` if it exists (defaults otherwise), apply the environment and
/// validate the result.
pub fn resolve(path: &str) -> Result<Config> {
    resolve_with(path, |key| env::var(key).ok())
}

fn resolve_with(path: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        load(path)?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_overrides(lookup)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.transport, Transport::Direct);
        assert_eq!(config.control.interval_sec, 5);
        assert_eq!(config.control.low_threshold, 20.0);
        assert_eq!(config.control.high_threshold, 60.0);
        assert_eq!(config.mqtt.topics, TopicConfig::default());
        assert_eq!(config.web.port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
transport = "mqtt"

[control]
interval_sec = 10
low_threshold = 25.0
high_threshold = 55.0
command_timeout_ms = 500

[sampler]
interval_sec = 3

[mqtt]
host = "broker.local"
port = 8883
client_id = "greenhouse"

[mqtt.topics]
sensors = "gh/sensors"
pump_state = "gh/pump/state"
pump_command = "gh/pump/set"
mode = "gh/pump/mode"

[web]
port = 9000

[gpio]
relay_pin = 17
relay_active_low = true
soil_channel = 2
sht31_address = 0x45
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transport, Transport::Mqtt);
        assert_eq!(config.control.interval(), Duration::from_secs(10));
        assert_eq!(config.control.command_timeout(), Duration::from_millis(500));
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.keep_alive_sec, 30);
        assert_eq!(config.mqtt.topics.sensors, "gh/sensors");
        assert_eq!(config.gpio.sht31_address, 0x45);
        config.validate().unwrap();
    }

    #[test]
    fn parse_unknown_transport_fails() {
        assert!(toml::from_str::<Config>(r#"transport = "carrier-pigeon""#).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = Config::default();
        cfg.control.interval_sec = 0;
        assert_validation_err(&cfg, "control.interval_sec must be positive");
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.control.command_timeout_ms = 0;
        assert_validation_err(&cfg, "command_timeout_ms must be positive");
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.control.high_threshold = 120.0;
        assert_validation_err(&cfg, "control.high_threshold 120 out of range");
    }

    #[test]
    fn inverted_band_rejected() {
        let mut cfg = Config::default();
        cfg.control.low_threshold = 60.0;
        cfg.control.high_threshold = 60.0;
        assert_validation_err(&cfg, "must be below high_threshold");
    }

    #[test]
    fn duplicate_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topics.pump_command = cfg.mqtt.topics.pump_state.clone();
        assert_validation_err(&cfg, "already used by another topic");
    }

    #[test]
    fn wildcard_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topics.sensors = "farm/+/sensors".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn relay_pin_whitelist() {
        let mut cfg = Config::default();
        cfg.gpio.relay_pin = 1;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
        cfg.gpio.relay_pin = 2;
        cfg.validate().unwrap();
    }

    #[test]
    fn soil_channel_range() {
        let mut cfg = Config::default();
        cfg.gpio.soil_channel = 8;
        assert_validation_err(&cfg, "out of MCP3008 range");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.control.interval_sec = 0;
        cfg.mqtt.host = " ".into();
        cfg.gpio.relay_pin = 40;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("interval_sec"));
        assert!(msg.contains("mqtt.host is empty"));
        assert!(msg.contains("relay_pin 40"));
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_overrides(overrides(&[
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "1884"),
            ("WEB_PORT", "8081"),
            ("TRANSPORT", "MQTT"),
        ]))
        .unwrap();
        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 1884);
        assert_eq!(cfg.web.port, 8081);
        assert_eq!(cfg.transport, Transport::Mqtt);
    }

    #[test]
    fn env_bad_port_rejected() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(overrides(&[("MQTT_PORT", "lots")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("MQTT_PORT 'lots'"));
    }

    #[test]
    fn env_bad_transport_rejected() {
        let mut cfg = Config::default();
        assert!(cfg
            .apply_overrides(overrides(&[("TRANSPORT", "serial")]))
            .is_err());
    }

    #[test]
    fn resolve_missing_file_falls_back_to_defaults() {
        let cfg = resolve_with("/nonexistent/smartfarm-config.toml", overrides(&[])).unwrap();
        assert_eq!(cfg.control.interval_sec, 5);
        assert_eq!(cfg.transport, Transport::Direct);
        assert_eq!(cfg.mqtt.port, 1883);
    }

    #[test]
    fn resolve_applies_overrides_then_validates() {
        let cfg = resolve_with(
            "/nonexistent/smartfarm-config.toml",
            overrides(&[("TRANSPORT", "mqtt"), ("WEB_PORT", "9090")]),
        )
        .unwrap();
        assert_eq!(cfg.transport, Transport::Mqtt);
        assert_eq!(cfg.web.port, 9090);

        let err = resolve_with(
            "/nonexistent/smartfarm-config.toml",
            overrides(&[("MQTT_PORT", "0x")]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("MQTT_PORT '0x'"));
    }
}
