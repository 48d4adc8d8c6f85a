//! Configuration for Millkit
//!
//! Supplied once at startup. Supports JSON and TOML files plus an environment
//! overlay, organized into sections:
//! - Connection (serial port, simulation fallback, RX buffer)
//! - Actuation (GPIO lines, I2C DAC, spindle RPM range)
//! - Timing (poll, broadcast and dispatch intervals, homing timeout)
//! - Simulation (simulated controller tuning)
//! - Logging

use millkit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial device path
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Use the simulated controller instead of the serial port
    pub simulation: bool,
    /// Fall back to the simulated controller when the port cannot be opened
    pub fallback_to_simulation: bool,
    /// Controller receive buffer size in bytes
    pub rx_buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            simulation: false,
            fallback_to_simulation: true,
            rx_buffer_size: 128,
        }
    }
}

/// Spindle and vacuum output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationSettings {
    /// Drive real outputs; when false all actuation is a no-op
    pub enabled: bool,
    /// GPIO line selecting clockwise rotation
    pub gpio_forward: u32,
    /// GPIO line selecting counter-clockwise rotation
    pub gpio_reverse: u32,
    /// GPIO line switching the vacuum
    pub gpio_vacuum: u32,
    /// I2C bus number of the DAC
    pub i2c_bus: u8,
    /// I2C address of the DAC
    pub dac_address: u16,
    /// DAC full-scale reference voltage
    pub dac_vref: f64,
    /// Lowest commanded spindle speed
    pub spindle_min_rpm: f64,
    /// Spindle speed at full-scale reference
    pub spindle_max_rpm: f64,
}

impl Default for ActuationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            gpio_forward: 17,
            gpio_reverse: 27,
            gpio_vacuum: 22,
            i2c_bus: 1,
            dac_address: 0x60,
            dac_vref: 5.0,
            spindle_min_rpm: 0.0,
            spindle_max_rpm: 24000.0,
        }
    }
}

/// Loop intervals and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Status query interval
    pub status_poll_ms: u64,
    /// Snapshot broadcast interval
    pub broadcast_ms: u64,
    /// Dispatch/receive loop tick
    pub dispatch_tick_ms: u64,
    /// Homing cycle timeout
    pub homing_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            status_poll_ms: 200,
            broadcast_ms: 200,
            dispatch_tick_ms: 10,
            homing_timeout_ms: 60_000,
        }
    }
}

/// Simulated controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Time compression factor
    pub speedup: f64,
    /// Rapid rate (mm/min)
    pub rapid_rate: f64,
    /// Minimum duration of any line
    pub min_line_ms: u64,
    /// Duration of a homing cycle
    pub homing_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            speedup: 1.0,
            rapid_rate: 3000.0,
            min_line_ms: 5,
            homing_ms: 1500,
        }
    }
}

/// Logging output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

/// Complete startup configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Actuation settings
    pub actuation: ActuationSettings,
    /// Timing settings
    pub timing: TimingSettings,
    /// Simulation settings
    pub simulation: SimulationSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Default config location: `<config dir>/millkit/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("millkit").join("config.toml"))
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("Invalid JSON config: {}", e)))?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("Invalid TOML config: {}", e)))?
        } else {
            return Err(Error::config("Config file must be .json or .toml"));
        };

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self)
                .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?
        } else {
            return Err(Error::config("Config file must be .json or .toml"));
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve configuration for startup
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used when present. The environment overlay is applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(default) => Self::load_from_file(&default)?,
                None => Self::default(),
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay process environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup
    ///
    /// Recognized keys: `SIMULATION`, `GRBL_PORT`, `GRBL_BAUD`,
    /// `GPIO_FORWARD`, `GPIO_REVERSE`, `GPIO_VACUUM`, `I2C_BUS`,
    /// `DAC_ADDRESS` (hex), `DAC_VREF`, `SPINDLE_MAX_RPM`, `SPINDLE_MIN_RPM`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{}: cannot parse '{}'", key, value)))
        }

        if let Some(v) = lookup("SIMULATION") {
            self.connection.simulation =
                matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("GRBL_PORT") {
            self.connection.port = v;
        }
        if let Some(v) = lookup("GRBL_BAUD") {
            self.connection.baud_rate = parsed("GRBL_BAUD", &v)?;
        }
        if let Some(v) = lookup("GPIO_FORWARD") {
            self.actuation.gpio_forward = parsed("GPIO_FORWARD", &v)?;
        }
        if let Some(v) = lookup("GPIO_REVERSE") {
            self.actuation.gpio_reverse = parsed("GPIO_REVERSE", &v)?;
        }
        if let Some(v) = lookup("GPIO_VACUUM") {
            self.actuation.gpio_vacuum = parsed("GPIO_VACUUM", &v)?;
        }
        if let Some(v) = lookup("I2C_BUS") {
            self.actuation.i2c_bus = parsed("I2C_BUS", &v)?;
        }
        if let Some(v) = lookup("DAC_ADDRESS") {
            let digits = v.trim().trim_start_matches("0x").trim_start_matches("0X");
            self.actuation.dac_address = u16::from_str_radix(digits, 16)
                .map_err(|_| Error::config(format!("DAC_ADDRESS: cannot parse '{}'", v)))?;
        }
        if let Some(v) = lookup("DAC_VREF") {
            self.actuation.dac_vref = parsed("DAC_VREF", &v)?;
        }
        if let Some(v) = lookup("SPINDLE_MAX_RPM") {
            self.actuation.spindle_max_rpm = parsed("SPINDLE_MAX_RPM", &v)?;
        }
        if let Some(v) = lookup("SPINDLE_MIN_RPM") {
            self.actuation.spindle_min_rpm = parsed("SPINDLE_MIN_RPM", &v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.baud_rate == 0 {
            return Err(Error::config("Baud rate must be > 0"));
        }

        // Smallest useful frame is one character plus the terminator.
        if self.connection.rx_buffer_size < 2 {
            return Err(Error::config("RX buffer size must be at least 2 bytes"));
        }

        if self.actuation.spindle_max_rpm <= self.actuation.spindle_min_rpm {
            return Err(Error::config("Spindle max RPM must exceed min RPM"));
        }

        if self.actuation.spindle_min_rpm < 0.0 {
            return Err(Error::config("Spindle min RPM must be >= 0"));
        }

        if self.actuation.dac_vref <= 0.0 {
            return Err(Error::config("DAC reference voltage must be > 0"));
        }

        let timing = &self.timing;
        if timing.status_poll_ms == 0
            || timing.broadcast_ms == 0
            || timing.dispatch_tick_ms == 0
            || timing.homing_timeout_ms == 0
        {
            return Err(Error::config("Timing intervals must be > 0"));
        }

        if self.simulation.speedup <= 0.0 || self.simulation.rapid_rate <= 0.0 {
            return Err(Error::config("Simulation speedup and rapid rate must be > 0"));
        }

        Ok(())
    }
}
