use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::modbus::protocol::is_read_function;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    // Modbus unit addressed by the actuator commands
    pub device_id: u8,

    pub serial: SerialConfig,

    // Continuous read settings used by the `poll` command
    pub poll: PollConfig,
}

/// Serial line settings, fixed for the lifetime of a master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: ParityConfig,
    pub stop_bits: u8,
    pub timeout_ms: u64,
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: 1,
            serial: SerialConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        let port = if cfg!(target_os = "windows") {
            "COM5"
        } else if cfg!(target_os = "macos") {
            "/dev/tty.usbserial-0001"
        } else {
            "/dev/ttyUSB0"
        };

        Self {
            port: port.to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: ParityConfig::Even,
            stop_bits: 1,
            timeout_ms: 1000,
            settle_delay_ms: 100,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            function: 0x03,
            address: 2,
            quantity: 1,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl std::str::FromStr for ParityConfig {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(ParityConfig::None),
            "e" | "even" => Ok(ParityConfig::Even),
            "o" | "odd" => Ok(ParityConfig::Odd),
            other => Err(ModbusError::ConfigError(format!("Unknown parity: {}", other))),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("📋 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ModbusError::ConfigError(format!("Cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            ModbusError::ConfigError(format!("Cannot write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    /// Overrides file settings with whatever was given on the command line.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ModbusError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial.port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.serial.baud_rate = parse_arg("baud", baud)?;
        }
        if let Some(parity) = matches.get_one::<String>("parity") {
            self.serial.parity = parity.parse()?;
        }
        if let Some(device) = matches.get_one::<String>("device") {
            self.device_id = parse_arg("device", device)?;
        }
        if let Some(timeout) = matches.get_one::<String>("timeout") {
            self.serial.timeout_ms = parse_arg("timeout", timeout)?;
        }
        if let Some(settle) = matches.get_one::<String>("settle") {
            self.serial.settle_delay_ms = parse_arg("settle", settle)?;
        }

        debug!("⚙️  Effective configuration: {:?}", self);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.serial.port.trim().is_empty() {
            return Err(ModbusError::ConfigError("Serial port must not be empty".to_string()));
        }
        if self.serial.baud_rate == 0 {
            return Err(ModbusError::ConfigError("Baud rate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ModbusError::ConfigError(format!(
                "Data bits must be 5-8, got {}",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ModbusError::ConfigError(format!(
                "Stop bits must be 1 or 2, got {}",
                self.serial.stop_bits
            )));
        }
        if !is_read_function(self.poll.function) {
            return Err(ModbusError::ConfigError(format!(
                "Poll function must be 3 or 4, got {}",
                self.poll.function
            )));
        }
        if self.poll.interval_ms == 0 {
            return Err(ModbusError::ConfigError("Poll interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_arg<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ModbusError> {
    value
        .parse()
        .map_err(|_| ModbusError::ConfigError(format!("Invalid value for --{}: {}", name, value)))
}
