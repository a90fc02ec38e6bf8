use log::{debug, error, info};
use serialport::{SerialPort, SerialPortInfo};
use std::io::{Read, Write};
use std::thread;

use crate::config::settings::{ParityConfig, SerialConfig};
use crate::utils::error::ModbusError;

/// A byte channel able to run one request/response exchange.
///
/// Implementations are not expected to be shared between threads; the
/// master serializes access.
pub trait Transport: Send {
    /// Writes `frame` and returns whatever bytes arrived in the response
    /// window. An empty vector means the device did not answer.
    fn transact(&mut self, frame: &[u8]) -> Result<Vec<u8>, ModbusError>;

    fn port_name(&self) -> &str;
}

/// Serial line transport. The port is opened for each exchange and closed
/// when the exchange ends, whatever the outcome.
pub struct SerialTransport {
    config: SerialConfig,
    data_bits: serialport::DataBits,
    stop_bits: serialport::StopBits,
    parity: serialport::Parity,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Result<Self, ModbusError> {
        let data_bits = match config.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(ModbusError::ConfigError(format!("Unsupported data bits: {}", other))),
        };
        let stop_bits = match config.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => return Err(ModbusError::ConfigError(format!("Unsupported stop bits: {}", other))),
        };
        let parity = match config.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        Ok(Self {
            config,
            data_bits,
            stop_bits,
            parity,
        })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn open(&self) -> Result<Box<dyn SerialPort>, ModbusError> {
        debug!(
            "🔌 Opening {} ({} baud, {:?}, {:?}, {:?})",
            self.config.port, self.config.baud_rate, self.data_bits, self.parity, self.stop_bits
        );

        serialport::new(&self.config.port, self.config.baud_rate)
            .timeout(self.config.timeout())
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .open()
            .map_err(|source| {
                error!("❌ Failed to open serial port {}: {}", self.config.port, source);
                ModbusError::PortUnavailable {
                    port: self.config.port.clone(),
                    source,
                }
            })
    }
}

impl Transport for SerialTransport {
    fn transact(&mut self, frame: &[u8]) -> Result<Vec<u8>, ModbusError> {
        let mut port = self.open()?;

        debug!("📤 TX {}: {}", self.config.port, hex::encode_upper(frame));
        port.write_all(frame)
            .map_err(|source| ModbusError::WriteFailed { source })?;
        port.flush().map_err(|source| ModbusError::Io {
            context: "flushing request",
            source,
        })?;

        // Modbus settle time before sampling the input buffer
        thread::sleep(self.config.settle_delay());

        let available = port.bytes_to_read().map_err(|e| ModbusError::Io {
            context: "polling input buffer",
            source: e.into(),
        })? as usize;

        let mut response = vec![0u8; available];
        if available > 0 {
            port.read_exact(&mut response).map_err(|source| ModbusError::Io {
                context: "reading response",
                source,
            })?;
        }

        debug!("📥 RX {}: {} ({} bytes)", self.config.port, hex::encode_upper(&response), available);
        Ok(response)
    }

    fn port_name(&self) -> &str {
        &self.config.port
    }
}

pub fn list_ports() -> Result<Vec<SerialPortInfo>, ModbusError> {
    let ports = serialport::available_ports().map_err(|e| ModbusError::Io {
        context: "enumerating serial ports",
        source: e.into(),
    })?;
    info!("📡 Found {} serial port(s)", ports.len());
    Ok(ports)
}
