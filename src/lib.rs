//! Modbus RTU master for serial valve actuators
//!
//! Builds write-single-register and read-register frames, exchanges them over
//! a serial line one transaction at a time and decodes the replies. Actuator
//! models are described by static profiles that turn open/close/percent
//! commands into raw register values.
//!
//! The master is not internally thread-safe beyond rejecting overlapping
//! transactions; callers that share it must synchronize externally.

pub mod config;
pub mod modbus;
pub mod devices;
pub mod output;
pub mod utils;
pub mod cli;

// Re-export commonly used types
pub use config::Config;
pub use devices::{ActuatorModel, ActuatorProfile, ActuatorProfileRegistry};
pub use modbus::{ModbusFrame, ModbusMaster, SerialTransport, TransactionResult, TransactionState, Transport};
pub use output::{ResultFormatter, ConsoleFormatter, JsonFormatter, CsvFormatter, HexFormatter};
pub use utils::error::{ErrorKind, ModbusError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
