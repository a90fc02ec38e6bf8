use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Encoding error: {field} = {value} does not fit in {bits} bits")]
    EncodingError {
        field: &'static str,
        value: i64,
        bits: u8,
    },

    #[error("Serial port {port} unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Write failed: {source}")]
    WriteFailed {
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("CRC checksum mismatch: received 0x{received:04X}, calculated 0x{calculated:04X}")]
    ChecksumMismatch { received: u16, calculated: u16 },

    #[error("Frame too short: {0} bytes received")]
    FrameTooShort(usize),

    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    #[error("Unexpected frame length: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    #[error("Device returned exception 0x{code:02X} for function 0x{function:02X}")]
    ExceptionResponse { function: u8, code: u8 },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unknown actuator: {0}")]
    UnknownActuator(String),

    #[error("Invalid percent: {0} (must be 0-100)")]
    InvalidPercent(i64),

    #[error("Another transaction is in progress")]
    TransactionInProgress,

    #[error("Lock acquisition failed")]
    LockError,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Flat, copyable tag of a [`ModbusError`], stored in transaction results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    EncodingError,
    PortUnavailable,
    WriteFailed,
    Io,
    ChecksumMismatch,
    FrameTooShort,
    TruncatedPayload,
    UnexpectedLength,
    ExceptionResponse,
    UnexpectedResponse,
    UnknownActuator,
    InvalidPercent,
    TransactionInProgress,
    LockError,
    ConfigError,
}

impl ModbusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModbusError::EncodingError { .. } => ErrorKind::EncodingError,
            ModbusError::PortUnavailable { .. } => ErrorKind::PortUnavailable,
            ModbusError::WriteFailed { .. } => ErrorKind::WriteFailed,
            ModbusError::Io { .. } => ErrorKind::Io,
            ModbusError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            ModbusError::FrameTooShort(_) => ErrorKind::FrameTooShort,
            ModbusError::TruncatedPayload { .. } => ErrorKind::TruncatedPayload,
            ModbusError::UnexpectedLength { .. } => ErrorKind::UnexpectedLength,
            ModbusError::ExceptionResponse { .. } => ErrorKind::ExceptionResponse,
            ModbusError::UnexpectedResponse(_) => ErrorKind::UnexpectedResponse,
            ModbusError::UnknownActuator(_) => ErrorKind::UnknownActuator,
            ModbusError::InvalidPercent(_) => ErrorKind::InvalidPercent,
            ModbusError::TransactionInProgress => ErrorKind::TransactionInProgress,
            ModbusError::LockError => ErrorKind::LockError,
            ModbusError::ConfigError(_) => ErrorKind::ConfigError,
        }
    }

    /// True for faults raised by the serial channel rather than by frame contents.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PortUnavailable | ErrorKind::WriteFailed | ErrorKind::Io
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::ConfigError(format!("TOML serialize error: {}", err))
    }
}
