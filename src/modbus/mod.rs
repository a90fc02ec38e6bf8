pub mod client;
pub mod crc;
pub mod protocol;
pub mod transport;

pub use client::{ModbusMaster, TransactionState};
pub use crc::crc16_modbus;
pub use protocol::{DecodedResponse, FrameCodec, ModbusFrame, RtuCodec, TransactionResult};
pub use transport::{SerialTransport, Transport};
