use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Mutex, PoisonError, TryLockError};

use super::protocol::{
    DecodedResponse, FrameCodec, ModbusFrame, RtuCodec, TransactionResult,
    READ_HOLDING_REGISTERS, READ_INPUT_REGISTERS, WRITE_SINGLE_REGISTER,
};
use super::transport::{SerialTransport, Transport};
use crate::config::Config;
use crate::devices::actuator::{ActuatorProfile, ActuatorProfileRegistry};
use crate::utils::error::ModbusError;

/// Phase of the transaction currently owned by a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    Idle,
    Encoding,
    Transacting,
    Decoding,
    Completed,
    Failed,
}

/// Modbus RTU master driving one actuator bus.
///
/// Exactly one transaction runs at a time. A call that arrives while
/// another is in flight fails with [`ModbusError::TransactionInProgress`]
/// instead of queueing; callers sharing a master across threads are
/// responsible for their own scheduling.
pub struct ModbusMaster<T: Transport = SerialTransport> {
    transport: Mutex<T>,
    codec: RtuCodec,
    device_id: u8,
    port: String,
    state: Mutex<TransactionState>,
    last_transaction: Mutex<Option<TransactionResult>>,
}

impl ModbusMaster<SerialTransport> {
    pub fn from_config(config: &Config) -> Result<Self, ModbusError> {
        let transport = SerialTransport::new(config.serial.clone())?;
        Ok(Self::new(transport, config.device_id))
    }
}

impl<T: Transport> ModbusMaster<T> {
    pub fn new(transport: T, device_id: u8) -> Self {
        let port = transport.port_name().to_string();
        info!("🔌 Modbus master on {} (device {})", port, device_id);
        Self {
            transport: Mutex::new(transport),
            codec: RtuCodec,
            device_id,
            port,
            state: Mutex::new(TransactionState::Idle),
            last_transaction: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Result of the most recent transaction, including failed ones.
    pub fn last_transaction(&self) -> Option<TransactionResult> {
        self.last_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn open_valve(&self, actuator_name: &str) -> Result<TransactionResult, ModbusError> {
        let profile = ActuatorProfileRegistry::resolve(actuator_name)?;
        info!("🟢 Opening {} valve", profile.name);
        self.write_profile_value(profile, profile.open_raw_value)
    }

    pub fn close_valve(&self, actuator_name: &str) -> Result<TransactionResult, ModbusError> {
        let profile = ActuatorProfileRegistry::resolve(actuator_name)?;
        info!("🔴 Closing {} valve", profile.name);
        self.write_profile_value(profile, profile.close_raw_value)
    }

    pub fn set_position(&self, actuator_name: &str, percent: i64) -> Result<TransactionResult, ModbusError> {
        let profile = ActuatorProfileRegistry::resolve(actuator_name)?;
        let raw = profile.percent_to_raw(percent)?;
        info!("🎚️  Setting {} valve to {}% (raw {})", profile.name, percent, raw);
        self.write_profile_value(profile, raw)
    }

    /// Sends a frame built directly from caller input, bypassing the
    /// actuator profiles.
    pub fn send_custom_request(
        &self,
        device_id: i64,
        function: i64,
        address: i64,
        value: i64,
    ) -> Result<TransactionResult, ModbusError> {
        let frame = ModbusFrame::checked(device_id, function, address, value)?;
        self.execute(frame)
    }

    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<TransactionResult, ModbusError> {
        self.execute(ModbusFrame::new(self.device_id, READ_HOLDING_REGISTERS, address, quantity))
    }

    pub fn read_input_registers(&self, address: u16, quantity: u16) -> Result<TransactionResult, ModbusError> {
        self.execute(ModbusFrame::new(self.device_id, READ_INPUT_REGISTERS, address, quantity))
    }

    fn write_profile_value(&self, profile: &ActuatorProfile, value: u16) -> Result<TransactionResult, ModbusError> {
        let frame = ModbusFrame::new(self.device_id, WRITE_SINGLE_REGISTER, profile.register_address, value);
        self.execute(frame)
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn execute(&self, frame: ModbusFrame) -> Result<TransactionResult, ModbusError> {
        let mut transport = match self.transport.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                warn!("⏳ Transaction rejected: another one is in progress on {}", self.port);
                return Err(ModbusError::TransactionInProgress);
            }
            Err(TryLockError::Poisoned(_)) => return Err(ModbusError::LockError),
        };

        self.set_state(TransactionState::Encoding);
        let request = self.codec.encode(&frame);
        let mut result = TransactionResult::new(request.clone());
        info!(
            "📤 Request to device {} fn 0x{:02X}: {}",
            frame.device_id(),
            frame.function(),
            result.request_hex()
        );

        self.set_state(TransactionState::Transacting);
        let outcome = transport.transact(&request).and_then(|response| {
            result.response_bytes = Some(response.clone());
            if response.len() >= 2 {
                result.response_device_id = Some(response[0]);
                result.response_function = Some(response[1]);
            }
            self.set_state(TransactionState::Decoding);
            self.decode_response(&frame, &response)
        });
        result.completed_at = Utc::now();

        let returned = match outcome {
            Ok(decoded) => {
                result.decoded_registers = decoded.registers;
                self.set_state(TransactionState::Completed);
                info!(
                    "📥 Response from device {}: {}",
                    decoded.device_id,
                    result.response_hex().unwrap_or_default()
                );
                Ok(result.clone())
            }
            Err(err) => {
                result.error = Some(err.kind());
                self.set_state(TransactionState::Failed);
                warn!("❌ Transaction on {} failed: {}", self.port, err);
                Err(err)
            }
        };

        *self
            .last_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.set_state(TransactionState::Idle);
        drop(transport);

        returned
    }

    fn decode_response(&self, request: &ModbusFrame, response: &[u8]) -> Result<DecodedResponse, ModbusError> {
        if response.is_empty() {
            warn!("⏰ No response from device {}", request.device_id());
        }

        let decoded = match self.codec.decode(response) {
            Ok(decoded) => decoded,
            // CRC already checked by the codec, so the header can be trusted
            Err(err @ ModbusError::ExceptionResponse { function, .. }) => {
                check_echo(request, response[0], function)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        debug!("🔍 Decoded response: {:?}", decoded);

        check_echo(request, decoded.device_id, decoded.function)?;
        Ok(decoded)
    }
}

fn check_echo(request: &ModbusFrame, device_id: u8, function: u8) -> Result<(), ModbusError> {
    if device_id != request.device_id() {
        return Err(ModbusError::UnexpectedResponse(format!(
            "device {} answered a request for device {}",
            device_id,
            request.device_id()
        )));
    }
    if function != request.function() {
        return Err(ModbusError::UnexpectedResponse(format!(
            "function 0x{:02X} in reply to 0x{:02X}",
            function,
            request.function()
        )));
    }
    Ok(())
}
