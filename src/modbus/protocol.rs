use chrono::{DateTime, Utc};
use serde::Serialize;

use super::crc::{crc16_bytes, crc16_modbus};
use crate::utils::error::{ErrorKind, ModbusError};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

pub const EXCEPTION_FLAG: u8 = 0x80;

/// Request frames and write-register echoes are always 8 bytes.
pub const REQUEST_FRAME_LEN: usize = 8;
const EXCEPTION_FRAME_LEN: usize = 5;
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

pub fn is_read_function(function: u8) -> bool {
    function == READ_HOLDING_REGISTERS || function == READ_INPUT_REGISTERS
}

/// One RTU request: `[id][fn][addr_hi][addr_lo][val_hi][val_lo][crc_lo][crc_hi]`.
///
/// The CRC is computed at construction, so a `ModbusFrame` is always well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusFrame {
    device_id: u8,
    function: u8,
    address: u16,
    value: u16,
    crc: u16,
}

impl ModbusFrame {
    pub fn new(device_id: u8, function: u8, address: u16, value: u16) -> Self {
        let mut frame = Self {
            device_id,
            function,
            address,
            value,
            crc: 0,
        };
        frame.crc = crc16_modbus(&frame.payload());
        frame
    }

    /// Builds a frame from unvalidated caller input, rejecting fields that
    /// would not fit on the wire instead of truncating them.
    pub fn checked(device_id: i64, function: i64, address: i64, value: i64) -> Result<Self, ModbusError> {
        Ok(Self::new(
            narrow::<u8>("device_id", device_id, 8)?,
            narrow::<u8>("function", function, 8)?,
            narrow::<u16>("address", address, 16)?,
            narrow::<u16>("value", value, 16)?,
        ))
    }

    /// Parses the 8 wire bytes of a request frame, validating length and CRC.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModbusError> {
        if bytes.len() < REQUEST_FRAME_LEN {
            return Err(ModbusError::TruncatedPayload {
                expected: REQUEST_FRAME_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > REQUEST_FRAME_LEN {
            return Err(ModbusError::UnexpectedLength {
                expected: REQUEST_FRAME_LEN,
                actual: bytes.len(),
            });
        }
        check_crc(bytes)?;

        Ok(Self::new(
            bytes[0],
            bytes[1],
            u16::from_be_bytes([bytes[2], bytes[3]]),
            u16::from_be_bytes([bytes[4], bytes[5]]),
        ))
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    fn payload(&self) -> [u8; 6] {
        let [addr_hi, addr_lo] = self.address.to_be_bytes();
        let [val_hi, val_lo] = self.value.to_be_bytes();
        [self.device_id, self.function, addr_hi, addr_lo, val_hi, val_lo]
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_FRAME_LEN] {
        let payload = self.payload();
        let [crc_lo, crc_hi] = self.crc.to_le_bytes();
        [
            payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], crc_lo, crc_hi,
        ]
    }
}

fn narrow<T: TryFrom<i64>>(field: &'static str, value: i64, bits: u8) -> Result<T, ModbusError> {
    T::try_from(value).map_err(|_| ModbusError::EncodingError { field, value, bits })
}

/// A response frame that passed length and CRC validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub device_id: u8,
    pub function: u8,
    /// Big-endian registers of a read response, in wire order. Empty otherwise.
    pub registers: Vec<u16>,
    /// Address and value echoed by a write-single-register response.
    pub echo: Option<(u16, u16)>,
}

fn check_crc(frame: &[u8]) -> Result<(), ModbusError> {
    let data_len = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = crc16_modbus(&frame[..data_len]);
    if received != calculated {
        return Err(ModbusError::ChecksumMismatch { received, calculated });
    }
    Ok(())
}

fn require_len(bytes: &[u8], expected: usize) -> Result<(), ModbusError> {
    if bytes.len() < expected {
        return Err(ModbusError::TruncatedPayload {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Frame encoding and response validation for one framing flavour.
pub trait FrameCodec {
    fn calculate_crc(&self, data: &[u8]) -> u16 {
        crc16_modbus(data)
    }

    fn encode(&self, frame: &ModbusFrame) -> Vec<u8>;

    fn decode(&self, bytes: &[u8]) -> Result<DecodedResponse, ModbusError>;
}

/// Modbus RTU framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtuCodec;

impl FrameCodec for RtuCodec {
    fn encode(&self, frame: &ModbusFrame) -> Vec<u8> {
        frame.to_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedResponse, ModbusError> {
        if bytes.len() < HEADER_LEN {
            return Err(ModbusError::FrameTooShort(bytes.len()));
        }

        let device_id = bytes[0];
        let function = bytes[1];
        let mut response = DecodedResponse {
            device_id,
            function,
            registers: Vec::new(),
            echo: None,
        };

        if function & EXCEPTION_FLAG != 0 {
            require_len(bytes, EXCEPTION_FRAME_LEN)?;
            check_crc(bytes)?;
            return Err(ModbusError::ExceptionResponse {
                function: function & !EXCEPTION_FLAG,
                code: bytes[2],
            });
        }

        match function {
            READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
                let byte_count = bytes[2] as usize;
                require_len(bytes, HEADER_LEN + byte_count + CRC_LEN)?;
                check_crc(bytes)?;

                // An odd byte count is malformed; the dangling byte is dropped.
                response.registers = bytes[HEADER_LEN..HEADER_LEN + byte_count]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
            }
            WRITE_SINGLE_REGISTER => {
                check_crc(bytes)?;
                require_len(bytes, REQUEST_FRAME_LEN)?;
                if bytes.len() > REQUEST_FRAME_LEN {
                    return Err(ModbusError::UnexpectedLength {
                        expected: REQUEST_FRAME_LEN,
                        actual: bytes.len(),
                    });
                }
                response.echo = Some((
                    u16::from_be_bytes([bytes[2], bytes[3]]),
                    u16::from_be_bytes([bytes[4], bytes[5]]),
                ));
            }
            _ => check_crc(bytes)?,
        }

        Ok(response)
    }
}

/// Encodes a request from untyped input. See [`ModbusFrame::checked`].
pub fn encode_request(device_id: i64, function: i64, address: i64, value: i64) -> Result<[u8; REQUEST_FRAME_LEN], ModbusError> {
    Ok(ModbusFrame::checked(device_id, function, address, value)?.to_bytes())
}

/// Appends the wire CRC to a payload. Used to build response frames in tests and tools.
pub fn with_crc(payload: &[u8]) -> Vec<u8> {
    let mut frame = payload.to_vec();
    frame.extend_from_slice(&crc16_bytes(payload));
    frame
}

/// Outcome of one master transaction, kept even when it failed.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionResult {
    pub request_frame: Vec<u8>,
    /// `None` when the exchange never reached the read phase.
    pub response_bytes: Option<Vec<u8>>,
    pub decoded_registers: Vec<u16>,
    pub response_device_id: Option<u8>,
    pub response_function: Option<u8>,
    pub error: Option<ErrorKind>,
    pub completed_at: DateTime<Utc>,
}

impl TransactionResult {
    pub(crate) fn new(request_frame: Vec<u8>) -> Self {
        Self {
            request_frame,
            response_bytes: None,
            decoded_registers: Vec::new(),
            response_device_id: None,
            response_function: None,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// True when the device stayed silent for the whole response window.
    pub fn no_response(&self) -> bool {
        matches!(&self.response_bytes, Some(bytes) if bytes.is_empty())
    }

    pub fn request_hex(&self) -> String {
        hex::encode_upper(&self.request_frame)
    }

    pub fn response_hex(&self) -> Option<String> {
        self.response_bytes.as_ref().map(hex::encode_upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_write_single_register() {
        let frame = ModbusFrame::new(0x01, WRITE_SINGLE_REGISTER, 0x0001, 0x0001);
        assert_eq!(frame.to_bytes(), [0x01, 0x06, 0x00, 0x01, 0x00, 0x01, 0x19, 0xCA]);
        assert_eq!(frame.crc(), 0xCA19);
        assert_eq!(RtuCodec.encode(&frame), frame.to_bytes().to_vec());
    }

    #[test]
    fn test_encode_splits_high_and_low_bytes() {
        let bytes = ModbusFrame::new(0x11, WRITE_SINGLE_REGISTER, 0x0BB7, 0x07CF).to_bytes();
        assert_eq!(&bytes[..6], &[0x11, 0x06, 0x0B, 0xB7, 0x07, 0xCF]);
    }

    #[test]
    fn test_checked_rejects_out_of_range_fields() {
        let err = ModbusFrame::checked(256, 6, 1, 1).unwrap_err();
        assert!(matches!(err, ModbusError::EncodingError { field: "device_id", value: 256, bits: 8 }));

        let err = ModbusFrame::checked(1, -1, 1, 1).unwrap_err();
        assert!(matches!(err, ModbusError::EncodingError { field: "function", .. }));

        let err = ModbusFrame::checked(1, 6, 65536, 1).unwrap_err();
        assert!(matches!(err, ModbusError::EncodingError { field: "address", .. }));

        let err = encode_request(1, 6, 1, 70000).unwrap_err();
        assert!(matches!(err, ModbusError::EncodingError { field: "value", value: 70000, bits: 16 }));
    }

    #[test]
    fn test_checked_accepts_boundaries() {
        let frame = ModbusFrame::checked(255, 255, 65535, 0).unwrap();
        assert_eq!(frame, ModbusFrame::new(255, 255, 0xFFFF, 0));
    }

    #[test]
    fn test_frame_round_trip() {
        fn assert_round_trip(d: u8, f: u8, a: u16, v: u16) {
            let bytes = ModbusFrame::new(d, f, a, v).to_bytes();
            let parsed = ModbusFrame::from_bytes(&bytes).unwrap();
            assert_eq!(
                (parsed.device_id(), parsed.function(), parsed.address(), parsed.value()),
                (d, f, a, v)
            );
            assert_eq!(parsed.to_bytes(), bytes);
        }

        // Every device id and function, with address and value varying alongside
        for d in 0..=u8::MAX {
            for f in 0..=u8::MAX {
                let a = u16::from_be_bytes([d, f]);
                assert_round_trip(d, f, a, !a);
            }
        }

        // Address and value sweeps, boundaries included
        for a in (0..=u16::MAX).step_by(97).chain([u16::MAX]) {
            for v in (0..=u16::MAX).step_by(251).chain([u16::MAX]) {
                assert_round_trip(1, WRITE_SINGLE_REGISTER, a, v);
            }
        }
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let frames = [
            ModbusFrame::new(1, WRITE_SINGLE_REGISTER, 0x0001, 0x00FF),
            ModbusFrame::new(2, READ_HOLDING_REGISTERS, 0x0002, 0x0001),
            ModbusFrame::new(0xF7, WRITE_SINGLE_REGISTER, 0x000B, 0x0068),
        ];
        for frame in frames {
            let bytes = frame.to_bytes();
            for bit in 0..bytes.len() * 8 {
                let mut corrupted = bytes;
                corrupted[bit / 8] ^= 1 << (bit % 8);
                let err = ModbusFrame::from_bytes(&corrupted).unwrap_err();
                assert!(
                    matches!(err, ModbusError::ChecksumMismatch { .. }),
                    "bit {} not detected",
                    bit
                );
            }
        }
    }

    #[test]
    fn test_from_bytes_length_checks() {
        assert!(matches!(
            ModbusFrame::from_bytes(&[0x01, 0x06]),
            Err(ModbusError::TruncatedPayload { expected: 8, actual: 2 })
        ));
        assert!(matches!(
            ModbusFrame::from_bytes(&[0u8; 9]),
            Err(ModbusError::UnexpectedLength { expected: 8, actual: 9 })
        ));
    }

    #[test]
    fn test_decode_read_response() {
        let response = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);
        assert_eq!(&response[7..], &[0xDA, 0x3E]);

        let decoded = RtuCodec.decode(&response).unwrap();
        assert_eq!(decoded.device_id, 1);
        assert_eq!(decoded.function, READ_HOLDING_REGISTERS);
        assert_eq!(decoded.registers, vec![10, 20]);
        assert_eq!(decoded.echo, None);
    }

    #[test]
    fn test_decode_input_registers() {
        let response = with_crc(&[0x05, 0x04, 0x02, 0xFF, 0xFE]);
        assert_eq!(RtuCodec.decode(&response).unwrap().registers, vec![0xFFFE]);
    }

    #[test]
    fn test_decode_odd_byte_count_drops_trailing_byte() {
        let response = with_crc(&[0x01, 0x03, 0x03, 0x00, 0x0A, 0x07]);
        assert_eq!(RtuCodec.decode(&response).unwrap().registers, vec![10]);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(RtuCodec.decode(&[]), Err(ModbusError::FrameTooShort(0))));
        assert!(matches!(RtuCodec.decode(&[0x01, 0x03]), Err(ModbusError::FrameTooShort(2))));
    }

    #[test]
    fn test_decode_truncated_read_payload() {
        // Byte count says 4, only 2 payload bytes and CRC present
        let response = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A]);
        assert!(matches!(
            RtuCodec.decode(&response),
            Err(ModbusError::TruncatedPayload { expected: 9, actual: 7 })
        ));
    }

    #[test]
    fn test_decode_bad_crc() {
        let mut response = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);
        response[4] ^= 0x01;
        assert!(matches!(RtuCodec.decode(&response), Err(ModbusError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_decode_write_echo() {
        let request = ModbusFrame::new(1, WRITE_SINGLE_REGISTER, 0x000B, 0x0068).to_bytes();
        let decoded = RtuCodec.decode(&request).unwrap();
        assert_eq!(decoded.function, WRITE_SINGLE_REGISTER);
        assert_eq!(decoded.echo, Some((0x000B, 0x0068)));
        assert!(decoded.registers.is_empty());
    }

    #[test]
    fn test_decode_write_echo_wrong_length() {
        let short = with_crc(&[0x01, 0x06, 0x00, 0x0B]);
        assert!(matches!(
            RtuCodec.decode(&short),
            Err(ModbusError::TruncatedPayload { expected: 8, actual: 6 })
        ));

        let long = with_crc(&[0x01, 0x06, 0x00, 0x0B, 0x00, 0x68, 0x00]);
        assert!(matches!(
            RtuCodec.decode(&long),
            Err(ModbusError::UnexpectedLength { expected: 8, actual: 9 })
        ));
    }

    #[test]
    fn test_decode_exception_response() {
        let response = with_crc(&[0x01, 0x86, 0x02]);
        assert!(matches!(
            RtuCodec.decode(&response),
            Err(ModbusError::ExceptionResponse { function: 0x06, code: 0x02 })
        ));
    }

    #[test]
    fn test_transaction_result_hex() {
        let mut result = TransactionResult::new(vec![0x01, 0x06]);
        assert_eq!(result.request_hex(), "0106");
        assert_eq!(result.response_hex(), None);
        assert!(!result.no_response());

        result.response_bytes = Some(Vec::new());
        assert!(result.no_response());
        assert_eq!(result.response_hex(), Some(String::new()));
    }
}
