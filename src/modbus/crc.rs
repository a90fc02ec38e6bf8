pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC in wire order (low byte first).
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16_modbus(data).to_le_bytes()
}

/// Checks a CRC-terminated buffer. Buffers shorter than the CRC itself never verify.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (payload, trailer) = frame.split_at(frame.len() - 2);
    crc16_bytes(payload) == [trailer[0], trailer[1]]
}
