//! Modbus-RTU frame construction for the BLD510B brushless drives.
//!
//! Only function 0x06 (write single register) is used by the supervisor;
//! 0x03 (read holding registers) is kept for the bus scan tools. Register
//! addresses and value fields travel big-endian per Modbus; the CRC-16
//! goes out low byte first.

use crate::crc::crc16_modbus;

/// Drive command register.
pub const REG_COMMAND: u16 = 0x8000;
/// RPM setpoint register.
pub const REG_RPM: u16 = 0x8005;

/// Run forward.
pub const CMD_FORWARD: u16 = 0x0902;
/// Run reverse.
pub const CMD_REVERSE: u16 = 0x0B02;
/// Coast to a stop.
pub const CMD_STOP_NATURAL: u16 = 0x0802;
/// Brake to a stop.
pub const CMD_STOP_BRAKE: u16 = 0x0D02;

/// Highest RPM the drive accepts.
pub const RPM_LIMIT: u16 = 4000;

/// Largest frame either builder produces.
pub const FRAME_LEN: usize = 8;

/// A complete RTU frame.
pub type RtuFrame = heapless::Vec<u8, FRAME_LEN>;

/// Encode an RPM setpoint for register 0x8005.
///
/// The drive firmware reads the 16-bit register value little-endian even
/// though Modbus transmits it big-endian, so the bytes are swapped here:
/// low byte in the high position, high byte in the low position. The
/// setpoint is clamped to the drive's 0..=4000 range first.
pub fn encode_rpm(rpm: u16) -> u16 {
    let rpm = rpm.min(RPM_LIMIT);
    ((rpm & 0xFF) << 8) | (rpm >> 8)
}

fn finish(mut frame: RtuFrame) -> RtuFrame {
    let crc = crc16_modbus(&frame);
    // Capacity is sized for the largest frame; these cannot overflow.
    let _ = frame.push((crc & 0xFF) as u8);
    let _ = frame.push((crc >> 8) as u8);
    frame
}

/// Build a function 0x06 (write single register) frame.
pub fn write_single(slave: u8, register: u16, value: u16) -> RtuFrame {
    let mut frame = RtuFrame::new();
    let _ = frame.extend_from_slice(&[slave, 0x06]);
    let _ = frame.extend_from_slice(&register.to_be_bytes());
    let _ = frame.extend_from_slice(&value.to_be_bytes());
    finish(frame)
}

/// Build a function 0x03 (read holding registers) frame.
pub fn read_holding(slave: u8, register: u16, count: u16) -> RtuFrame {
    let mut frame = RtuFrame::new();
    let _ = frame.extend_from_slice(&[slave, 0x03]);
    let _ = frame.extend_from_slice(&register.to_be_bytes());
    let _ = frame.extend_from_slice(&count.to_be_bytes());
    finish(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_encoding_swaps_bytes() {
        // 700 = 0x02BC → register value 0xBC02.
        assert_eq!(encode_rpm(700), 0xBC02);
        // 400 = 0x0190 → 0x9001.
        assert_eq!(encode_rpm(400), 0x9001);
        assert_eq!(encode_rpm(0), 0x0000);
    }

    #[test]
    fn rpm_clamps_to_drive_limit() {
        // 4000 = 0x0FA0 → 0xA00F.
        assert_eq!(encode_rpm(4000), 0xA00F);
        assert_eq!(encode_rpm(4001), encode_rpm(4000));
        assert_eq!(encode_rpm(u16::MAX), encode_rpm(4000));
    }

    #[test]
    fn write_single_layout() {
        let frame = write_single(0x01, REG_RPM, 0xBC02);
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..6], &[0x01, 0x06, 0x80, 0x05, 0xBC, 0x02]);
        // CRC over the whole frame including its own CRC bytes is zero.
        assert_eq!(crc16_modbus(&frame), 0);
    }

    #[test]
    fn read_holding_layout() {
        let frame = read_holding(0x02, 0x8018, 1);
        assert_eq!(&frame[..6], &[0x02, 0x03, 0x80, 0x18, 0x00, 0x01]);
        assert_eq!(crc16_modbus(&frame), 0);
    }

    #[test]
    fn command_words() {
        assert_eq!(CMD_FORWARD, 0x0902);
        assert_eq!(CMD_REVERSE, 0x0B02);
        assert_eq!(CMD_STOP_NATURAL, 0x0802);
        assert_eq!(CMD_STOP_BRAKE, 0x0D02);
    }
}
