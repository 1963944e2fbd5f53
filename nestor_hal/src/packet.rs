//! Sensor frame build and parse.
//!
//! Frame layout: `PREAMBLE(0xAA) | TYPE | LEN | PAYLOAD(LEN <= 64) | CRC8`,
//! CRC-8 over everything before it. All payload integers are
//! little-endian.
//!
//! Older device firmware omits the trailing `cache_age_ms: u32` from data
//! responses; both the legacy and current payload lengths parse, and the
//! optional field is absent on legacy frames. Any other length is a
//! framing error.

use nestor_common::error::{Error, Result, device_code_text};
use nestor_common::types::{
    BundleReading, DeltaReading, DistanceReading, ImuReading, PowerReading, SnapshotReading,
    WinchId,
};
use static_assertions::const_assert_eq;

/// Frame start byte.
pub const PREAMBLE: u8 = 0xAA;
/// Maximum payload bytes per frame.
pub const MAX_PAYLOAD: usize = 64;
/// Header (preamble, type, length) size.
pub const HEADER_LEN: usize = 3;
/// Largest possible frame: header + payload + CRC.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD + 1;

/// Message type bytes.
pub mod msg {
    pub const PING: u8 = 0x01;
    pub const SNAPSHOT: u8 = 0x04;
    pub const DELTA: u8 = 0x05;
    pub const DISTANCE: u8 = 0x07;
    pub const POWER: u8 = 0x08;
    pub const BUNDLE: u8 = 0x09;
    pub const IMU: u8 = 0x0A;
    pub const ERROR: u8 = 0xE0;
}

/// Size of the trailing cache-age field on current firmware.
const CACHE_AGE_LEN: usize = 4;

/// Legacy / current payload lengths per response type.
pub const SNAPSHOT_LEN: (usize, usize) = (7, 11);
pub const DELTA_LEN: (usize, usize) = (5, 9);
pub const DISTANCE_LEN: (usize, usize) = (9, 13);
pub const POWER_LEN: (usize, usize) = (9, 13);
pub const BUNDLE_LEN: (usize, usize) = (28, 32);
pub const IMU_LEN: (usize, usize) = (40, 44);

const_assert_eq!(SNAPSHOT_LEN.1, SNAPSHOT_LEN.0 + CACHE_AGE_LEN);
const_assert_eq!(DELTA_LEN.1, DELTA_LEN.0 + CACHE_AGE_LEN);
const_assert_eq!(DISTANCE_LEN.1, DISTANCE_LEN.0 + CACHE_AGE_LEN);
const_assert_eq!(POWER_LEN.1, POWER_LEN.0 + CACHE_AGE_LEN);
const_assert_eq!(BUNDLE_LEN.1, BUNDLE_LEN.0 + CACHE_AGE_LEN);
const_assert_eq!(IMU_LEN.1, IMU_LEN.0 + CACHE_AGE_LEN);

/// A complete outgoing frame, built without allocation.
pub type Frame = heapless::Vec<u8, MAX_FRAME>;

/// Build a complete frame for the given type and payload.
pub fn build_packet(type_byte: u8, payload: &[u8]) -> Result<Frame> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::framing(format!(
            "payload length {} exceeds max {MAX_PAYLOAD}",
            payload.len()
        )));
    }
    let mut frame = Frame::new();
    frame
        .extend_from_slice(&[PREAMBLE, type_byte, payload.len() as u8])
        .and_then(|()| frame.extend_from_slice(payload))
        .map_err(|()| Error::framing("frame overflow"))?;
    let crc = crc8_of(&frame);
    frame
        .push(crc)
        .map_err(|_| Error::framing("frame overflow"))?;
    Ok(frame)
}

fn crc8_of(bytes: &[u8]) -> u8 {
    crate::crc::crc8(bytes)
}

/// Validate a received header + payload against the trailing CRC byte.
pub fn validate_response(header: &[u8; HEADER_LEN], payload: &[u8], crc_byte: u8) -> Result<()> {
    if header[0] != PREAMBLE {
        return Err(Error::framing(format!("bad preamble 0x{:02X}", header[0])));
    }
    let mut scratch = heapless::Vec::<u8, { MAX_FRAME - 1 }>::new();
    scratch
        .extend_from_slice(header)
        .and_then(|()| scratch.extend_from_slice(payload))
        .map_err(|()| Error::framing("response larger than frame maximum"))?;
    let computed = crc8_of(&scratch);
    if crc_byte != computed {
        return Err(Error::crc(format!(
            "CRC mismatch (got 0x{crc_byte:02X}, expected 0x{computed:02X})"
        )));
    }
    Ok(())
}

// ─── Little-endian field readers ────────────────────────────────────

fn rd_u16(p: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([p[o], p[o + 1]])
}

fn rd_i16(p: &[u8], o: usize) -> i16 {
    i16::from_le_bytes([p[o], p[o + 1]])
}

fn rd_u32(p: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]])
}

fn rd_i32(p: &[u8], o: usize) -> i32 {
    i32::from_le_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]])
}

fn rd_f32(p: &[u8], o: usize) -> f32 {
    f32::from_le_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]])
}

/// Check a payload against the accepted legacy/current lengths; returns
/// true when the payload carries the trailing cache-age field.
fn check_len(what: &str, payload: &[u8], lens: (usize, usize)) -> Result<bool> {
    if payload.len() == lens.0 {
        Ok(false)
    } else if payload.len() == lens.1 {
        Ok(true)
    } else {
        Err(Error::framing(format!(
            "{what}: bad payload length {} (expected {} or {})",
            payload.len(),
            lens.0,
            lens.1
        )))
    }
}

/// Check that the device echoed the winch the request addressed.
fn check_winch(what: &str, requested: WinchId, echoed: u8) -> Result<()> {
    if echoed != requested {
        return Err(Error::framing(format!(
            "{what}: response winch {echoed} does not match request winch {requested}"
        )));
    }
    Ok(())
}

// ─── Typed payload parsers ──────────────────────────────────────────

/// Parse a SNAPSHOT response for the given winch.
pub fn parse_snapshot(winch: WinchId, payload: &[u8]) -> Result<SnapshotReading> {
    let current = check_len("snapshot", payload, SNAPSHOT_LEN)?;
    check_winch("snapshot", winch, payload[0])?;
    Ok(SnapshotReading {
        winch,
        total_count: rd_u32(payload, 1),
        hall_raw: rd_u16(payload, 5),
        cache_age_ms: current.then(|| rd_u32(payload, 7)),
    })
}

/// Parse a DELTA response for the given winch.
pub fn parse_delta(winch: WinchId, payload: &[u8]) -> Result<DeltaReading> {
    let current = check_len("delta", payload, DELTA_LEN)?;
    check_winch("delta", winch, payload[0])?;
    Ok(DeltaReading {
        winch,
        delta_count: rd_i32(payload, 1),
        cache_age_ms: current.then(|| rd_u32(payload, 5)),
    })
}

/// Parse a DISTANCE response.
pub fn parse_distance(payload: &[u8]) -> Result<DistanceReading> {
    let current = check_len("distance", payload, DISTANCE_LEN)?;
    Ok(DistanceReading {
        ok: payload[0],
        dist_mm: rd_u16(payload, 1),
        strength: rd_u16(payload, 3),
        temp_raw: rd_u16(payload, 5),
        age_ms: rd_u16(payload, 7),
        cache_age_ms: current.then(|| rd_u32(payload, 9)),
    })
}

/// Parse a POWER response for the given winch.
pub fn parse_power(winch: WinchId, payload: &[u8]) -> Result<PowerReading> {
    let current = check_len("power", payload, POWER_LEN)?;
    check_winch("power", winch, payload[0])?;
    Ok(PowerReading {
        bus_mv: rd_u16(payload, 1),
        current_ma: rd_i16(payload, 3),
        power_mw: rd_u32(payload, 5),
        cache_age_ms: current.then(|| rd_u32(payload, 9)),
    })
}

/// Parse a BUNDLE response for the given winch.
pub fn parse_bundle(winch: WinchId, payload: &[u8]) -> Result<BundleReading> {
    let current = check_len("bundle", payload, BUNDLE_LEN)?;
    check_winch("bundle", winch, payload[0])?;
    Ok(BundleReading {
        winch,
        flags: payload[1],
        total_count: rd_i32(payload, 2),
        delta_count: rd_i32(payload, 6),
        hall_raw: rd_u16(payload, 10),
        dist_mm: rd_u16(payload, 12),
        strength: rd_u16(payload, 14),
        temp_raw: rd_u16(payload, 16),
        age_ms: rd_u16(payload, 18),
        bus_mv: rd_u16(payload, 20),
        current_ma: rd_i16(payload, 22),
        power_mw: rd_u32(payload, 24),
        cache_age_ms: current.then(|| rd_u32(payload, 28)),
    })
}

/// Parse an IMU response: ten f32 values, optionally followed by the
/// cache-age field.
pub fn parse_imu(payload: &[u8]) -> Result<ImuReading> {
    let current = check_len("imu", payload, IMU_LEN)?;
    Ok(ImuReading {
        gyro: [rd_f32(payload, 0), rd_f32(payload, 4), rd_f32(payload, 8)],
        accel: [
            rd_f32(payload, 12),
            rd_f32(payload, 16),
            rd_f32(payload, 20),
        ],
        temp_c: rd_f32(payload, 24),
        pitch: rd_f32(payload, 28),
        roll: rd_f32(payload, 32),
        yaw: rd_f32(payload, 36),
        cache_age_ms: current.then(|| rd_u32(payload, 40)),
    })
}

/// Decode an ERROR response payload into the unified device error.
pub fn parse_device_error(payload: &[u8]) -> Error {
    if payload.len() < 3 {
        return Error::framing("malformed device error payload");
    }
    let (orig_type, winch, code) = (payload[0], payload[1], payload[2]);
    let message = if payload.len() > 3 {
        String::from_utf8_lossy(&payload[3..]).into_owned()
    } else {
        device_code_text(code).to_string()
    };
    Error::Device {
        orig_type,
        winch,
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_crc(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let frame = build_packet(type_byte, payload).expect("build");
        frame.to_vec()
    }

    #[test]
    fn ping_frame_bytes() {
        assert_eq!(frame_with_crc(msg::PING, &[]), vec![0xAA, 0x01, 0x00, 0xDA]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = [0u8; MAX_PAYLOAD + 1];
        assert!(build_packet(msg::PING, &payload).is_err());
    }

    #[test]
    fn validate_accepts_own_frames() {
        let frame = frame_with_crc(msg::BUNDLE, &[0x02]);
        let header: [u8; 3] = [frame[0], frame[1], frame[2]];
        let payload = &frame[3..frame.len() - 1];
        let crc = frame[frame.len() - 1];
        validate_response(&header, payload, crc).expect("round trip");
    }

    #[test]
    fn validate_rejects_bad_preamble() {
        let err = validate_response(&[0x55, msg::PING, 0], &[], 0x00);
        assert!(err.is_err());
    }

    #[test]
    fn validate_rejects_bad_crc() {
        let frame = frame_with_crc(msg::PING, &[]);
        let header: [u8; 3] = [frame[0], frame[1], frame[2]];
        let err = validate_response(&header, &[], frame[3] ^ 0xFF);
        assert!(matches!(
            err,
            Err(Error::Transport {
                kind: nestor_common::error::TransportKind::Crc,
                ..
            })
        ));
    }

    fn bundle_payload(winch: u8, hall: u16, with_cache: bool) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(winch);
        p.push(0x01); // flags
        p.extend_from_slice(&1234i32.to_le_bytes());
        p.extend_from_slice(&(-5i32).to_le_bytes());
        p.extend_from_slice(&hall.to_le_bytes());
        p.extend_from_slice(&250u16.to_le_bytes()); // dist_mm
        p.extend_from_slice(&900u16.to_le_bytes()); // strength
        p.extend_from_slice(&21u16.to_le_bytes()); // temp_raw
        p.extend_from_slice(&7u16.to_le_bytes()); // age_ms
        p.extend_from_slice(&24_150u16.to_le_bytes()); // bus_mv
        p.extend_from_slice(&(-320i16).to_le_bytes()); // current_ma
        p.extend_from_slice(&7_728u32.to_le_bytes()); // power_mw
        if with_cache {
            p.extend_from_slice(&42u32.to_le_bytes());
        }
        p
    }

    #[test]
    fn bundle_parses_current_length() {
        let payload = bundle_payload(3, 2000, true);
        let bundle = parse_bundle(3, &payload).expect("parse");
        assert_eq!(bundle.winch, 3);
        assert_eq!(bundle.total_count, 1234);
        assert_eq!(bundle.delta_count, -5);
        assert_eq!(bundle.hall_raw, 2000);
        assert_eq!(bundle.bus_mv, 24_150);
        assert_eq!(bundle.current_ma, -320);
        assert_eq!(bundle.power_mw, 7_728);
        assert_eq!(bundle.cache_age_ms, Some(42));
    }

    #[test]
    fn bundle_parses_legacy_length() {
        let payload = bundle_payload(1, 1600, false);
        let bundle = parse_bundle(1, &payload).expect("parse");
        assert_eq!(bundle.hall_raw, 1600);
        assert_eq!(bundle.cache_age_ms, None);
    }

    #[test]
    fn bundle_rejects_winch_mismatch() {
        let payload = bundle_payload(2, 2000, true);
        assert!(parse_bundle(4, &payload).is_err());
    }

    #[test]
    fn bundle_rejects_odd_length() {
        let mut payload = bundle_payload(2, 2000, true);
        payload.push(0);
        assert!(parse_bundle(2, &payload).is_err());
    }

    #[test]
    fn snapshot_parses_both_lengths() {
        let mut p = vec![2u8];
        p.extend_from_slice(&99_000u32.to_le_bytes());
        p.extend_from_slice(&1800u16.to_le_bytes());
        let legacy = parse_snapshot(2, &p).expect("legacy");
        assert_eq!(legacy.total_count, 99_000);
        assert_eq!(legacy.hall_raw, 1800);
        assert_eq!(legacy.cache_age_ms, None);

        p.extend_from_slice(&17u32.to_le_bytes());
        let current = parse_snapshot(2, &p).expect("current");
        assert_eq!(current.cache_age_ms, Some(17));
    }

    #[test]
    fn delta_parses_signed() {
        let mut p = vec![1u8];
        p.extend_from_slice(&(-40i32).to_le_bytes());
        let delta = parse_delta(1, &p).expect("parse");
        assert_eq!(delta.delta_count, -40);
    }

    #[test]
    fn distance_parses_current_length() {
        let mut p = vec![1u8]; // ok
        p.extend_from_slice(&350u16.to_le_bytes());
        p.extend_from_slice(&1200u16.to_le_bytes());
        p.extend_from_slice(&19u16.to_le_bytes());
        p.extend_from_slice(&3u16.to_le_bytes());
        p.extend_from_slice(&8u32.to_le_bytes());
        let dist = parse_distance(&p).expect("parse");
        assert_eq!(dist.ok, 1);
        assert_eq!(dist.dist_mm, 350);
        assert_eq!(dist.cache_age_ms, Some(8));
    }

    #[test]
    fn imu_parses_ten_floats() {
        let values: [f32; 10] = [0.1, -0.2, 0.3, 0.0, 9.81, 0.0, 24.5, 1.5, -2.5, 90.0];
        let mut p = Vec::new();
        for v in values {
            p.extend_from_slice(&v.to_le_bytes());
        }
        let imu = parse_imu(&p).expect("legacy");
        assert!((imu.roll - (-2.5)).abs() < 1e-6);
        assert!((imu.accel[1] - 9.81).abs() < 1e-6);
        assert_eq!(imu.cache_age_ms, None);

        p.extend_from_slice(&5u32.to_le_bytes());
        let imu = parse_imu(&p).expect("current");
        assert_eq!(imu.cache_age_ms, Some(5));
    }

    #[test]
    fn device_error_decodes_known_codes() {
        let err = parse_device_error(&[msg::BUNDLE, 2, 4]);
        match err {
            Error::Device {
                orig_type,
                winch,
                code,
                message,
            } => {
                assert_eq!(orig_type, msg::BUNDLE);
                assert_eq!(winch, 2);
                assert_eq!(code, 4);
                assert_eq!(message, "no data");
            }
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[test]
    fn device_error_carries_message_bytes() {
        let mut payload = vec![msg::IMU, 0, 2];
        payload.extend_from_slice(b"imu busy");
        match parse_device_error(&payload) {
            Error::Device { message, .. } => assert_eq!(message, "imu busy"),
            other => panic!("expected device error, got {other:?}"),
        }
    }
}
