//! Domain types shared across the workspace.
//!
//! Winch identifiers, supervisor modes, directional intents with their
//! per-winch sign vectors, typed sensor readings, the merged sensor
//! snapshot and the externally visible status report.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Identifier of one motorized cable spool. Matches the wire-format width
/// of the sensor protocol's winch byte.
pub type WinchId = u8;

// ─── Modes ──────────────────────────────────────────────────────────

/// Supervisor operating mode.
///
/// FAULT is latched: it is entered from any mode on a safety violation,
/// sensor comms failure, job exception or operator emergency stop, and is
/// exited only via an explicit clear-fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Default state, no motion permitted to start.
    Idle,
    /// Operator-assisted manual motion and hall-gated runs.
    Setup,
    /// Automated directional tests.
    Test,
    /// Motors forced stopped, reason latched.
    Fault,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Idle
    }
}

impl Mode {
    /// Upper-case name as used on the command surface.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Setup => "SETUP",
            Self::Test => "TEST",
            Self::Fault => "FAULT",
        }
    }

    /// Parse a case-insensitive mode name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "IDLE" => Some(Self::Idle),
            "SETUP" => Some(Self::Setup),
            "TEST" => Some(Self::Test),
            "FAULT" => Some(Self::Fault),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Directions ─────────────────────────────────────────────────────

/// Spin direction of a single motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorDirection {
    Forward,
    Reverse,
}

/// Directional motion intent over the four-winch rigging convention.
///
/// Each intent expands to one sign per winch, in the order of the
/// configured winch list. Lists longer than four winches leave the
/// remainder unaddressed; shorter lists use a prefix of the vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Back,
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    /// All directional intents, for iteration and validation messages.
    pub const ALL: [Self; 6] = [
        Self::Forward,
        Self::Back,
        Self::Left,
        Self::Right,
        Self::Up,
        Self::Down,
    ];

    /// Per-winch sign vector (w1, w2, w3, w4).
    pub const fn signs(self) -> [i8; 4] {
        match self {
            Self::Forward => [1, 1, -1, -1],
            Self::Back => [-1, -1, 1, 1],
            Self::Left => [-1, 1, -1, 1],
            Self::Right => [1, -1, 1, -1],
            Self::Up => [1, 1, 1, 1],
            Self::Down => [-1, -1, -1, -1],
        }
    }

    /// Lower-case name as used on the command surface.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Back => "back",
            Self::Left => "left",
            Self::Right => "right",
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    /// Parse a case-insensitive direction name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "forward" => Some(Self::Forward),
            "back" => Some(Self::Back),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Sensor readings ────────────────────────────────────────────────

/// Power telemetry for one winch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PowerReading {
    pub bus_mv: u16,
    pub current_ma: i16,
    pub power_mw: u32,
    /// Device-side cache age; absent on legacy payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u32>,
}

/// Encoder snapshot for one winch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotReading {
    pub winch: WinchId,
    pub total_count: u32,
    pub hall_raw: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u32>,
}

/// Encoder delta for one winch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeltaReading {
    pub winch: WinchId,
    pub delta_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u32>,
}

/// Global distance sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DistanceReading {
    pub ok: u8,
    pub dist_mm: u16,
    pub strength: u16,
    pub temp_raw: u16,
    pub age_ms: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u32>,
}

/// Single-request aggregate of one winch's encoder, hall, distance and
/// power telemetry. Either fully populated from one response or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BundleReading {
    pub winch: WinchId,
    /// Raw device flag byte, reported as-is.
    pub flags: u8,
    pub total_count: i32,
    pub delta_count: i32,
    pub hall_raw: u16,
    pub dist_mm: u16,
    pub strength: u16,
    pub temp_raw: u16,
    pub age_ms: u16,
    pub bus_mv: u16,
    pub current_ma: i16,
    pub power_mw: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u32>,
}

impl BundleReading {
    /// Power fields of the bundle as a standalone reading.
    pub const fn power(&self) -> PowerReading {
        PowerReading {
            bus_mv: self.bus_mv,
            current_ma: self.current_ma,
            power_mw: self.power_mw,
            cache_age_ms: self.cache_age_ms,
        }
    }
}

/// IMU reading: angular rates, accelerations and fused attitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImuReading {
    pub gyro: [f32; 3],
    pub accel: [f32; 3],
    pub temp_c: f32,
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u32>,
}

// ─── Shared snapshot ────────────────────────────────────────────────

/// Latest merged sensor reading, owned by the supervisor and written by
/// the sensor poller under the supervisor mutex.
///
/// On a poll failure the snapshot is frozen as-is; staleness is detected
/// through `last_update`, never by overwriting with partial data.
#[derive(Debug, Clone, Default)]
pub struct SensorSnapshot {
    /// Raw hall magnitude per winch.
    pub halls: BTreeMap<WinchId, u16>,
    /// Power telemetry per winch.
    pub power: BTreeMap<WinchId, PowerReading>,
    /// Full bundle per winch.
    pub bundles: BTreeMap<WinchId, BundleReading>,
    /// Latest IMU reading, if the device carries one.
    pub imu: Option<ImuReading>,
    /// Monotonic instant of the last successful poll; `None` until the
    /// first success. Drives the staleness rule.
    pub last_update: Option<Instant>,
    /// Wall-clock seconds of the last successful poll, for display.
    pub last_update_unix: Option<f64>,
    /// High-water hall mark per winch since boot.
    pub max_hall_seen: BTreeMap<WinchId, u16>,
}

// ─── Motor & command bookkeeping ────────────────────────────────────

/// Last commanded state of one motor, used to suppress redundant Modbus
/// writes. Mutated only under the supervisor mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorRuntimeState {
    pub running: bool,
    pub commanded_rpm: u16,
    pub commanded_dir: Option<MotorDirection>,
}

/// Result of the safety monitor's decision over the latest snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyStatus {
    /// Whether motion may start or continue.
    pub can_move: bool,
    /// Blocking reason, when `can_move` is false.
    pub reason: Option<String>,
    /// True when the only violation is a hall magnitude below threshold,
    /// which hall-tolerant jobs demote to a per-motor stop.
    pub hall_low: bool,
}

impl SafetyStatus {
    /// Motion permitted.
    pub const fn clear() -> Self {
        Self {
            can_move: true,
            reason: None,
            hall_low: false,
        }
    }

    /// Motion blocked for the given reason.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            can_move: false,
            reason: Some(reason.into()),
            hall_low: false,
        }
    }
}

/// Rolling single-slot record of the most recent externally issued intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastCommand {
    /// Unix seconds when the command was recorded.
    pub ts: f64,
    pub action: String,
    pub detail: String,
}

// ─── Status report ──────────────────────────────────────────────────

/// Deep copy of supervisor state handed to external observers.
///
/// Built under the supervisor mutex with no I/O, serialized as-is onto
/// the status and SSE surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub mode: Mode,
    pub fault: Option<String>,
    pub halls: BTreeMap<WinchId, u16>,
    pub power: BTreeMap<WinchId, PowerReading>,
    pub bundles: BTreeMap<WinchId, BundleReading>,
    pub imu: Option<ImuReading>,
    /// Configured hall safety threshold, for dashboard rendering.
    pub threshold: u16,
    /// Unix seconds of the last successful poll.
    pub last_update: Option<f64>,
    /// Age of the last successful poll in seconds.
    pub last_update_age_s: Option<f64>,
    pub max_hall_seen: BTreeMap<WinchId, u16>,
    pub job_label: Option<String>,
    pub job_running: bool,
    pub job_generation: u64,
    /// Last RPM commanded per winch by a hall-gated run (0 = stopped).
    pub hall_commands: BTreeMap<WinchId, u16>,
    pub last_command: Option<LastCommand>,
    /// Most recent sensor-link error, if any.
    pub evb_last_error: Option<String>,
    /// Consecutive failed poll cycles since the last success.
    pub error_streak: u32,
    /// Successful poll cycles since boot.
    pub poll_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_round_trip() {
        for mode in [Mode::Idle, Mode::Setup, Mode::Test, Mode::Fault] {
            assert_eq!(Mode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(Mode::parse("setup"), Some(Mode::Setup));
        assert_eq!(Mode::parse("bogus"), None);
    }

    #[test]
    fn mode_serializes_upper_case() {
        let json = serde_json::to_string(&Mode::Fault).expect("serialize");
        assert_eq!(json, "\"FAULT\"");
    }

    #[test]
    fn direction_signs_match_rigging_convention() {
        assert_eq!(Direction::Forward.signs(), [1, 1, -1, -1]);
        assert_eq!(Direction::Back.signs(), [-1, -1, 1, 1]);
        assert_eq!(Direction::Left.signs(), [-1, 1, -1, 1]);
        assert_eq!(Direction::Right.signs(), [1, -1, 1, -1]);
        assert_eq!(Direction::Up.signs(), [1, 1, 1, 1]);
        assert_eq!(Direction::Down.signs(), [-1, -1, -1, -1]);
    }

    #[test]
    fn opposite_directions_negate() {
        let pairs = [
            (Direction::Forward, Direction::Back),
            (Direction::Left, Direction::Right),
            (Direction::Up, Direction::Down),
        ];
        for (a, b) in pairs {
            let negated: Vec<i8> = a.signs().iter().map(|s| -s).collect();
            assert_eq!(negated, b.signs());
        }
    }

    #[test]
    fn direction_parse_is_case_insensitive() {
        assert_eq!(Direction::parse("LEFT"), Some(Direction::Left));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn bundle_power_projection() {
        let bundle = BundleReading {
            winch: 3,
            flags: 0,
            total_count: 10,
            delta_count: -2,
            hall_raw: 2000,
            dist_mm: 150,
            strength: 900,
            temp_raw: 21,
            age_ms: 5,
            bus_mv: 24_000,
            current_ma: -150,
            power_mw: 3_600,
            cache_age_ms: Some(12),
        };
        let power = bundle.power();
        assert_eq!(power.bus_mv, 24_000);
        assert_eq!(power.current_ma, -150);
        assert_eq!(power.power_mw, 3_600);
        assert_eq!(power.cache_age_ms, Some(12));
    }

    #[test]
    fn status_report_serializes_winch_keys_as_strings() {
        let mut halls = BTreeMap::new();
        halls.insert(1u8, 2000u16);
        let report = StatusReport {
            mode: Mode::Idle,
            fault: None,
            halls,
            power: BTreeMap::new(),
            bundles: BTreeMap::new(),
            imu: None,
            threshold: 1500,
            last_update: None,
            last_update_age_s: None,
            max_hall_seen: BTreeMap::new(),
            job_label: None,
            job_running: false,
            job_generation: 0,
            hall_commands: BTreeMap::new(),
            last_command: None,
            evb_last_error: None,
            error_streak: 0,
            poll_seq: 0,
        };
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["halls"]["1"], 2000);
        assert_eq!(json["mode"], "IDLE");
    }
}
