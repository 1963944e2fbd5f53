//! Integration tests for the motion supervisor.
//!
//! A recording motor port stands in for the RS-485 bus and sensor
//! updates are injected directly through the poller's entry point, so
//! these tests exercise the real facade, job workers, command cache and
//! fault paths end to end.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nestor_common::config::NestorConfig;
use nestor_common::types::{Mode, WinchId};
use nestor_hal::motor::{MotorBus, MotorPort};
use nestor_supervisor::supervisor::{SensorUpdate, Supervisor};

const REG_COMMAND: u16 = 0x8000;
const REG_RPM: u16 = 0x8005;
const CMD_FORWARD: u16 = 0x0902;
const CMD_REVERSE: u16 = 0x0B02;
const CMD_STOP: u16 = 0x0802;

/// One decoded register write as it appeared on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Write {
    slave: u8,
    register: u16,
    value: u16,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Write>>>);

impl Recorder {
    fn writes(&self) -> Vec<Write> {
        self.0.lock().expect("recorder poisoned").clone()
    }

    fn count(&self) -> usize {
        self.0.lock().expect("recorder poisoned").len()
    }

    fn stops_for(&self, slave: u8) -> usize {
        self.writes()
            .iter()
            .filter(|w| w.slave == slave && w.register == REG_COMMAND && w.value == CMD_STOP)
            .count()
    }
}

struct RecordingPort(Recorder);

impl MotorPort for RecordingPort {
    fn transact(&mut self, frame: &[u8]) -> std::io::Result<Vec<u8>> {
        assert_eq!(frame[1], 0x06, "supervisor must only write registers");
        let write = Write {
            slave: frame[0],
            register: u16::from_be_bytes([frame[2], frame[3]]),
            value: u16::from_be_bytes([frame[4], frame[5]]),
        };
        self.0.0.lock().expect("recorder poisoned").push(write);
        Ok(frame.to_vec())
    }
}

/// Test config: fast job steps, per-winch slave addresses so the wire
/// traffic identifies the winch.
fn test_config() -> NestorConfig {
    let mut cfg = NestorConfig::default();
    cfg.motion.poll_interval_s = 0.01;
    for w in 1..=4u8 {
        cfg.motion.modbus_addresses.insert(w.to_string(), w);
    }
    cfg
}

fn make_supervisor(cfg: NestorConfig) -> (Arc<Supervisor>, Recorder) {
    let recorder = Recorder::default();
    let bus = MotorBus::new(Box::new(RecordingPort(recorder.clone())), &cfg.motion);
    (Supervisor::new(cfg, bus), recorder)
}

fn healthy_halls(hall: u16) -> SensorUpdate {
    let mut update = SensorUpdate::default();
    for w in 1..=4u8 {
        update.halls.insert(w, hall);
    }
    update
}

fn halls_with(overrides: &[(WinchId, u16)], default: u16) -> SensorUpdate {
    let mut update = healthy_halls(default);
    for &(w, h) in overrides {
        update.halls.insert(w, h);
    }
    update
}

/// Poll until the predicate holds or the timeout expires.
fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}

// ─── Cold start & fault lifecycle ───────────────────────────────────

#[test]
fn cold_start_sensor_failure_faults_with_connection_reason() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.sensor_failure("sensor connection failure: connection refused");

    let status = sup.get_status();
    assert_eq!(status.mode, Mode::Fault);
    assert!(status.fault.as_deref().is_some_and(|f| f.contains("connection")));
    assert!(status.last_update.is_none());
    assert_eq!(status.error_streak, 1);
    // No motors were running, so nothing to stop on the wire.
    assert_eq!(recorder.count(), 0);

    // Operator clears the fault once the sensor is reachable again.
    sup.clear_fault().expect("clear");
    sup.apply_sensor_update(healthy_halls(2000));
    let status = sup.get_status();
    assert_eq!(status.mode, Mode::Idle);
    assert!(status.last_update.is_some());
}

#[test]
fn safety_trip_stops_running_motors_within_one_update() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Test).expect("to test");
    sup.test_up(400, 5.0).expect("start");
    assert!(
        wait_until(Duration::from_secs(2), || recorder.count() >= 8),
        "expected rpm+start per winch"
    );

    // Hall collapse on one winch: non-tolerant job → FAULT + stop all.
    sup.apply_sensor_update(halls_with(&[(3, 100)], 2000));
    let status = sup.get_status();
    assert_eq!(status.mode, Mode::Fault);
    assert_eq!(status.fault.as_deref(), Some("hall below 1500"));
    assert!(
        wait_until(Duration::from_secs(2), || {
            (1..=4).all(|w| recorder.stops_for(w) >= 1)
        }),
        "all winches must receive a stop"
    );
    // The cancelled worker exits promptly.
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

// ─── Mode guards & preconditions ────────────────────────────────────

#[test]
fn jobs_rejected_in_wrong_mode_without_state_change() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));

    let err = sup.setup_jog(200, 1.0).expect_err("not in SETUP");
    assert!(err.to_string().contains("mode must be SETUP"));
    let err = sup
        .setup_hall_run(200, 0.0, "forward")
        .expect_err("not in SETUP");
    assert!(err.to_string().contains("mode must be SETUP"));
    let err = sup.test_up(350, 1.0).expect_err("not in TEST");
    assert!(err.to_string().contains("mode must be TEST"));

    let status = sup.get_status();
    assert_eq!(status.mode, Mode::Idle);
    assert!(!status.job_running);
    assert_eq!(recorder.count(), 0);
}

#[test]
fn second_job_rejected_while_one_runs() {
    let (sup, _recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Test).expect("to test");
    sup.test_up(300, 3.0).expect("start");

    let err = sup.test_up(300, 1.0).expect_err("busy");
    assert!(err.to_string().contains("another job running"));
    sup.cancel_job("test cleanup");
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

#[test]
fn invalid_setup_direction_rejected() {
    let (sup, _recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Setup).expect("to setup");
    let err = sup
        .setup_hall_run(200, 0.0, "left")
        .expect_err("only forward/reverse");
    assert!(err.to_string().contains("invalid setup direction"));
}

// ─── Directional test gating (stale data) ───────────────────────────

#[test]
fn test_direction_rejected_on_stale_data_and_faults() {
    let mut cfg = test_config();
    cfg.motion.stale_timeout_s = 0.05;
    let (sup, recorder) = make_supervisor(cfg);
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Test).expect("to test");

    thread::sleep(Duration::from_millis(120)); // age past stale_timeout

    let err = sup.test_direction("left", 300, 2.0).expect_err("stale");
    assert!(err.to_string().contains("stale sensor data"));
    let status = sup.get_status();
    assert_eq!(status.mode, Mode::Fault);
    assert_eq!(status.fault.as_deref(), Some("stale sensor data"));
    // No Modbus traffic: nothing was running, nothing may start.
    assert_eq!(recorder.count(), 0);
}

#[test]
fn test_direction_rejected_without_any_sensor_update() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.set_mode(Mode::Test).expect("to test");
    let err = sup.test_direction("right", 300, 2.0).expect_err("no data");
    assert!(err.to_string().contains("no sensor update"));
    assert_eq!(sup.get_status().mode, Mode::Fault);
    assert_eq!(recorder.count(), 0);
}

#[test]
fn test_direction_commands_signed_vector() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Test).expect("to test");
    sup.test_direction("left", 300, 0.2).expect("start");

    assert!(
        wait_until(Duration::from_secs(2), || recorder.count() >= 8),
        "expected rpm+start per winch"
    );
    // left = (−, +, −, +): winches 1,3 reverse; 2,4 forward.
    let writes = recorder.writes();
    for (winch, expected) in [(1, CMD_REVERSE), (2, CMD_FORWARD), (3, CMD_REVERSE), (4, CMD_FORWARD)] {
        assert!(
            writes
                .iter()
                .any(|w| w.slave == winch && w.register == REG_COMMAND && w.value == expected),
            "winch {winch} missing start 0x{expected:04X}"
        );
    }
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

// ─── Hall-gated runs ────────────────────────────────────────────────

#[test]
fn hall_run_commands_mapped_rpm_exactly_once() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Setup).expect("to setup");
    sup.setup_hall_run(200, 0.0, "forward").expect("start");

    assert!(
        wait_until(Duration::from_secs(2), || recorder.count() >= 8),
        "expected rpm+start per winch"
    );
    // Hall 2000 → 200 + (500/1300) × 1300 = 700 → register 0xBC02.
    let writes = recorder.writes();
    for winch in 1..=4u8 {
        assert!(
            writes
                .iter()
                .any(|w| w.slave == winch && w.register == REG_RPM && w.value == 0xBC02),
            "winch {winch} missing 700 RPM write"
        );
        assert!(
            writes
                .iter()
                .any(|w| w.slave == winch && w.register == REG_COMMAND && w.value == CMD_FORWARD),
            "winch {winch} missing forward start"
        );
    }

    // Steady halls: further cycles must re-issue nothing.
    let count = recorder.count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.count(), count, "cache must suppress redundant writes");

    let status = sup.get_status();
    assert_eq!(status.hall_commands.get(&1), Some(&700));
    sup.cancel_job("test cleanup");
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

#[test]
fn hall_run_reverse_uses_down_vector() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Setup).expect("to setup");
    sup.setup_hall_run(200, 0.0, "reverse").expect("start");

    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 8));
    let writes = recorder.writes();
    for winch in 1..=4u8 {
        assert!(
            writes
                .iter()
                .any(|w| w.slave == winch && w.register == REG_COMMAND && w.value == CMD_REVERSE),
            "winch {winch} must start reverse"
        );
    }
    sup.cancel_job("test cleanup");
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

#[test]
fn hall_run_slipped_winch_stops_alone_without_fault() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Setup).expect("to setup");
    sup.setup_hall_run(200, 0.0, "forward").expect("start");
    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 8));

    // Winch 2 slips below threshold; the tolerant job stops it alone.
    sup.apply_sensor_update(halls_with(&[(2, 1400)], 2000));
    assert!(
        wait_until(Duration::from_secs(2), || recorder.stops_for(2) >= 1),
        "winch 2 must be stopped"
    );
    let status = sup.get_status();
    assert_eq!(status.mode, Mode::Setup, "mode must stay SETUP");
    assert!(status.fault.is_none(), "no fault for a tolerant job");
    assert!(status.job_running, "job keeps running");
    assert_eq!(status.hall_commands.get(&2), Some(&0));
    for winch in [1u8, 3, 4] {
        assert_eq!(recorder.stops_for(winch), 0, "winch {winch} must keep running");
    }

    sup.cancel_job("test cleanup");
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

#[test]
fn hall_run_hysteresis_delays_reengagement() {
    let mut cfg = test_config();
    cfg.motion.hall_hysteresis = 100;
    let (sup, recorder) = make_supervisor(cfg);
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Setup).expect("to setup");
    sup.setup_hall_run(200, 0.0, "forward").expect("start");
    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 8));

    // Slip and stop.
    sup.apply_sensor_update(halls_with(&[(1, 1400)], 2000));
    assert!(wait_until(Duration::from_secs(2), || recorder.stops_for(1) >= 1));

    // Back above threshold but inside the hysteresis band: stays stopped.
    sup.apply_sensor_update(halls_with(&[(1, 1550)], 2000));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sup.get_status().hall_commands.get(&1), Some(&0));

    // Clear of the band: re-engages.
    sup.apply_sensor_update(halls_with(&[(1, 1700)], 2000));
    assert!(
        wait_until(Duration::from_secs(2), || {
            sup.get_status().hall_commands.get(&1).copied().unwrap_or(0) > 0
        }),
        "winch 1 must re-engage above threshold + hysteresis"
    );

    sup.cancel_job("test cleanup");
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
}

// ─── Cancellation & generations ─────────────────────────────────────

#[test]
fn cancel_increments_generation_and_worker_exits_with_stop() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Test).expect("to test");
    sup.test_up(400, 10.0).expect("start");
    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 8));
    let generation_before = sup.get_status().job_generation;

    sup.emergency_stop("manual");

    let status = sup.get_status();
    assert!(status.job_generation > generation_before);
    assert_eq!(status.mode, Mode::Fault);
    assert_eq!(status.fault.as_deref(), Some("manual"));
    assert!(
        wait_until(Duration::from_secs(2), || {
            (1..=4).all(|w| recorder.stops_for(w) >= 1)
        }),
        "every winch must receive at least one stop"
    );
    assert!(
        wait_until(Duration::from_secs(2), || !sup.get_status().job_running),
        "worker must observe staleness within one step"
    );
    // Duplicate stops from the async path and the worker are tolerated.
    for w in 1..=4u8 {
        assert!(recorder.stops_for(w) <= 2, "winch {w} stopped more than twice");
    }
}

#[test]
fn stop_all_is_idempotent() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Test).expect("to test");
    sup.test_up(400, 10.0).expect("start");
    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 8));

    sup.stop_all("first", false);
    assert!(wait_until(Duration::from_secs(2), || {
        (1..=4).all(|w| recorder.stops_for(w) >= 1)
    }));
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
    let count_after_first = recorder.count();

    // Second stop converges to the same state with no new bus traffic.
    sup.stop_all("second", false);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.count(), count_after_first);
    assert!(sup.get_status().fault.is_none(), "plain stop must not fault");
}

#[test]
fn mode_change_cancels_active_job() {
    let (sup, recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.set_mode(Mode::Setup).expect("to setup");
    sup.setup_hall_run(200, 0.0, "forward").expect("start");
    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 8));

    sup.set_mode(Mode::Idle).expect("to idle");
    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
    assert!(wait_until(Duration::from_secs(2), || {
        (1..=4).all(|w| recorder.stops_for(w) >= 1)
    }));
}

// ─── Status surface ─────────────────────────────────────────────────

#[test]
fn status_reflects_job_and_command_bookkeeping() {
    let (sup, _recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    sup.record_command("mode", "setup");
    sup.set_mode(Mode::Setup).expect("to setup");
    sup.setup_jog(250, 0.05).expect("start");

    let status = sup.get_status();
    assert_eq!(status.job_label.as_deref(), Some("setup_jog"));
    assert_eq!(status.threshold, 1500);
    let last = status.last_command.expect("recorded");
    assert_eq!(last.action, "mode");
    assert_eq!(last.detail, "setup");
    assert!(last.ts > 0.0);

    assert!(wait_until(Duration::from_secs(2), || !sup
        .get_status()
        .job_running));
    // Label survives as "most recent job" after completion.
    assert_eq!(sup.get_status().job_label.as_deref(), Some("setup_jog"));
}

#[test]
fn snapshot_is_a_deep_copy() {
    let (sup, _recorder) = make_supervisor(test_config());
    sup.apply_sensor_update(healthy_halls(2000));
    let mut status = sup.get_status();
    status.halls.insert(1, 0);
    // Mutating the copy must not touch supervisor state.
    assert_eq!(sup.get_status().halls.get(&1), Some(&2000));
}
