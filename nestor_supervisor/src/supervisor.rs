//! Motion supervisor: mode state machine, job lifecycle, per-motor
//! command cache and the thread-safe command facade.
//!
//! ## Locking
//!
//! One mutex guards all supervisor state; a second guards the motor bus.
//! No code path holds the state lock across bus or socket I/O — writes
//! are planned under the state lock (diffed against the per-motor cache),
//! then issued under the bus lock only. Status reads copy state and never
//! perform I/O.
//!
//! ## Cancellation
//!
//! The generation counter increases on every job start, cancel, stop and
//! fault. Workers capture their generation and exit as soon as it goes
//! stale; motion writes re-check the generation after acquiring the bus
//! so a cancel that already issued its stops is never overwritten.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nestor_common::config::NestorConfig;
use nestor_common::error::{Error, Result};
use nestor_common::types::{
    BundleReading, Direction, ImuReading, LastCommand, Mode, MotorDirection, MotorRuntimeState,
    PowerReading, SensorSnapshot, StatusReport, WinchId,
};
use nestor_hal::motor::MotorBus;
use tracing::{debug, info, warn};

use crate::jobs::{self, JobKind};
use crate::mapper::HallRpmMap;
use crate::safety::SafetyMonitor;

/// One cycle's worth of fresh sensor data, merged atomically into the
/// shared snapshot.
#[derive(Debug, Clone, Default)]
pub struct SensorUpdate {
    pub halls: BTreeMap<WinchId, u16>,
    pub power: BTreeMap<WinchId, PowerReading>,
    pub bundles: BTreeMap<WinchId, BundleReading>,
    pub imu: Option<ImuReading>,
}

/// Planned motor bus write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MotorOp {
    Rpm(WinchId, u16),
    Start(WinchId, MotorDirection),
    Stop(WinchId),
}

/// Bookkeeping for the single active job slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobSlot {
    /// Label of the current (or most recent) job.
    pub label: Option<String>,
    /// Whether a worker is alive for this slot.
    pub running: bool,
    /// Whether the job tolerates sub-threshold halls (per-motor stop
    /// instead of fault).
    pub hall_tolerant: bool,
    /// Generation captured when the job started.
    pub generation: u64,
}

/// All mutable supervisor state, guarded by the supervisor mutex.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub mode: Mode,
    pub fault: Option<String>,
    pub snapshot: SensorSnapshot,
    pub motors: BTreeMap<WinchId, MotorRuntimeState>,
    pub hall_commands: BTreeMap<WinchId, u16>,
    pub job: JobSlot,
    pub last_command: Option<LastCommand>,
    pub evb_last_error: Option<String>,
    pub error_streak: u32,
    pub poll_seq: u64,
}

/// The supervisory controller. Constructed once at startup and shared by
/// reference with the poller, job workers and the presentation adapter.
pub struct Supervisor {
    cfg: NestorConfig,
    safety: SafetyMonitor,
    map: HallRpmMap,
    state: Mutex<SharedState>,
    generation: AtomicU64,
    bus: Mutex<MotorBus>,
    shutdown: AtomicBool,
}

impl Supervisor {
    /// Build the supervisor over an opened motor bus.
    pub fn new(cfg: NestorConfig, bus: MotorBus) -> Arc<Self> {
        let mut state = SharedState::default();
        for &w in &cfg.motion.winch_ids {
            state.motors.insert(w, MotorRuntimeState::default());
            state.hall_commands.insert(w, 0);
        }
        let safety = SafetyMonitor::new(cfg.motion.hall_threshold, cfg.motion.stale_timeout());
        let map = HallRpmMap::from_config(&cfg.motion);
        Arc::new(Self {
            cfg,
            safety,
            map,
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            bus: Mutex::new(bus),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Process configuration.
    #[inline]
    pub fn config(&self) -> &NestorConfig {
        &self.cfg
    }

    #[inline]
    pub(crate) const fn hall_map(&self) -> &HallRpmMap {
        &self.map
    }

    // ─── Locks & generation ─────────────────────────────────────────

    /// Lock the supervisor state. Poisoning is deliberately ignored: a
    /// panicked worker must never wedge the stop path.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_bus(&self) -> MutexGuard<'_, MotorBus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current job generation.
    #[inline]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether the captured generation is still the active one.
    #[inline]
    pub fn generation_current(&self, captured: u64) -> bool {
        self.current_generation() == captured
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ─── Status ─────────────────────────────────────────────────────

    /// Deep copy of the externally visible state. Never performs I/O.
    pub fn get_status(&self) -> StatusReport {
        let now = Instant::now();
        let st = self.lock_state();
        StatusReport {
            mode: st.mode,
            fault: st.fault.clone(),
            halls: st.snapshot.halls.clone(),
            power: st.snapshot.power.clone(),
            bundles: st.snapshot.bundles.clone(),
            imu: st.snapshot.imu,
            threshold: self.cfg.motion.hall_threshold,
            last_update: st.snapshot.last_update_unix,
            last_update_age_s: st
                .snapshot
                .last_update
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            max_hall_seen: st.snapshot.max_hall_seen.clone(),
            job_label: st.job.label.clone(),
            job_running: st.job.running,
            job_generation: self.current_generation(),
            hall_commands: st.hall_commands.clone(),
            last_command: st.last_command.clone(),
            evb_last_error: st.evb_last_error.clone(),
            error_streak: st.error_streak,
            poll_seq: st.poll_seq,
        }
    }

    /// Record the most recent externally issued intent (diagnostics).
    pub fn record_command(&self, action: &str, detail: &str) {
        let mut st = self.lock_state();
        st.last_command = Some(LastCommand {
            ts: unix_now(),
            action: action.to_string(),
            detail: detail.to_string(),
        });
    }

    // ─── Mode & fault transitions ───────────────────────────────────

    /// Switch mode. Rejected while faulted (unless the target is FAULT
    /// itself); every transition stops motors and cancels any active job
    /// first.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let stops = {
            let mut st = self.lock_state();
            if st.fault.is_some() && mode != Mode::Fault {
                return Err(Error::precondition("in FAULT; clear fault first"));
            }
            self.bump_generation();
            let stops = self.collect_stops(&mut st);
            st.mode = mode;
            stops
        };
        info!(%mode, "mode change");
        self.issue_stops(&stops);
        Ok(())
    }

    /// Clear the latched fault, stop motors and return to IDLE.
    pub fn clear_fault(&self) -> Result<()> {
        self.bump_generation();
        let stops = {
            let mut st = self.lock_state();
            st.fault = None;
            st.mode = Mode::Idle;
            self.collect_stops(&mut st)
        };
        info!("fault cleared; entering IDLE");
        self.issue_stops(&stops);
        Ok(())
    }

    /// Cancel the current job and stop motors; optionally latch FAULT.
    ///
    /// The serial I/O runs on a short-lived thread so request workers and
    /// the status stream stay responsive.
    pub fn stop_all(self: &Arc<Self>, reason: &str, as_fault: bool) {
        self.bump_generation();
        let stops = {
            let mut st = self.lock_state();
            if as_fault {
                self.latch_fault(&mut st, reason);
            }
            self.collect_stops(&mut st)
        };
        if as_fault {
            warn!(reason, "emergency stop");
        } else {
            info!(reason, "stop all");
        }
        self.spawn_stop_task(stops);
    }

    /// Force-stop and latch FAULT regardless of current state.
    pub fn emergency_stop(self: &Arc<Self>, reason: &str) {
        self.stop_all(reason, true);
    }

    /// Non-fault job cancellation.
    pub fn cancel_job(self: &Arc<Self>, reason: &str) {
        info!(reason, "job cancel requested");
        self.bump_generation();
        let stops = {
            let mut st = self.lock_state();
            self.collect_stops(&mut st)
        };
        self.spawn_stop_task(stops);
    }

    /// Sensor link failure: latch FAULT with the link error, cancel any
    /// job and stop motors synchronously (called from the poll worker).
    pub fn sensor_failure(&self, reason: &str) {
        warn!(reason, "sensor link failure");
        self.bump_generation();
        let stops = {
            let mut st = self.lock_state();
            st.evb_last_error = Some(reason.to_string());
            st.error_streak = st.error_streak.saturating_add(1);
            self.latch_fault(&mut st, reason);
            self.collect_stops(&mut st)
        };
        self.issue_stops(&stops);
    }

    /// Fault raised from inside a job worker (sync stop path).
    pub(crate) fn worker_fault(&self, reason: &str) {
        self.bump_generation();
        let stops = {
            let mut st = self.lock_state();
            self.latch_fault(&mut st, reason);
            self.collect_stops(&mut st)
        };
        self.issue_stops(&stops);
    }

    fn latch_fault(&self, st: &mut SharedState, reason: &str) {
        if st.mode != Mode::Fault {
            warn!(reason, "entering FAULT");
        }
        // First reason wins.
        if st.fault.is_none() {
            st.fault = Some(reason.to_string());
        }
        st.mode = Mode::Fault;
    }

    // ─── Sensor snapshot ────────────────────────────────────────────

    /// Merge one poll cycle into the shared snapshot and apply the safety
    /// rule. Called by the sensor poll worker; the whole merge is one
    /// critical section, and a safety stop is issued before the caller's
    /// cycle sleep.
    pub fn apply_sensor_update(&self, update: SensorUpdate) {
        let now = Instant::now();
        let stops = {
            let mut st = self.lock_state();
            for (&w, &hall) in &update.halls {
                let peak = st.snapshot.max_hall_seen.entry(w).or_insert(0);
                if hall > *peak {
                    *peak = hall;
                }
            }
            st.snapshot.halls.extend(update.halls);
            st.snapshot.power.extend(update.power);
            st.snapshot.bundles.extend(update.bundles);
            if let Some(imu) = update.imu {
                st.snapshot.imu = Some(imu);
            }
            st.snapshot.last_update = Some(now);
            st.snapshot.last_update_unix = Some(unix_now());
            st.poll_seq = st.poll_seq.wrapping_add(1);
            st.error_streak = 0;

            let status = self
                .safety
                .evaluate(&st.snapshot.halls, st.snapshot.last_update, now);
            if status.can_move || (status.hall_low && st.job.running && st.job.hall_tolerant) {
                // Hall-gated jobs demote sub-threshold halls to per-motor
                // stops; every other violation faults.
                Vec::new()
            } else {
                let reason = status
                    .reason
                    .unwrap_or_else(|| "safety violation".to_string());
                self.bump_generation();
                self.latch_fault(&mut st, &reason);
                self.collect_stops(&mut st)
            }
        };
        self.issue_stops(&stops);
    }

    // ─── Job submission facade ──────────────────────────────────────

    /// SETUP: jog all winches upward for a bounded time.
    pub fn setup_jog(self: &Arc<Self>, rpm: u16, seconds: f64) -> Result<String> {
        let targets = self.vector_for(Direction::Up);
        self.start_job(
            Mode::Setup,
            false,
            "setup_jog".to_string(),
            JobKind::Timed {
                targets,
                rpm,
                seconds,
            },
        )
    }

    /// SETUP: unbounded hall-gated run. `forward` maps to the `up`
    /// vector, `reverse` to `down`; the hall map governs the commanded
    /// RPM, so `rpm` is recorded only for diagnostics.
    pub fn setup_hall_run(
        self: &Arc<Self>,
        rpm: u16,
        seconds: f64,
        direction: &str,
    ) -> Result<String> {
        let dir = match direction.to_ascii_lowercase().as_str() {
            "forward" => Direction::Up,
            "reverse" => Direction::Down,
            _ => {
                return Err(Error::precondition(format!(
                    "invalid setup direction '{direction}' (expected forward or reverse)"
                )));
            }
        };
        debug!(rpm, seconds, direction, "setup hall run requested");
        let targets = self.vector_for(dir);
        self.start_job(
            Mode::Setup,
            false,
            "setup_hall".to_string(),
            JobKind::HallGated { targets },
        )
    }

    /// TEST: run the `up` vector for a bounded time.
    pub fn test_up(self: &Arc<Self>, rpm: u16, seconds: f64) -> Result<String> {
        let targets = self.vector_for(Direction::Up);
        self.start_job(
            Mode::Test,
            false,
            "test_up".to_string(),
            JobKind::Timed {
                targets,
                rpm,
                seconds,
            },
        )
    }

    /// TEST: run a named directional vector for a bounded time. Requires
    /// the safety monitor to permit movement at submission.
    pub fn test_direction(self: &Arc<Self>, name: &str, rpm: u16, seconds: f64) -> Result<String> {
        let dir = Direction::parse(name)
            .ok_or_else(|| Error::precondition(format!("invalid direction '{name}'")))?;
        let targets = self.vector_for(dir);
        self.start_job(
            Mode::Test,
            true,
            format!("dir_{dir}"),
            JobKind::Timed {
                targets,
                rpm,
                seconds,
            },
        )
    }

    fn vector_for(&self, dir: Direction) -> Vec<(WinchId, i8)> {
        self.cfg
            .motion
            .winch_ids
            .iter()
            .zip(dir.signs())
            .map(|(&w, sign)| (w, sign))
            .collect()
    }

    fn ensure_ready(&self, st: &SharedState, required: Mode) -> Result<()> {
        if let Some(reason) = &st.fault {
            return Err(Error::precondition(format!("FAULT: {reason}")));
        }
        if st.mode != required {
            return Err(Error::precondition(format!("mode must be {required}")));
        }
        if st.job.running {
            return Err(Error::precondition("another job running"));
        }
        Ok(())
    }

    fn start_job(
        self: &Arc<Self>,
        required_mode: Mode,
        check_safety: bool,
        label: String,
        kind: JobKind,
    ) -> Result<String> {
        let job_gen = {
            let mut st = self.lock_state();
            self.ensure_ready(&st, required_mode)?;
            if check_safety {
                let status = self.safety.evaluate(
                    &st.snapshot.halls,
                    st.snapshot.last_update,
                    Instant::now(),
                );
                if !status.can_move {
                    let reason = status
                        .reason
                        .unwrap_or_else(|| "safety violation".to_string());
                    self.bump_generation();
                    self.latch_fault(&mut st, &reason);
                    let stops = self.collect_stops(&mut st);
                    drop(st);
                    self.issue_stops(&stops);
                    return Err(Error::Safety(reason));
                }
            }
            let job_gen = self.bump_generation();
            st.job = JobSlot {
                label: Some(label.clone()),
                running: true,
                hall_tolerant: matches!(kind, JobKind::HallGated { .. }),
                generation: job_gen,
            };
            job_gen
        };
        info!(job = %label, generation = job_gen, "job start");

        let sup = Arc::clone(self);
        let worker_label = label.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{label}"))
            .spawn(move || jobs::run(&sup, job_gen, &worker_label, kind));
        if let Err(e) = spawned {
            self.job_finished(job_gen);
            return Err(Error::precondition(format!("failed to spawn job: {e}")));
        }
        Ok(label)
    }

    /// Register a blocking driver (the balance loop) in the job slot so
    /// cancel and emergency paths reach it through the generation counter.
    pub(crate) fn begin_blocking_job(&self, label: &str) -> Result<u64> {
        let mut st = self.lock_state();
        if let Some(reason) = &st.fault {
            return Err(Error::precondition(format!("FAULT: {reason}")));
        }
        if st.job.running {
            return Err(Error::precondition("another job running"));
        }
        let job_gen = self.bump_generation();
        st.job = JobSlot {
            label: Some(label.to_string()),
            running: true,
            hall_tolerant: false,
            generation: job_gen,
        };
        Ok(job_gen)
    }

    /// Mark the job slot idle if it still belongs to the given generation.
    pub(crate) fn job_finished(&self, job_gen: u64) {
        let mut st = self.lock_state();
        if st.job.generation == job_gen {
            st.job.running = false;
        }
    }

    // ─── Motor commanding ───────────────────────────────────────────

    /// Command a sign vector at a uniform RPM, going through the safety
    /// gate and the per-motor cache. Used by timed jobs and the balance
    /// loop; hall-gated runs plan their own per-motor writes.
    pub(crate) fn command_vector(
        &self,
        job_gen: Option<u64>,
        targets: &[(WinchId, i8)],
        rpm: u16,
    ) -> Result<()> {
        let ops = {
            let mut st = self.lock_state();
            let status =
                self.safety
                    .evaluate(&st.snapshot.halls, st.snapshot.last_update, Instant::now());
            if !status.can_move {
                let reason = status
                    .reason
                    .unwrap_or_else(|| "safety violation".to_string());
                self.bump_generation();
                self.latch_fault(&mut st, &reason);
                let stops = self.collect_stops(&mut st);
                drop(st);
                warn!(reason = %reason, "motion blocked");
                self.issue_stops(&stops);
                return Err(Error::Safety(reason));
            }
            if let Some(captured) = job_gen {
                if !self.generation_current(captured) {
                    return Err(Error::precondition("job cancelled"));
                }
            }
            self.diff_vector(&mut st, targets, rpm)
        };
        self.apply_ops(job_gen, ops);
        Ok(())
    }

    /// Plan the minimal writes that reach the desired vector state.
    fn diff_vector(
        &self,
        st: &mut SharedState,
        targets: &[(WinchId, i8)],
        rpm: u16,
    ) -> Vec<MotorOp> {
        let mut ops = Vec::new();
        for &(w, sign) in targets {
            let entry = st.motors.entry(w).or_default();
            if sign == 0 {
                if entry.running {
                    *entry = MotorRuntimeState::default();
                    st.hall_commands.insert(w, 0);
                    ops.push(MotorOp::Stop(w));
                }
                continue;
            }
            let dir = if sign > 0 {
                MotorDirection::Forward
            } else {
                MotorDirection::Reverse
            };
            if !entry.running || entry.commanded_rpm != rpm {
                ops.push(MotorOp::Rpm(w, rpm));
                entry.commanded_rpm = rpm;
            }
            if !entry.running || entry.commanded_dir != Some(dir) {
                ops.push(MotorOp::Start(w, dir));
                entry.commanded_dir = Some(dir);
            }
            entry.running = true;
        }
        ops
    }

    /// Issue planned writes under the bus lock.
    pub(crate) fn apply_ops(&self, job_gen: Option<u64>, ops: Vec<MotorOp>) {
        if ops.is_empty() {
            return;
        }
        let mut bus = self.lock_bus();
        // Re-check after taking the bus: a cancel that already issued its
        // stops must not be overwritten by motion planned earlier.
        if let Some(captured) = job_gen {
            if !self.generation_current(captured) {
                return;
            }
        }
        for op in ops {
            let result = match op {
                MotorOp::Rpm(w, rpm) => bus.write_rpm(w, rpm),
                MotorOp::Start(w, dir) => bus.start(w, dir),
                MotorOp::Stop(w) => bus.stop(w),
            };
            if let Err(e) = result {
                warn!(error = %e, "motor bus write failed");
            }
        }
    }

    /// Reset every cached motor state; returns the winches that still had
    /// a running command and therefore need a stop on the wire.
    fn collect_stops(&self, st: &mut SharedState) -> Vec<WinchId> {
        let mut stops = Vec::new();
        for &w in &self.cfg.motion.winch_ids {
            let entry = st.motors.entry(w).or_default();
            if entry.running {
                stops.push(w);
            }
            *entry = MotorRuntimeState::default();
            st.hall_commands.insert(w, 0);
        }
        stops
    }

    /// Issue stop commands synchronously. Failures are logged, never
    /// re-raised: the goal is monotonic convergence to stopped.
    ///
    /// Must not be called with the state lock held. Winches whose cache
    /// shows a running command again were re-commanded by a newer job
    /// after this plan was made and are skipped — stopping them here
    /// would undo their new owner's start.
    pub(crate) fn issue_stops(&self, stops: &[WinchId]) {
        if stops.is_empty() {
            return;
        }
        let plan: Vec<WinchId> = {
            let st = self.lock_state();
            stops
                .iter()
                .copied()
                .filter(|w| !st.motors.get(w).is_some_and(|m| m.running))
                .collect()
        };
        let mut bus = self.lock_bus();
        for &w in &plan {
            if let Err(e) = bus.stop(w) {
                warn!(winch = w, error = %e, "stop command failed");
            }
        }
    }

    /// Issue stops on a short-lived thread; falls back inline if the
    /// thread cannot be spawned.
    fn spawn_stop_task(self: &Arc<Self>, stops: Vec<WinchId>) {
        if stops.is_empty() {
            return;
        }
        let fallback = stops.clone();
        let sup = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("stop-task".to_string())
            .spawn(move || sup.issue_stops(&stops));
        if let Err(e) = spawned {
            warn!(error = %e, "stop task spawn failed; stopping inline");
            self.issue_stops(&fallback);
        }
    }

    /// Internal teardown stop used by job workers and shutdown.
    pub(crate) fn stop_motors_sync(&self, reason: &str) {
        debug!(reason, "stopping motors");
        let stops = {
            let mut st = self.lock_state();
            self.collect_stops(&mut st)
        };
        self.issue_stops(&stops);
    }

    // ─── Shutdown ───────────────────────────────────────────────────

    /// Request process shutdown: cancels any job and stops all motors.
    pub fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown requested");
        self.bump_generation();
        self.stop_motors_sync("shutdown");
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Wall-clock seconds since the epoch, for user-facing timestamps.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
