//! Motion job workers.
//!
//! At most one job worker runs at a time. Workers capture the generation
//! assigned at submission and poll it at every internal step; any
//! increment (cancel, conflicting start, fault, shutdown) makes them exit
//! promptly. A stop is always attempted on the way out, stale or not —
//! redundant stops are safe and idempotent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nestor_common::error::{Error, Result};
use nestor_common::types::{MotorDirection, MotorRuntimeState, WinchId};
use tracing::{debug, info};

use crate::supervisor::{MotorOp, Supervisor};

/// The two job shapes the supervisor schedules.
pub(crate) enum JobKind {
    /// Command the targets at a fixed RPM until the duration elapses.
    Timed {
        targets: Vec<(WinchId, i8)>,
        rpm: u16,
        seconds: f64,
    },
    /// Unbounded run whose per-motor RPM follows the live hall value;
    /// sub-threshold halls stop that motor instead of faulting.
    HallGated { targets: Vec<(WinchId, i8)> },
}

/// Job worker entry point. Any panic or error inside the job body
/// converges to a motors-stopped state; unexpected failures latch FAULT.
pub(crate) fn run(sup: &Arc<Supervisor>, job_gen: u64, label: &str, kind: JobKind) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
        JobKind::Timed {
            targets,
            rpm,
            seconds,
        } => run_timed(sup, job_gen, &targets, rpm, seconds),
        JobKind::HallGated { targets } => run_hall(sup, job_gen, &targets),
    }));

    // Teardown stop happens before the slot clears so a follow-up job
    // cannot start until the bus has converged to stopped.
    sup.stop_motors_sync("job teardown");
    sup.job_finished(job_gen);

    match outcome {
        Ok(Ok(())) => info!(job = label, "job finished"),
        // The safety gate has already latched the fault and stopped the
        // motors; nothing further to raise.
        Ok(Err(Error::Safety(reason))) => {
            debug!(job = label, reason = %reason, "job ended by safety stop");
        }
        Ok(Err(Error::Precondition(reason))) => {
            debug!(job = label, reason = %reason, "job cancelled");
        }
        Ok(Err(err)) => sup.worker_fault(&format!("job error {label}: {err}")),
        Err(_) => sup.worker_fault(&format!("job error {label}: worker panicked")),
    }
}

/// Timed job: one command at the start, then sleep in generation-checked
/// steps until the deadline.
fn run_timed(
    sup: &Arc<Supervisor>,
    job_gen: u64,
    targets: &[(WinchId, i8)],
    rpm: u16,
    seconds: f64,
) -> Result<()> {
    sup.command_vector(Some(job_gen), targets, rpm)?;
    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    let step = sup.config().motion.poll_interval();
    loop {
        if !sup.generation_current(job_gen) {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        std::thread::sleep(remaining.min(step));
    }
}

/// Hall-gated run: each cycle maps every targeted motor's live hall value
/// to an RPM, stops motors whose hall fell below threshold, and re-issues
/// only what changed (command cache + RPM deadband).
fn run_hall(sup: &Arc<Supervisor>, job_gen: u64, targets: &[(WinchId, i8)]) -> Result<()> {
    let motion = &sup.config().motion;
    let step = motion.poll_interval();
    let deadband = motion.rpm_deadband;
    let engage_level = motion.hall_threshold.saturating_add(motion.hall_hysteresis);
    let map = *sup.hall_map();

    info!("hall-gated run active");
    loop {
        if !sup.generation_current(job_gen) {
            return Ok(());
        }
        let ops = {
            let mut guard = sup.lock_state();
            let st = &mut *guard;
            if st.fault.is_some() {
                // The poller faulted (stale data, comms loss); exit quietly.
                return Ok(());
            }
            let halls = &st.snapshot.halls;
            let motors = &mut st.motors;
            let hall_commands = &mut st.hall_commands;

            let mut ops = Vec::new();
            for &(w, sign) in targets {
                if sign == 0 {
                    continue;
                }
                let hall = halls.get(&w).copied().unwrap_or(0);
                let entry = motors.entry(w).or_default();

                let mapped = map.rpm_for(hall);
                // A stopped motor re-engages only once the hall clears the
                // hysteresis band above the threshold.
                let command = match mapped {
                    Some(rpm) if entry.running || hall >= engage_level => Some(rpm),
                    _ => None,
                };

                match command {
                    None => {
                        if entry.running {
                            *entry = MotorRuntimeState::default();
                            hall_commands.insert(w, 0);
                            debug!(winch = w, hall, "hall below threshold; motor stop");
                            ops.push(MotorOp::Stop(w));
                        }
                    }
                    Some(rpm) => {
                        let dir = if sign > 0 {
                            MotorDirection::Forward
                        } else {
                            MotorDirection::Reverse
                        };
                        let last = hall_commands.get(&w).copied().unwrap_or(0);
                        if !entry.running || last == 0 || rpm.abs_diff(last) >= deadband {
                            ops.push(MotorOp::Rpm(w, rpm));
                            entry.commanded_rpm = rpm;
                            hall_commands.insert(w, rpm);
                        }
                        if !entry.running || entry.commanded_dir != Some(dir) {
                            ops.push(MotorOp::Start(w, dir));
                            entry.commanded_dir = Some(dir);
                        }
                        entry.running = true;
                    }
                }
            }
            ops
        };
        sup.apply_ops(Some(job_gen), ops);
        std::thread::sleep(step);
    }
}
