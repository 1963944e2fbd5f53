//! Blocking roll-balance driver.
//!
//! An alternative to the job system: reads IMU roll from the shared
//! snapshot, applies a PID correction to a base RPM and commands the
//! `up` vector. The sample interval adapts — it backs off while the
//! snapshot is stale and recovers toward the minimum while data flows.
//! Registered in the job slot so cancel, emergency stop and fault all
//! reach it through the generation counter.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nestor_common::error::{Error, Result};
use nestor_common::types::Direction;
use tracing::{info, warn};

use crate::pid::Pid;
use crate::supervisor::Supervisor;

/// Tunables for [`run`].
#[derive(Debug, Clone, Copy)]
pub struct BalanceOptions {
    /// RPM commanded at zero roll.
    pub base_rpm: f64,
    /// Target sample rate [Hz].
    pub sample_hz: f64,
    /// Fastest allowed interval [s].
    pub min_interval: f64,
    /// Slowest allowed interval [s].
    pub max_interval: f64,
    /// Interval growth factor while data is stale.
    pub backoff: f64,
    /// Interval recovery factor while data flows.
    pub recover: f64,
    /// Compute corrections but issue no motor commands.
    pub no_motors: bool,
}

impl Default for BalanceOptions {
    fn default() -> Self {
        Self {
            base_rpm: 1000.0,
            sample_hz: 50.0,
            min_interval: 0.02,
            max_interval: 0.2,
            backoff: 1.5,
            recover: 0.9,
            no_motors: false,
        }
    }
}

/// Run the balance loop until fault, cancel or shutdown. Blocking.
pub fn run(sup: &Arc<Supervisor>, opts: BalanceOptions) -> Result<()> {
    let job_gen = sup.begin_blocking_job("balance")?;
    let targets: Vec<_> = sup
        .config()
        .motion
        .winch_ids
        .iter()
        .zip(Direction::Up.signs())
        .map(|(&w, s)| (w, s))
        .collect();

    let mut pid = Pid::balance_defaults();
    let mut interval = if opts.sample_hz > 0.0 {
        (1.0 / opts.sample_hz).max(opts.min_interval)
    } else {
        opts.min_interval
    };
    let max_age = Duration::from_secs_f64(opts.max_interval);
    let mut last = Instant::now();

    info!(base_rpm = opts.base_rpm, "balance loop starting");
    let result = loop {
        if sup.is_shutdown() || !sup.generation_current(job_gen) {
            break Ok(());
        }
        let (imu, updated, fault) = {
            let st = sup.lock_state();
            (
                st.snapshot.imu,
                st.snapshot.last_update,
                st.fault.clone(),
            )
        };
        if let Some(reason) = fault {
            warn!(reason = %reason, "balance loop stopping on fault");
            break Ok(());
        }
        let (Some(imu), Some(updated)) = (imu, updated) else {
            thread::sleep(Duration::from_millis(50));
            continue;
        };
        if updated.elapsed() > max_age {
            // Stale IMU data: widen the interval and wait for fresh input.
            interval = (interval * opts.backoff).min(opts.max_interval);
            thread::sleep(Duration::from_millis(50));
            continue;
        }

        let loop_start = Instant::now();
        let dt = loop_start.duration_since(last).as_secs_f64();
        last = loop_start;

        let roll = f64::from(imu.roll);
        let correction = pid.update(roll, dt);
        let rpm_target = (opts.base_rpm + correction).clamp(0.0, 4000.0).round() as u16;

        if !opts.no_motors {
            match sup.command_vector(Some(job_gen), &targets, rpm_target) {
                Ok(()) => {}
                Err(Error::Safety(reason)) => {
                    warn!(reason = %reason, "balance loop stopping on safety stop");
                    break Ok(());
                }
                Err(Error::Precondition(_)) => break Ok(()), // cancelled
                Err(err) => break Err(err),
            }
        }
        info!(
            "roll={roll:+6.2} pitch={:+6.2} yaw={:+6.2} corr={correction:+7.1} rpm={rpm_target}",
            imu.pitch, imu.yaw
        );

        interval = (interval * opts.recover).clamp(opts.min_interval, opts.max_interval);
        let spent = loop_start.elapsed().as_secs_f64();
        if spent < interval {
            thread::sleep(Duration::from_secs_f64(interval - spent));
        }
    };

    if !opts.no_motors {
        sup.stop_motors_sync("balance loop stop");
    }
    sup.job_finished(job_gen);
    info!("balance loop stopped");
    result
}
