//! Background sensor poll worker.
//!
//! Owns the TCP link to the sensor device. Each cycle pulls one bundle
//! (or snapshot + power pair) per winch plus an optional IMU reading,
//! merges the result into the shared snapshot and applies the safety
//! rule. Any transport, protocol or device failure emergency-stops the
//! platform, drops the connection and reconnects with exponential
//! backoff; a successful reconnect restores the initial backoff.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nestor_common::config::MotionConfig;
use nestor_common::error::Result;
use nestor_hal::evb::EvbClient;
use tracing::{debug, info};

use crate::supervisor::{SensorUpdate, Supervisor};

/// Spawn the poll worker. Returns its join handle; the loop exits when
/// the supervisor shuts down.
pub fn spawn(sup: Arc<Supervisor>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("sensor-poll".to_string())
        .spawn(move || run(&sup))
}

fn run(sup: &Arc<Supervisor>) {
    let sensor = sup.config().sensor.clone();
    let motion = sup.config().motion.clone();
    let mut backoff = Backoff::from_config(&motion);

    while !sup.is_shutdown() {
        let mut client = EvbClient::new(sensor.host.clone(), sensor.port, sensor.timeout());
        if let Err(e) = client.connect() {
            sup.sensor_failure(&format!("sensor connection failure: {e}"));
            backoff.sleep_and_grow(sup);
            continue;
        }
        info!(host = %sensor.host, port = sensor.port, "sensor link up");
        backoff.reset();

        session(sup, &mut client, &motion, &mut backoff);
    }
    debug!("sensor poll worker exiting");
}

/// Poll over one connection until it fails or shutdown is requested.
fn session(
    sup: &Arc<Supervisor>,
    client: &mut EvbClient,
    motion: &MotionConfig,
    backoff: &mut Backoff,
) {
    let period = motion.poll_interval();
    while !sup.is_shutdown() {
        let cycle_start = Instant::now();
        match poll_cycle(client, motion) {
            Ok(update) => {
                // Merge + safety evaluation; a safety stop goes out before
                // the cycle sleep below.
                sup.apply_sensor_update(update);
            }
            Err(e) => {
                sup.sensor_failure(&format!("sensor error: {e}"));
                client.close();
                backoff.sleep_and_grow(sup);
                return;
            }
        }
        let elapsed = cycle_start.elapsed();
        if elapsed < period {
            thread::sleep(period - elapsed);
        }
    }
}

/// One full request round: every winch, then the optional IMU.
fn poll_cycle(client: &mut EvbClient, motion: &MotionConfig) -> Result<SensorUpdate> {
    let mut update = SensorUpdate::default();
    for &w in &motion.winch_ids {
        if motion.use_bundle {
            let bundle = client.bundle(w)?;
            update.halls.insert(w, bundle.hall_raw);
            if motion.use_power {
                update.power.insert(w, bundle.power());
            }
            update.bundles.insert(w, bundle);
        } else {
            // Legacy mode: separate snapshot and power requests.
            let snapshot = client.snapshot(w)?;
            update.halls.insert(w, snapshot.hall_raw);
            if motion.use_power {
                update.power.insert(w, client.power(w)?);
            }
        }
    }
    if motion.use_imu {
        // IMU loss is non-fatal; the previous reading stays in place.
        match client.imu() {
            Ok(imu) => update.imu = Some(imu),
            Err(e) => debug!(error = %e, "imu read failed"),
        }
    }
    Ok(update)
}

/// Exponential reconnect backoff.
struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    fn from_config(motion: &MotionConfig) -> Self {
        let initial = Duration::from_secs_f64(motion.evb_backoff_initial_s);
        Self {
            current: initial,
            initial,
            max: Duration::from_secs_f64(motion.evb_backoff_max_s),
            factor: motion.evb_backoff_factor,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Sleep the current delay (in shutdown-aware slices), then grow it.
    fn sleep_and_grow(&mut self, sup: &Supervisor) {
        debug!(delay_ms = self.current.as_millis() as u64, "reconnect backoff");
        let mut remaining = self.current;
        let slice = Duration::from_millis(50);
        while !remaining.is_zero() && !sup.is_shutdown() {
            let nap = remaining.min(slice);
            thread::sleep(nap);
            remaining -= nap;
        }
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.factor).min(self.max.as_secs_f64()),
        );
    }
}
