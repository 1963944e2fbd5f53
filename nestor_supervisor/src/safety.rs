//! Safety rules over the latest sensor snapshot.
//!
//! Hall magnitude is a proxy for cable engagement: below threshold the
//! cable may have slipped off its pulley, so motion is unsafe unless a
//! job that is designed to operate below the threshold is active (those
//! demote the hall clause to a per-motor stop).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nestor_common::types::{SafetyStatus, WinchId};

/// Pure decision function over halls and snapshot age.
#[derive(Debug, Clone, Copy)]
pub struct SafetyMonitor {
    hall_threshold: u16,
    stale_timeout: Duration,
}

impl SafetyMonitor {
    pub const fn new(hall_threshold: u16, stale_timeout: Duration) -> Self {
        Self {
            hall_threshold,
            stale_timeout,
        }
    }

    /// Configured hall threshold.
    #[inline]
    pub const fn hall_threshold(&self) -> u16 {
        self.hall_threshold
    }

    /// Evaluate whether motion is permitted right now.
    ///
    /// Clause order matters: a missing or stale snapshot always wins over
    /// hall values, so a frozen snapshot can never keep motion alive.
    pub fn evaluate(
        &self,
        halls: &BTreeMap<WinchId, u16>,
        last_update: Option<Instant>,
        now: Instant,
    ) -> SafetyStatus {
        let Some(updated) = last_update else {
            return SafetyStatus::blocked("no sensor update");
        };
        if now.duration_since(updated) > self.stale_timeout {
            return SafetyStatus::blocked("stale sensor data");
        }
        if halls.is_empty() {
            return SafetyStatus::blocked("missing hall data");
        }
        if halls.values().any(|&v| v < self.hall_threshold) {
            let mut status = SafetyStatus::blocked(format!("hall below {}", self.hall_threshold));
            status.hall_low = true;
            return status;
        }
        SafetyStatus::clear()
    }
}
