//! Small PID controller for the roll balance loop.
//!
//! Integral and derivative state persist across cycles and must be reset
//! when the loop restarts. The output is clamped symmetrically; the first
//! update after a reset has no derivative contribution.

/// PID controller with clamped output.
#[derive(Debug, Clone, Copy)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    out_limit: f64,
    integral: f64,
    prev_error: Option<f64>,
}

impl Pid {
    pub const fn new(kp: f64, ki: f64, kd: f64, out_limit: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            out_limit,
            integral: 0.0,
            prev_error: None,
        }
    }

    /// Default gains for the roll balance loop.
    pub const fn balance_defaults() -> Self {
        Self::new(20.0, 0.1, 5.0, 1000.0)
    }

    /// Reset all internal state.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }

    /// Compute one cycle from the current error and elapsed time.
    pub fn update(&mut self, error: f64, dt: f64) -> f64 {
        if dt <= 0.0 {
            return 0.0;
        }
        self.integral += error * dt;
        let derivative = match self.prev_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };
        self.prev_error = Some(error);

        let out = self.kp * error + self.ki * self.integral + self.kd * derivative;
        out.clamp(-self.out_limit, self.out_limit)
    }
}
