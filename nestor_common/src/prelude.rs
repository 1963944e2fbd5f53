//! Prelude module for common re-exports.
//!
//! Consumers can `use nestor_common::prelude::*;` and get the most
//! important types without listing individual paths.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, MotionConfig, NestorConfig, StopCommand};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{Error, Result, TransportKind};

// ─── Domain types ───────────────────────────────────────────────────
pub use crate::types::{
    BundleReading, Direction, ImuReading, LastCommand, Mode, MotorDirection, MotorRuntimeState,
    PowerReading, SafetyStatus, SensorSnapshot, StatusReport, WinchId,
};
