//! RS-485 motor bus.
//!
//! The bus is single-owner and single-threaded internally: callers must
//! not issue overlapping operations (the supervisor serializes access
//! behind its own lock). Each write is followed by a bounded settling
//! interval before the drive's echo is drained; a missing echo is a
//! warning, not an error — the bus is contended and the supervisor's next
//! cycle re-issues only differences.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use nestor_common::config::{MotionConfig, StopCommand};
use nestor_common::error::{Error, Result};
use nestor_common::types::{MotorDirection, WinchId};
use tracing::{debug, warn};

use crate::modbus::{
    self, CMD_FORWARD, CMD_REVERSE, CMD_STOP_BRAKE, CMD_STOP_NATURAL, REG_COMMAND, REG_RPM,
};

/// Result of one register write as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The drive echoed the request frame.
    Acked,
    /// Nothing came back within the settling window.
    NoResponse,
}

/// Seam between the bus logic and the physical link.
///
/// One transaction = write a frame, wait the settling interval, drain
/// whatever echo arrived. Tests substitute a recording implementation.
pub trait MotorPort: Send {
    /// Perform one write-then-drain transaction; returns the echo bytes
    /// (possibly empty).
    fn transact(&mut self, frame: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Physical RS-485 port (8N1).
pub struct SerialMotorPort {
    port: Box<dyn serialport::SerialPort>,
    settle: Duration,
}

impl SerialMotorPort {
    /// Open the serial device with the drive's fixed 8N1 framing.
    pub fn open(path: &str, baud: u32, timeout: Duration, settle: Duration) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .open()
            .map_err(|e| Error::io(format!("open serial port {path}: {e}")))?;
        Ok(Self { port, settle })
    }
}

impl MotorPort for SerialMotorPort {
    fn transact(&mut self, frame: &[u8]) -> std::io::Result<Vec<u8>> {
        // Purge stale bytes so the echo we read belongs to this frame.
        let _ = self.port.clear(serialport::ClearBuffer::Input);
        self.port.write_all(frame)?;
        self.port.flush()?;
        std::thread::sleep(self.settle);

        let pending = self.port.bytes_to_read().unwrap_or(0) as usize;
        let mut echo = vec![0u8; pending];
        if pending > 0 {
            self.port.read_exact(&mut echo)?;
        }
        Ok(echo)
    }
}

/// Discarding port for running the supervisor without drive hardware.
#[derive(Debug, Default)]
pub struct NullMotorPort;

impl MotorPort for NullMotorPort {
    fn transact(&mut self, frame: &[u8]) -> std::io::Result<Vec<u8>> {
        // Pretend the drive echoed the request.
        Ok(frame.to_vec())
    }
}

/// Interval between repeated no-echo warnings for the same (slave, op).
const WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Serialized access to all drives on the shared RS-485 bus.
pub struct MotorBus {
    port: Box<dyn MotorPort>,
    default_address: u8,
    addresses: std::collections::BTreeMap<WinchId, u8>,
    stop_value: u16,
    last_warn: HashMap<(u8, &'static str), Instant>,
}

impl MotorBus {
    /// Build the bus over an opened port, taking the address map and stop
    /// command variant from configuration.
    pub fn new(port: Box<dyn MotorPort>, cfg: &MotionConfig) -> Self {
        let stop_value = match cfg.stop_command {
            StopCommand::Natural => CMD_STOP_NATURAL,
            StopCommand::Brake => CMD_STOP_BRAKE,
        };
        Self {
            port,
            default_address: cfg.device_address,
            addresses: cfg.slave_map(),
            stop_value,
            last_warn: HashMap::new(),
        }
    }

    fn slave_for(&self, winch: WinchId) -> u8 {
        self.addresses
            .get(&winch)
            .copied()
            .unwrap_or(self.default_address)
    }

    /// Write the RPM setpoint (clamped and byte-swapped for the drive).
    pub fn write_rpm(&mut self, winch: WinchId, rpm: u16) -> Result<WriteOutcome> {
        let value = modbus::encode_rpm(rpm);
        self.write_register(winch, "rpm", REG_RPM, value)
    }

    /// Start the motor in the given direction.
    pub fn start(&mut self, winch: WinchId, direction: MotorDirection) -> Result<WriteOutcome> {
        let value = match direction {
            MotorDirection::Forward => CMD_FORWARD,
            MotorDirection::Reverse => CMD_REVERSE,
        };
        self.write_register(winch, "start", REG_COMMAND, value)
    }

    /// Stop the motor using the configured stop command.
    pub fn stop(&mut self, winch: WinchId) -> Result<WriteOutcome> {
        let value = self.stop_value;
        self.write_register(winch, "stop", REG_COMMAND, value)
    }

    /// Brake-stop the motor regardless of the configured stop command.
    pub fn brake_stop(&mut self, winch: WinchId) -> Result<WriteOutcome> {
        self.write_register(winch, "brake_stop", REG_COMMAND, CMD_STOP_BRAKE)
    }

    fn write_register(
        &mut self,
        winch: WinchId,
        op: &'static str,
        register: u16,
        value: u16,
    ) -> Result<WriteOutcome> {
        let slave = self.slave_for(winch);
        let frame = modbus::write_single(slave, register, value);
        let echo = self.port.transact(&frame)?;

        if echo.is_empty() {
            self.warn_rate_limited(slave, op, "no response");
            return Ok(WriteOutcome::NoResponse);
        }
        if echo.as_slice() != frame.as_slice() {
            self.warn_rate_limited(slave, op, "echo does not match request");
            debug!(slave, op, echo = ?echo, "unexpected echo");
            return Ok(WriteOutcome::NoResponse);
        }
        Ok(WriteOutcome::Acked)
    }

    fn warn_rate_limited(&mut self, slave: u8, op: &'static str, what: &str) {
        let now = Instant::now();
        let due = self
            .last_warn
            .get(&(slave, op))
            .is_none_or(|last| now.duration_since(*last) >= WARN_INTERVAL);
        if due {
            warn!(slave, op, "{what} on RS-485 bus");
            self.last_warn.insert((slave, op), now);
        }
    }
}
