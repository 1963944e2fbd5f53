//! Unified error taxonomy for the supervisor and its hardware links.
//!
//! Every failure the system can surface collapses into one tagged enum:
//! transport faults on the sensor link, device-reported errors, safety
//! refusals, precondition violations from the command facade, and job
//! worker failures.

use thiserror::Error;

/// Classification of a sensor-link transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Read or write timed out.
    Timeout,
    /// Peer closed the connection.
    Closed,
    /// Malformed frame: bad preamble, unexpected type or length.
    Framing,
    /// Checksum mismatch.
    Crc,
    /// Any other socket-level failure.
    Io,
}

/// Unified error type returned across the supervisor surface.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Sensor-link transport failure.
    #[error("transport {kind:?}: {message}")]
    Transport {
        /// Failure classification.
        kind: TransportKind,
        /// Human-readable detail.
        message: String,
    },

    /// The sensor device answered with an ERROR packet.
    #[error("device error orig=0x{orig_type:02X} winch={winch} code={code}: {message}")]
    Device {
        /// Type byte of the request that failed.
        orig_type: u8,
        /// Winch the request addressed (0 when not applicable).
        winch: u8,
        /// Device error code.
        code: u8,
        /// Decoded error text.
        message: String,
    },

    /// Motion refused by the safety monitor.
    #[error("safety: {0}")]
    Safety(String),

    /// Command rejected before any state change (mode guard, busy job, bad argument).
    #[error("{0}")]
    Precondition(String),

    /// A job worker failed.
    #[error("job error {label}: {reason}")]
    JobFailed {
        /// Job label.
        label: String,
        /// Failure detail.
        reason: String,
    },
}

impl Error {
    /// Transport timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Timeout,
            message: message.into(),
        }
    }

    /// Connection closed by peer.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Closed,
            message: message.into(),
        }
    }

    /// Malformed frame.
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Framing,
            message: message.into(),
        }
    }

    /// CRC mismatch.
    pub fn crc(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Crc,
            message: message.into(),
        }
    }

    /// Generic socket failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Io,
            message: message.into(),
        }
    }

    /// Precondition violation.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Whether this is a connection-level failure (transport or device),
    /// i.e. the poller should drop the link and reconnect.
    #[inline]
    pub const fn is_link_failure(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Device { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportKind::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => TransportKind::Closed,
            _ => TransportKind::Io,
        };
        Self::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

/// Decode a device error code into its documented meaning.
pub const fn device_code_text(code: u8) -> &'static str {
    match code {
        1 => "bad length",
        2 => "compact timeout",
        3 => "unknown command",
        4 => "no data",
        _ => "unknown",
    }
}

/// Workspace result alias.
pub type Result<T> = std::result::Result<T, Error>;
