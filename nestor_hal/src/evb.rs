//! Persistent TCP client for the sensor aggregator board.
//!
//! One request/response at a time over a single socket; the caller owns
//! serialization (at runtime the sensor poller is the only user). On any
//! transport error the socket is dropped so the next call starts from a
//! clean connect — a half-read frame would otherwise desynchronize the
//! stream.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use nestor_common::error::{Error, Result};
use nestor_common::types::{
    BundleReading, DeltaReading, DistanceReading, ImuReading, PowerReading, SnapshotReading,
    WinchId,
};
use tracing::debug;

use crate::packet::{self, HEADER_LEN, MAX_PAYLOAD, msg};

/// TCP client for the sensor device.
pub struct EvbClient {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl EvbClient {
    /// Create an unconnected client.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            stream: None,
        }
    }

    /// Whether a socket is currently held.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Establish the connection if not already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| Error::io(format!("connection failure to {addr}: {e}")))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        debug!(%addr, "sensor link connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::io(format!("resolve {}:{}: {e}", self.host, self.port)))?
            .next()
            .ok_or_else(|| Error::io(format!("no address for {}:{}", self.host, self.port)))
    }

    /// Drop the connection.
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Send one request and read the matching response.
    ///
    /// Returns the response type byte and payload. A device ERROR response
    /// surfaces as [`Error::Device`]; any transport failure drops the
    /// socket before returning.
    pub fn send(&mut self, type_byte: u8, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        self.connect()?;
        match self.exchange(type_byte, payload) {
            Ok(response) => Ok(response),
            Err(err) => {
                if err.is_link_failure() && !matches!(err, Error::Device { .. }) {
                    self.close();
                }
                Err(err)
            }
        }
    }

    fn exchange(&mut self, type_byte: u8, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        let frame = packet::build_packet(type_byte, payload)?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::closed("not connected"))?;
        stream.write_all(&frame)?;

        let mut header = [0u8; HEADER_LEN];
        read_exact(stream, &mut header)?;
        let resp_type = header[1];
        let resp_len = header[2] as usize;
        if resp_len > MAX_PAYLOAD {
            return Err(Error::framing(format!(
                "response length {resp_len} exceeds max {MAX_PAYLOAD}"
            )));
        }

        let mut resp_payload = vec![0u8; resp_len];
        read_exact(stream, &mut resp_payload)?;
        let mut crc = [0u8; 1];
        read_exact(stream, &mut crc)?;

        packet::validate_response(&header, &resp_payload, crc[0])?;

        if resp_type == msg::ERROR {
            return Err(packet::parse_device_error(&resp_payload));
        }
        Ok((resp_type, resp_payload))
    }

    fn expect_type(&mut self, request: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let (resp_type, resp_payload) = self.send(request, payload)?;
        if resp_type != request {
            return Err(Error::framing(format!(
                "unexpected response type 0x{resp_type:02X} to request 0x{request:02X}"
            )));
        }
        Ok(resp_payload)
    }

    // ─── Typed requests ─────────────────────────────────────────────

    /// Liveness check; the device answers with an empty PING response.
    pub fn ping(&mut self) -> Result<()> {
        let payload = self.expect_type(msg::PING, &[])?;
        if !payload.is_empty() {
            return Err(Error::framing(format!(
                "ping: unexpected payload length {}",
                payload.len()
            )));
        }
        Ok(())
    }

    /// Encoder snapshot for one winch.
    pub fn snapshot(&mut self, winch: WinchId) -> Result<SnapshotReading> {
        let payload = self.expect_type(msg::SNAPSHOT, &[winch])?;
        packet::parse_snapshot(winch, &payload)
    }

    /// Encoder delta for one winch.
    pub fn delta(&mut self, winch: WinchId) -> Result<DeltaReading> {
        let payload = self.expect_type(msg::DELTA, &[winch])?;
        packet::parse_delta(winch, &payload)
    }

    /// Global distance sensor.
    pub fn distance(&mut self) -> Result<DistanceReading> {
        let payload = self.expect_type(msg::DISTANCE, &[])?;
        packet::parse_distance(&payload)
    }

    /// Power telemetry for one winch.
    pub fn power(&mut self, winch: WinchId) -> Result<PowerReading> {
        let payload = self.expect_type(msg::POWER, &[winch])?;
        packet::parse_power(winch, &payload)
    }

    /// Aggregate bundle for one winch.
    pub fn bundle(&mut self, winch: WinchId) -> Result<BundleReading> {
        let payload = self.expect_type(msg::BUNDLE, &[winch])?;
        packet::parse_bundle(winch, &payload)
    }

    /// IMU reading.
    pub fn imu(&mut self) -> Result<ImuReading> {
        let payload = self.expect_type(msg::IMU, &[])?;
        packet::parse_imu(&payload)
    }
}

/// Read exactly `buf.len()` bytes, mapping timeouts and EOF to the
/// transport taxonomy.
fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::closed("connection closed by peer")),
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                return Err(Error::timeout("socket read timed out"));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
