//! # ArachnoNestor Hardware Access Layer
//!
//! Everything that touches a wire lives here:
//!
//! - [`crc`] - CRC-8 (sensor frames) and CRC-16/Modbus kernels
//! - [`packet`] - Length-prefixed sensor frame build/parse
//! - [`evb`] - Persistent TCP client for the sensor aggregator board
//! - [`modbus`] - Modbus-RTU frame construction and the drive register map
//! - [`motor`] - RS-485 motor bus with a pluggable port seam
//!
//! The two channels have exactly one owner each at runtime: the sensor
//! poller holds the TCP client, the motion supervisor holds the motor bus.

pub mod crc;
pub mod evb;
pub mod modbus;
pub mod motor;
pub mod packet;
