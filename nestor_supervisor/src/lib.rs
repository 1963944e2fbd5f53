//! # ArachnoNestor Motion Supervisor Library
//!
//! Concurrent supervisory controller for a four-winch cable robot.
//! Continuously polls the sensor aggregator, enforces safety invariants,
//! arbitrates mode transitions, schedules bounded motion jobs, translates
//! directional intents into per-motor Modbus commands and guarantees that
//! every failure converges to a motors-stopped FAULT state.
//!
//! ## Threads
//!
//! 1. One long-lived sensor poll worker ([`poller`])
//! 2. At most one motion job worker at a time ([`jobs`])
//! 3. Short-lived request workers from the HTTP adapter ([`api`])
//!
//! All shared state lives behind a single supervisor mutex; bus and
//! socket I/O always happen outside it.

pub mod api;
pub mod balance;
pub mod jobs;
pub mod mapper;
pub mod pid;
pub mod poller;
pub mod safety;
pub mod supervisor;
