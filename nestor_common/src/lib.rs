//! ArachnoNestor Common Library
//!
//! Shared types, configuration loading and the unified error surface for
//! the ArachnoNestor supervisory controller workspace.
//!
//! # Module Structure
//!
//! - [`types`] - Domain types: winches, modes, directions, sensor readings
//! - [`config`] - Configuration loading traits and types
//! - [`error`] - Unified error taxonomy
//! - [`prelude`] - Common re-exports for convenience

pub mod config;
pub mod error;
pub mod prelude;
pub mod types;
