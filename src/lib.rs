//! Hardware-independent control core for a line-interactive UPS
//!
//! This crate contains all platform-agnostic logic of the UPS firmware: True-RMS
//! and averaging signal sensors, the tap-relay line regulator with its status
//! register, the PID battery charger, tick-counted timers and the settings
//! block layout. Platform glue provides the capabilities in [`hal`] and calls
//! [`ups::Ups::on_tick`] from the periodic timer interrupt.
//!
//! It is `#![no_std]` and never allocates, so it compiles on small embedded
//! targets and on desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

pub mod charger;
pub mod config;
pub mod error;
pub mod hal;
pub mod idle;
pub mod regulator;
pub mod sensors;
pub mod settings;
pub mod timer;
pub mod ups;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ConfigError, IdleError, SettingsError, TimerError};
pub use ups::{Ups, UpsSnapshot};
