//! Error types for the fallible, non-control-path operations
//!
//! The tick loop itself never returns these: regulation and charging report
//! their outcome through [`RegulateStatus`](crate::regulator::RegulateStatus)
//! and [`ChargingMode`](crate::charger::ChargingMode).

use thiserror_no_std::Error;

use crate::settings::BlockId;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    #[error("access of {len} bytes at {addr} exceeds store capacity {capacity}")]
    OutOfRange {
        addr: usize,
        len: usize,
        capacity: usize,
    },
    #[error("block {0:?} does not fit the record buffer")]
    BlockTooLarge(BlockId),
    #[error("failed to encode block {0:?}")]
    Encode(BlockId),
    #[error("failed to decode block {0:?}")]
    Decode(BlockId),
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    #[error("nominal input voltage must be positive, got {0}")]
    NominalVoltage(f32),
    #[error("hysteresis {hysteresis} must be below deviation {deviation}, both in (0, 1)")]
    Band { deviation: f32, hysteresis: f32 },
    #[error("battery window [{min}, {max}] is empty")]
    BatteryWindow { min: f32, max: f32 },
    #[error("output current limits [{min}, {max}] are inverted")]
    OutputCurrent { min: f32, max: f32 },
    #[error("charger standby voltage {0} must be positive")]
    StandbyVoltage(f32),
    #[error("charger output limit must be non-zero")]
    OutputLimit,
    #[error("tick rate and control divisor must be non-zero")]
    TickRate,
    #[error("sampling period must be non-zero and exceed the phase")]
    SamplingPeriod,
    #[error("timer table too small: {0}")]
    Timers(#[from] TimerError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer table is full")]
    Full,
    #[error("unknown timer id {0}")]
    UnknownTimer(usize),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleError {
    #[error("cannot idle while the battery is charging")]
    Charging,
    #[error("cannot idle while line regulation is armed")]
    Regulating,
}
