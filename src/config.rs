//! Compile-time defaults and runtime configuration records
//!
//! The constants describe the reference hardware (a 2 kVA, 2-cell 24 V
//! line-interactive unit with a 10-bit ADC). Every tunable value also lives in
//! one of the `serde` config structs below so it can be persisted through
//! [`Settings`](crate::settings::Settings).

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hal::channels;

/// Full-scale value of the 10-bit ADC
pub const ADC_MAX: u16 = 1023;
/// Raw zero reference of AC channels biased to mid-scale
pub const ADC_MIDSCALE: i32 = 512;

/// Rate of the hardware tick interrupt
pub const DEFAULT_TICK_RATE_HZ: u32 = 2000;
/// Ticks per control cycle (regulation, charging, timers)
pub const DEFAULT_CONTROL_DIVISOR: u32 = 100;
/// Control cycles forming one second
pub const CONTROL_CYCLES_PER_SEC: u32 = DEFAULT_TICK_RATE_HZ / DEFAULT_CONTROL_DIVISOR;

/// Upper bound of the charger duty code
pub const MAX_CHARGE_OUTPUT: u16 = 512;

pub const DEFAULT_INPUT_VOLTAGE: f32 = 220.0;
pub const DEFAULT_INPUT_DEVIATION: f32 = 0.08;
pub const DEFAULT_INPUT_HYSTERESIS: f32 = 0.02;
pub const DEFAULT_FREQUENCY_HZ: f32 = 50.0;
pub const MAX_MAINS_FREQUENCY_HZ: u32 = 70;

pub const MAX_AC_OUT: f32 = 4.0;
pub const MIN_AC_OUT: f32 = 0.1;

pub const NUM_CELLS: u8 = 2;
pub const MAX_V_BAT_CELL: f32 = 13.8;
pub const MIN_V_BAT_CELL: f32 = 10.5;
pub const FLOAT_V_BAT_CELL: f32 = 13.65;
pub const ABSORB_V_BAT_CELL: f32 = 14.4;
/// Battery cell capacity in Ah
pub const BATTERY_AH: f32 = 9.0;

/// Fully drained battery voltage
pub const MIN_V_BAT: f32 = MIN_V_BAT_CELL * NUM_CELLS as f32;
/// Fully charged battery voltage
pub const MAX_V_BAT: f32 = MAX_V_BAT_CELL * NUM_CELLS as f32;

pub const BATTERY_LOW_LEVEL: f32 = 0.1;
pub const SELF_TEST_MIN_BATTERY_LEVEL: f32 = 0.8;

/// Volts per raw count on the AC voltage channels
pub const VAC_SCALE: f32 = 0.78;
/// Amperes per raw count on the load current channel
pub const AC_CURRENT_SCALE: f32 = 0.02;
/// Volts per raw count on the battery voltage divider
pub const V_BAT_SCALE: f32 = 0.0293;
/// Amperes per raw count on the battery current shunt
pub const C_BAT_SCALE: f32 = 0.005;

/// Samples held by averaging sensors
pub const AVERAGE_WINDOW: usize = 30;
/// Mains periods held by True-RMS sensors
pub const RMS_PERIODS: usize = 10;

/// Top-level configuration of the control core
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct UpsConfig {
    pub tick_rate_hz: u32,
    /// Ticks between two control cycles
    pub control_divisor: u32,
    pub regulator: RegulatorConfig,
    pub charger: ChargerConfig,
    /// Beeper pattern while on battery, in control cycles
    pub beeper_period_cycles: u32,
    pub beeper_duration_cycles: u32,
    /// Default self-test length in control cycles
    pub self_test_cycles: u32,
}

impl Default for UpsConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            control_divisor: DEFAULT_CONTROL_DIVISOR,
            regulator: RegulatorConfig::default(),
            charger: ChargerConfig::default(),
            beeper_period_cycles: 10 * CONTROL_CYCLES_PER_SEC,
            beeper_duration_cycles: CONTROL_CYCLES_PER_SEC / 2,
            self_test_cycles: 60 * CONTROL_CYCLES_PER_SEC,
        }
    }
}

impl UpsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 || self.control_divisor == 0 {
            return Err(ConfigError::TickRate);
        }
        self.regulator.validate()?;
        self.charger.validate()
    }

    /// Convert a duration in seconds into ticks of this configuration
    pub const fn secs_to_ticks(&self, secs: u32) -> u32 {
        secs * self.tick_rate_hz
    }
}

/// Line regulator thresholds
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RegulatorConfig {
    pub nominal_input_voltage: f32,
    /// Allowed input deviation as a fraction of nominal
    pub deviation: f32,
    /// Hysteresis band as a fraction of nominal
    pub hysteresis: f32,
    pub min_battery_voltage: f32,
    pub max_battery_voltage: f32,
    /// Battery level below which `BATTERY_LOW` is raised
    pub battery_low_level: f32,
    /// Battery level required to begin a self test
    pub self_test_min_level: f32,
    /// Output current above which the overload fault latches
    pub max_output_current: f32,
    /// Output current treated as "a load is present"
    pub min_output_current: f32,
    /// Ticks after engaging the inverter during which its output is not checked
    pub inverter_grace_ticks: u32,
    /// Ticks after a utility failure before the input is reconnected
    pub fail_cooldown_ticks: u32,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            nominal_input_voltage: DEFAULT_INPUT_VOLTAGE,
            deviation: DEFAULT_INPUT_DEVIATION,
            hysteresis: DEFAULT_INPUT_HYSTERESIS,
            min_battery_voltage: MIN_V_BAT,
            max_battery_voltage: MAX_V_BAT,
            battery_low_level: BATTERY_LOW_LEVEL,
            self_test_min_level: SELF_TEST_MIN_BATTERY_LEVEL,
            max_output_current: MAX_AC_OUT,
            min_output_current: MIN_AC_OUT,
            inverter_grace_ticks: DEFAULT_TICK_RATE_HZ / 2,
            fail_cooldown_ticks: 2 * DEFAULT_TICK_RATE_HZ,
        }
    }
}

impl RegulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.nominal_input_voltage > 0.0) {
            return Err(ConfigError::NominalVoltage(self.nominal_input_voltage));
        }
        let band_ok = self.deviation > 0.0
            && self.deviation < 1.0
            && self.hysteresis >= 0.0
            && self.hysteresis < self.deviation;
        if !band_ok {
            return Err(ConfigError::Band {
                deviation: self.deviation,
                hysteresis: self.hysteresis,
            });
        }
        if !(self.max_battery_voltage > self.min_battery_voltage) {
            return Err(ConfigError::BatteryWindow {
                min: self.min_battery_voltage,
                max: self.max_battery_voltage,
            });
        }
        if !(self.max_output_current > self.min_output_current) {
            return Err(ConfigError::OutputCurrent {
                min: self.min_output_current,
                max: self.max_output_current,
            });
        }
        Ok(())
    }

    /// Allowed deviation in volts
    pub fn nominal_deviation(&self) -> f32 {
        self.deviation * self.nominal_input_voltage
    }

    /// Hysteresis band in volts
    pub fn nominal_hysteresis(&self) -> f32 {
        self.hysteresis * self.nominal_input_voltage
    }
}

/// PID gains of the charge controller
///
/// Persisted as four `f32` parameters in the order `kp, ki, kd, bias`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub bias: f32,
}

impl PidGains {
    pub const PARAM_COUNT: usize = 4;

    pub const fn to_params(self) -> [f32; Self::PARAM_COUNT] {
        [self.kp, self.ki, self.kd, self.bias]
    }

    pub const fn from_params(params: [f32; Self::PARAM_COUNT]) -> Self {
        Self {
            kp: params[0],
            ki: params[1],
            kd: params[2],
            bias: params[3],
        }
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 250.0,
            ki: 0.02,
            kd: 50.0,
            bias: 0.0,
        }
    }
}

/// Battery charger limits and targets
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ChargerConfig {
    pub gains: PidGains,
    /// Battery voltage at or below which charging is refused
    pub min_battery_voltage: f32,
    /// Current that ends the constant-voltage phase
    pub cutoff_current: f32,
    /// Trickle voltage held once charging is complete
    pub standby_voltage: f32,
    /// Upper clamp of the duty code
    pub max_output: u16,
    /// Targets used when the orchestrator starts charging on its own
    pub target_current: f32,
    pub target_voltage: f32,
    /// Start charging automatically whenever the unit runs from mains
    pub auto_start: bool,
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            gains: PidGains::default(),
            min_battery_voltage: MIN_V_BAT,
            cutoff_current: 0.05 * BATTERY_AH,
            standby_voltage: FLOAT_V_BAT_CELL * NUM_CELLS as f32,
            max_output: MAX_CHARGE_OUTPUT,
            target_current: 0.1 * BATTERY_AH,
            target_voltage: ABSORB_V_BAT_CELL * NUM_CELLS as f32,
            auto_start: true,
        }
    }
}

impl ChargerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.standby_voltage > 0.0) {
            return Err(ConfigError::StandbyVoltage(self.standby_voltage));
        }
        if self.max_output == 0 {
            return Err(ConfigError::OutputLimit);
        }
        Ok(())
    }
}

/// Affine transform from raw ADC counts to physical units
///
/// Persisted as two `f32` parameters in the order `offset, scale`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SensorParams {
    pub scale: f32,
    pub offset: f32,
}

impl SensorParams {
    pub const PARAM_COUNT: usize = 2;

    pub const fn new(scale: f32, offset: f32) -> Self {
        Self { scale, offset }
    }

    pub const fn to_params(self) -> [f32; Self::PARAM_COUNT] {
        [self.offset, self.scale]
    }

    pub const fn from_params(params: [f32; Self::PARAM_COUNT]) -> Self {
        Self {
            offset: params[0],
            scale: params[1],
        }
    }
}

impl Default for SensorParams {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Average,
    TrueRms,
}

/// Static description of one analog channel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SensorConfig {
    pub channel: u8,
    pub kind: SensorKind,
    pub sampling: SamplingConfig,
    pub params: SensorParams,
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampling.validate()
    }
}

/// Sensor layout of the reference board, indexed by
/// [`SensorId`](crate::sensors::SensorId)
pub const fn board_sensors() -> [SensorConfig; 5] {
    const fn ac(channel: u8, scale: f32) -> SensorConfig {
        SensorConfig {
            channel,
            kind: SensorKind::TrueRms,
            sampling: SamplingConfig {
                period: 1,
                phase: 0,
            },
            params: SensorParams::new(scale, 0.0),
        }
    }
    // DC channels share one sample slot out of every four ticks
    const fn dc(channel: u8, scale: f32, phase: u16) -> SensorConfig {
        SensorConfig {
            channel,
            kind: SensorKind::Average,
            sampling: SamplingConfig { period: 4, phase },
            params: SensorParams::new(scale, 0.0),
        }
    }
    [
        ac(channels::INPUT_VAC, VAC_SCALE),
        ac(channels::OUTPUT_VAC, VAC_SCALE),
        ac(channels::OUTPUT_CURRENT, AC_CURRENT_SCALE),
        dc(channels::BATTERY_VOLTAGE, V_BAT_SCALE, 1),
        dc(channels::BATTERY_CURRENT, C_BAT_SCALE, 3),
    ]
}

/// Rate divisor shared by both sensor variants
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    /// Sample every `period` ticks
    pub period: u16,
    /// Tick offset within the period, so channels can be interleaved
    pub phase: u16,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period: 1,
            phase: 0,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period == 0 || self.phase >= self.period {
            return Err(ConfigError::SamplingPeriod);
        }
        Ok(())
    }

    /// Whether a sample is taken on `tick`
    pub fn is_due(&self, tick: u32) -> bool {
        tick % u32::from(self.period.max(1)) == u32::from(self.phase)
    }
}

/// Period detection limits of a True-RMS sensor
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RmsConfig {
    pub tick_rate_hz: u32,
    /// Raw samples forming one signal-presence window
    pub window_samples: u32,
    /// More periods than this inside one window means noise, not mains
    pub max_periods: u32,
    /// Sine sanity tolerance as a fraction of the amplitude, `None` disables it
    pub sine_tolerance: Option<f32>,
    /// Fraction of out-of-tolerance samples that marks a window as bad
    pub max_bad_ratio: f32,
}

impl RmsConfig {
    /// Quarter-second presence window sized for 40–70 Hz mains
    pub const fn for_mains(tick_rate_hz: u32, sampling_period: u16) -> Self {
        let samples_per_sec = tick_rate_hz / sampling_period as u32;
        let window_samples = samples_per_sec / 4;
        Self {
            tick_rate_hz,
            window_samples,
            max_periods: window_samples * MAX_MAINS_FREQUENCY_HZ / samples_per_sec,
            sine_tolerance: Some(0.25),
            max_bad_ratio: 0.1,
        }
    }
}

impl Default for RmsConfig {
    fn default() -> Self {
        Self::for_mains(DEFAULT_TICK_RATE_HZ, 1)
    }
}
