//! Bang-bang line regulator and UPS fault state machine
//!
//! The regulator compares the input RMS voltage against the nominal band and
//! selects one of three transformer taps (boost, buck or straight through)
//! with hysteresis. It owns every relay and the inverter enable, and records
//! its view of the world in the shared [`StatusRegister`].
//!
//! Transfer decisions (when to engage the inverter) are left to the caller:
//! [`LineRegulator::regulate`] only reports whether the mains is usable.

mod status;

pub use status::{StatusFlags, StatusRegister};

use embedded_hal::digital::OutputPin;
use log::{debug, info, warn};

use crate::config::RegulatorConfig;
use crate::error::ConfigError;
use crate::hal::{OutputPins, drive};
use crate::sensors::LineReadings;

/// Transformer tap selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegulateMode {
    /// Pass the input straight through
    #[default]
    None,
    /// Boost a low input
    Up,
    /// Buck a high input
    Down,
}

/// Outcome of one regulation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulateStatus {
    /// Sensors not ready or regulator disarmed; nothing was touched
    None,
    /// Mains is usable and the tap has been selected
    Success,
    /// Mains is unusable (or a self test runs); the input relay is open
    Fail,
    /// A latched fault blocks regulation until cold reset
    Error,
    /// Shutdown flag is set
    Shutdown,
    /// Shutdown flag was cleared since the previous cycle
    Wakeup,
}

pub struct LineRegulator<O: OutputPin> {
    config: RegulatorConfig,
    pins: OutputPins<O>,
    status: StatusRegister,
    mode: RegulateMode,
    armed: bool,
    battery_mode: bool,
    inverter_since: u32,
    self_test: bool,
    shutdown: bool,
    in_shutdown: bool,
    last_fail_tick: Option<u32>,
    last_tick: u32,
    last_fault_input_voltage: f32,
    battery_level: f32,
    load_level: f32,
}

impl<O: OutputPin> LineRegulator<O> {
    /// Take ownership of the outputs and drive them all inactive
    pub fn new(config: RegulatorConfig, pins: OutputPins<O>) -> Self {
        let mut regulator = Self {
            config,
            pins,
            status: StatusRegister::new(StatusFlags::LINE_INTERACTIVE | StatusFlags::BEEPER_ACTIVE),
            mode: RegulateMode::None,
            armed: true,
            battery_mode: false,
            inverter_since: 0,
            self_test: false,
            shutdown: false,
            in_shutdown: false,
            last_fail_tick: None,
            last_tick: 0,
            last_fault_input_voltage: 0.0,
            battery_level: 0.0,
            load_level: 0.0,
        };
        regulator.toggle_input(false);
        regulator.toggle_output(false);
        regulator.adjust_output(RegulateMode::None);
        drive(&mut regulator.pins.inverter, false, "inverter");
        drive(&mut regulator.pins.beeper, false, "beeper");
        regulator
    }

    pub fn config(&self) -> &RegulatorConfig {
        &self.config
    }

    /// Replace the thresholds; the status word and relays are kept
    pub fn set_config(&mut self, config: RegulatorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn status(&self) -> StatusFlags {
        self.status.get()
    }

    pub fn status_register(&self) -> &StatusRegister {
        &self.status
    }

    pub fn mode(&self) -> RegulateMode {
        self.mode
    }

    pub fn is_battery_mode(&self) -> bool {
        self.battery_mode
    }

    pub fn battery_level(&self) -> f32 {
        self.battery_level
    }

    pub fn load_level(&self) -> f32 {
        self.load_level
    }

    /// Input voltage seen when the mains last failed while on mains
    pub fn last_fault_input_voltage(&self) -> f32 {
        self.last_fault_input_voltage
    }

    /// Tick of the last cycle that saw ready sensors
    pub fn last_tick(&self) -> u32 {
        self.last_tick
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Stop regulating; the relays keep their current state
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Run one regulation cycle. May be called from interrupt context.
    pub fn regulate(&mut self, tick: u32, readings: &LineReadings) -> RegulateStatus {
        if !self.armed || !readings.ready {
            return RegulateStatus::None;
        }
        self.last_tick = tick;

        let cfg = self.config;
        let battery_window = cfg.max_battery_voltage - cfg.min_battery_voltage;
        self.battery_level =
            ((readings.battery_voltage - cfg.min_battery_voltage) / battery_window).clamp(0.0, 1.0);
        self.load_level = (readings.output_current / cfg.max_output_current).clamp(0.0, 1.0);

        let battery_low = self.battery_level < cfg.battery_low_level;
        if battery_low && self.self_test {
            warn!("Battery low, cancelling self test");
            self.self_test = false;
        }
        let battery_dead = readings.battery_voltage < cfg.min_battery_voltage;
        let overload = readings.output_current > cfg.max_output_current;

        let before = self.status.get();
        self.status.update(|s| {
            s.set(StatusFlags::SELF_TEST, self.self_test);
            s.set(StatusFlags::BATTERY_LOW, battery_low);
            s.set(
                StatusFlags::UNUSUAL,
                !s.contains(StatusFlags::OUTPUT_RELAY)
                    && readings.output_current > cfg.min_output_current,
            );
            if battery_dead {
                s.insert(StatusFlags::BATTERY_DEAD);
            }
            if overload {
                s.insert(StatusFlags::OVERLOAD);
            }
        });
        if battery_dead && !before.contains(StatusFlags::BATTERY_DEAD) {
            warn!("Battery dead at {} V", readings.battery_voltage);
        }
        if overload && !before.contains(StatusFlags::OVERLOAD) {
            warn!("Output overload at {} A", readings.output_current);
        }

        if self.shutdown {
            if !self.in_shutdown {
                info!("Shutdown active");
                self.in_shutdown = true;
                self.status.set(StatusFlags::SHUTDOWN_ACTIVE, true);
            }
            return RegulateStatus::Shutdown;
        }
        if self.in_shutdown {
            info!("Waking up from shutdown");
            self.in_shutdown = false;
            self.status.set(StatusFlags::SHUTDOWN_ACTIVE, false);
            return RegulateStatus::Wakeup;
        }

        let nominal = cfg.nominal_input_voltage;
        let nom_dev = cfg.nominal_deviation();
        let nom_hyst = cfg.nominal_hysteresis();

        if self.battery_mode {
            let out_dev = readings.output_voltage - nominal;
            // Undervoltage is tolerated while the inverter ramps up, overvoltage never
            let in_grace = tick.wrapping_sub(self.inverter_since) < cfg.inverter_grace_ticks;
            let out_of_band = out_dev > nom_dev || (-out_dev > nom_dev && !in_grace);
            if out_of_band && !self.status.contains(StatusFlags::UPS_FAULT) {
                warn!("Inverter output {} V out of band", readings.output_voltage);
                self.status.set(StatusFlags::UPS_FAULT, true);
            }
        }

        if self.status.get().intersects(StatusFlags::LATCHED) {
            return RegulateStatus::Error;
        }

        let input = readings.input_voltage;
        let abs_dev = libm::fabsf(nominal - input);
        let fail_sign = if self.battery_mode { 1.0 } else { -1.0 };
        let utility_fail = abs_dev > 2.0 * (nom_dev - nom_hyst * fail_sign);

        if utility_fail {
            if !self.status.contains(StatusFlags::UTILITY_FAIL) {
                warn!("Utility fail, input at {} V", input);
            }
            if self.self_test {
                info!("Self test interrupted by utility fail");
                self.self_test = false;
            }
            self.last_fail_tick = Some(tick);
            if !self.battery_mode {
                self.last_fault_input_voltage = input;
            }
            self.status.update(|s| {
                s.remove(StatusFlags::SELF_TEST);
                s.insert(StatusFlags::UTILITY_FAIL);
            });
        }

        let cooling_down = self
            .last_fail_tick
            .is_some_and(|t| tick.wrapping_sub(t) < cfg.fail_cooldown_ticks);

        if utility_fail || self.self_test || cooling_down {
            self.toggle_input(false);
            self.adjust_output(RegulateMode::None);
            return RegulateStatus::Fail;
        }

        self.status.set(StatusFlags::UTILITY_FAIL, false);

        let regulated = self.status.contains(StatusFlags::REGULATED);
        let band_sign = if regulated { 1.0 } else { -1.0 };
        let mode = if abs_dev > nom_dev - nom_hyst * band_sign {
            if input > nominal {
                RegulateMode::Down
            } else {
                RegulateMode::Up
            }
        } else {
            RegulateMode::None
        };
        self.adjust_output(mode);

        RegulateStatus::Success
    }

    /// Select a tap, releasing the other relay before energising the new one
    pub fn adjust_output(&mut self, mode: RegulateMode) {
        if mode != self.mode {
            debug!("Regulation {:?} -> {:?}", self.mode, mode);
        }
        match mode {
            RegulateMode::Up => {
                drive(&mut self.pins.step_down_relay, false, "step-down relay");
                drive(&mut self.pins.step_up_relay, true, "step-up relay");
            }
            RegulateMode::Down => {
                drive(&mut self.pins.step_up_relay, false, "step-up relay");
                drive(&mut self.pins.step_down_relay, true, "step-down relay");
            }
            RegulateMode::None => {
                drive(&mut self.pins.step_up_relay, false, "step-up relay");
                drive(&mut self.pins.step_down_relay, false, "step-down relay");
            }
        }
        self.mode = mode;
        self.status
            .set(StatusFlags::REGULATED, mode != RegulateMode::None);
    }

    pub fn toggle_input(&mut self, on: bool) {
        drive(&mut self.pins.input_relay, on, "input relay");
        self.status.set(StatusFlags::INPUT_RELAY, on);
    }

    pub fn toggle_output(&mut self, on: bool) {
        drive(&mut self.pins.output_relay, on, "output relay");
        self.status.set(StatusFlags::OUTPUT_RELAY, on);
    }

    /// Engage or release the inverter; `tick` starts the grace period
    pub fn toggle_inverter(&mut self, on: bool, tick: u32) {
        if on && !self.battery_mode {
            self.inverter_since = tick;
        }
        drive(&mut self.pins.inverter, on, "inverter");
        self.battery_mode = on;
    }

    pub fn set_beeper_output(&mut self, on: bool) {
        drive(&mut self.pins.beeper, on, "beeper");
    }

    /// Mute or unmute the beeper
    pub fn toggle_beeper(&mut self) {
        self.status.update(|s| s.toggle(StatusFlags::BEEPER_ACTIVE));
        if !self.status.contains(StatusFlags::BEEPER_ACTIVE) {
            self.set_beeper_output(false);
        }
    }

    pub fn beeper_active(&self) -> bool {
        self.status.contains(StatusFlags::BEEPER_ACTIVE)
    }

    /// Request a self test; refused below the configured battery level or
    /// with a latched fault
    pub fn start_self_test(&mut self) -> bool {
        if self.battery_level < self.config.self_test_min_level
            || self.status.get().intersects(StatusFlags::LATCHED)
        {
            return false;
        }
        if !self.self_test {
            info!("Self test started at battery level {}", self.battery_level);
        }
        self.self_test = true;
        true
    }

    pub fn stop_self_test(&mut self) {
        if self.self_test {
            info!("Self test stopped");
        }
        self.self_test = false;
    }

    pub fn self_test_active(&self) -> bool {
        self.self_test
    }

    /// Set or clear the shutdown flag, acted on by the next cycle
    pub fn set_shutdown(&mut self, on: bool) {
        self.shutdown = on;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }
}
