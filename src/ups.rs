//! The UPS as a whole: sensors, regulator, charger and timers behind one tick
//!
//! Platform glue calls [`Ups::on_tick`] from the periodic timer interrupt
//! with a monotonically increasing tick. Every tick samples the sensors;
//! every `control_divisor` ticks a control cycle runs the timers, the line
//! regulator, the transfer policy and the charger, in that order.
//!
//! The protocol and display layers read [`Ups::snapshot`] and issue commands
//! through the methods below. Nothing here blocks or allocates.

use embedded_hal::digital::OutputPin;
use embedded_hal::pwm::SetDutyCycle;
use log::{info, warn};
use serde::Serialize;

use crate::charger::{ChargeController, ChargingMode};
use crate::config::{SensorParams, UpsConfig};
use crate::error::{ConfigError, IdleError, SettingsError};
use crate::hal::{AnalogInput, IdleControl, OutputPins, WatchdogTimeout};
use crate::idle::low_power_idle;
use crate::regulator::{LineRegulator, RegulateStatus, StatusFlags};
use crate::sensors::{LineReadings, SensorBank, SensorId, SignalSensor};
use crate::settings::{LoadOutcome, Settings, SettingsStore};
use crate::timer::{TimerEvent, TimerId, TimerManager};

/// Point-in-time view for the protocol and display layers
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct UpsSnapshot {
    pub status: StatusFlags,
    pub input_voltage: f32,
    pub input_frequency: f32,
    pub last_fault_input_voltage: f32,
    pub output_voltage: f32,
    pub output_frequency: f32,
    /// Output load as a fraction of the rated current
    pub load_level: f32,
    pub battery_voltage: f32,
    pub battery_level: f32,
    pub battery_current: f32,
    pub charging_mode: ChargingMode,
    pub charger_duty: u16,
}

pub struct Ups<A, O, P>
where
    A: AnalogInput,
    O: OutputPin,
    P: SetDutyCycle,
{
    config: UpsConfig,
    sensors: SensorBank<A>,
    regulator: LineRegulator<O>,
    charger: ChargeController<P, O>,
    timers: TimerManager,
    beeper_timer: TimerId,
    self_test_timer: TimerId,
    shutdown_timer: TimerId,
    /// Restore delay of the pending shutdown, 0 for none
    restore_cycles: u32,
    last_status: RegulateStatus,
    tick: u32,
}

impl<A, O, P> Ups<A, O, P>
where
    A: AnalogInput,
    O: OutputPin,
    P: SetDutyCycle,
{
    pub fn new(
        config: UpsConfig,
        sensors: SensorBank<A>,
        pins: OutputPins<O>,
        charger_pwm: P,
        charger_enable: O,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut timers = TimerManager::new();
        let beeper_timer = timers.create(
            config.beeper_period_cycles,
            config.beeper_duration_cycles,
            false,
        )?;
        let self_test_timer = timers.create(0, config.self_test_cycles, false)?;
        let shutdown_timer = timers.create(0, 0, false)?;

        let mut regulator = LineRegulator::new(config.regulator, pins);
        regulator.toggle_output(true);
        let charger = ChargeController::new(config.charger, charger_pwm, charger_enable);

        Ok(Self {
            config,
            sensors,
            regulator,
            charger,
            timers,
            beeper_timer,
            self_test_timer,
            shutdown_timer,
            restore_cycles: 0,
            last_status: RegulateStatus::None,
            tick: 0,
        })
    }

    /// Advance by one hardware tick. May be called from interrupt context.
    ///
    /// Returns the regulation outcome on control cycles.
    pub fn on_tick(&mut self, tick: u32) -> Option<RegulateStatus> {
        self.tick = tick;
        self.sensors.sample_all(tick);
        if tick % self.config.control_divisor != 0 {
            return None;
        }
        Some(self.control_cycle(tick))
    }

    fn control_cycle(&mut self, tick: u32) -> RegulateStatus {
        for (id, event) in self.timers.tick() {
            self.on_timer(id, event);
        }

        let readings = LineReadings::from_sensors(&self.sensors);
        let status = self.regulator.regulate(tick, &readings);
        self.apply_transfer(status, tick);
        self.charger.regulate(tick, &self.sensors);

        if !self.regulator.beeper_active() {
            self.stop_beeping();
        }
        self.last_status = status;
        status
    }

    fn on_timer(&mut self, id: TimerId, event: TimerEvent) {
        if id == self.beeper_timer {
            let on = event == TimerEvent::Started && self.regulator.beeper_active();
            self.regulator.set_beeper_output(on);
        } else if id == self.self_test_timer {
            if event == TimerEvent::Finished {
                self.regulator.stop_self_test();
            }
        } else if id == self.shutdown_timer {
            match event {
                TimerEvent::Started => {
                    self.regulator.set_shutdown(true);
                    if self.restore_cycles == 0 {
                        self.stop_timer(self.shutdown_timer);
                    }
                }
                TimerEvent::Finished => {
                    self.regulator.set_shutdown(false);
                    self.stop_timer(self.shutdown_timer);
                }
            }
        }
    }

    fn apply_transfer(&mut self, status: RegulateStatus, tick: u32) {
        match status {
            RegulateStatus::Fail => {
                if !self.regulator.is_battery_mode() {
                    info!("Transferring load to battery");
                    self.charger.stop();
                    self.regulator.toggle_inverter(true, tick);
                    if self.regulator.beeper_active() {
                        self.start_timer(self.beeper_timer);
                    }
                }
            }
            RegulateStatus::Success => {
                if self.regulator.is_battery_mode() {
                    info!("Mains restored, transferring load back");
                    self.regulator.toggle_inverter(false, tick);
                    self.stop_beeping();
                }
                if !self.regulator.status().contains(StatusFlags::INPUT_RELAY) {
                    self.regulator.toggle_input(true);
                }
                if self.config.charger.auto_start && self.charger.mode() == ChargingMode::NotStarted {
                    let charger = self.config.charger;
                    self.charger
                        .start(charger.target_current, charger.target_voltage, tick);
                }
            }
            RegulateStatus::Error => {
                if self.last_status != RegulateStatus::Error {
                    warn!("Latched fault {:#06x}, output disabled", self.regulator.status().bits());
                }
                self.charger.stop();
                if self.regulator.is_battery_mode() {
                    self.regulator.toggle_inverter(false, tick);
                }
                self.regulator.toggle_output(false);
                self.stop_beeping();
            }
            RegulateStatus::Shutdown => {
                if self.regulator.status().contains(StatusFlags::OUTPUT_RELAY) {
                    self.regulator.toggle_output(false);
                }
                if self.regulator.is_battery_mode() {
                    self.regulator.toggle_inverter(false, tick);
                    self.stop_beeping();
                }
            }
            RegulateStatus::Wakeup => {
                self.regulator.toggle_output(true);
            }
            RegulateStatus::None => {}
        }
    }

    fn start_timer(&mut self, id: TimerId) {
        if let Ok(timer) = self.timers.get_mut(id) {
            timer.start();
        }
    }

    fn stop_timer(&mut self, id: TimerId) {
        if let Ok(timer) = self.timers.get_mut(id) {
            timer.stop();
        }
    }

    fn stop_beeping(&mut self) {
        self.stop_timer(self.beeper_timer);
        self.regulator.set_beeper_output(false);
    }

    /// Control cycles per second under the active configuration
    pub fn cycles_per_sec(&self) -> u32 {
        self.config.tick_rate_hz / self.config.control_divisor
    }

    pub fn start_charging(&mut self, current: f32, voltage: f32) -> bool {
        self.charger.start(current, voltage, self.tick)
    }

    pub fn stop_charging(&mut self) {
        self.charger.stop();
    }

    /// Start a self test for `cycles` control cycles, or the configured
    /// default. Refused while the battery is below the self-test level.
    pub fn start_self_test(&mut self, cycles: Option<u32>) -> bool {
        if !self.regulator.start_self_test() {
            return false;
        }
        let duration = cycles.unwrap_or(self.config.self_test_cycles);
        if let Ok(timer) = self.timers.get_mut(self.self_test_timer) {
            timer.start_with(0, duration);
        }
        true
    }

    pub fn stop_self_test(&mut self) {
        self.stop_timer(self.self_test_timer);
        self.regulator.stop_self_test();
    }

    /// Turn the output off after `delay_secs` and back on `restore_secs`
    /// later; a zero restore keeps it off until [`cancel_shutdown`](Self::cancel_shutdown)
    pub fn schedule_shutdown(&mut self, delay_secs: u32, restore_secs: u32) {
        let per_sec = self.cycles_per_sec();
        self.restore_cycles = restore_secs * per_sec;
        info!(
            "Shutdown in {} s, restore after {} s",
            delay_secs, restore_secs
        );
        let restore_cycles = self.restore_cycles;
        if let Ok(timer) = self.timers.get_mut(self.shutdown_timer) {
            timer.start_with(delay_secs * per_sec, restore_cycles);
        }
    }

    pub fn cancel_shutdown(&mut self) {
        self.stop_timer(self.shutdown_timer);
        self.restore_cycles = 0;
        self.regulator.set_shutdown(false);
    }

    /// Mute or unmute the beeper
    pub fn toggle_beeper(&mut self) {
        self.regulator.toggle_beeper();
    }

    /// Stop line regulation; required before [`idle`](Self::idle)
    pub fn disarm_regulation(&mut self) {
        self.regulator.disarm();
    }

    pub fn arm_regulation(&mut self) {
        self.regulator.arm();
    }

    /// Sleep for `cycles` watchdog periods; refused while charging or regulating
    pub fn idle<C: IdleControl + ?Sized>(
        &mut self,
        ctl: &mut C,
        cycles: u16,
        timeout: WatchdogTimeout,
    ) -> Result<u32, IdleError> {
        if self.charger.is_charging() {
            return Err(IdleError::Charging);
        }
        if self.regulator.is_armed() {
            return Err(IdleError::Regulating);
        }
        Ok(low_power_idle(ctl, cycles, timeout))
    }

    /// Apply persisted calibration, gains and thresholds
    ///
    /// Blocks that fail to decode are rewritten with the values currently in
    /// use.
    pub fn load_settings<S: SettingsStore>(&mut self, settings: &mut Settings<S>) -> Result<(), SettingsError> {
        let mut params = self.sensors.params();
        if settings.load_sensor_params(&mut params)? == LoadOutcome::Loaded {
            self.sensors.set_params(&params);
        }

        let mut gains = self.charger.gains();
        settings.load_gains(&mut gains)?;
        self.charger.set_gains(gains);
        self.config.charger.gains = gains;

        let mut regulator = *self.regulator.config();
        if settings.load_regulator(&mut regulator)? == LoadOutcome::Loaded {
            // Stored blocks are validated on load
            if self.regulator.set_config(regulator).is_ok() {
                self.config.regulator = regulator;
            }
        }
        Ok(())
    }

    pub fn save_settings<S: SettingsStore>(&self, settings: &mut Settings<S>) -> Result<(), SettingsError> {
        settings.save_sensor_params(&self.sensors.params())?;
        settings.save_gains(&self.charger.gains())?;
        settings.save_regulator(self.regulator.config())
    }

    /// Retune one sensor; takes effect on its next window
    pub fn set_sensor_params(&mut self, id: SensorId, params: SensorParams) {
        self.sensors.get_mut(id).set_params(params);
    }

    pub fn snapshot(&self) -> UpsSnapshot {
        let input = self.sensors.get(SensorId::InputVac);
        let output = self.sensors.get(SensorId::OutputVac);
        UpsSnapshot {
            status: self.regulator.status(),
            input_voltage: input.reading(),
            input_frequency: input.frequency().unwrap_or_default(),
            last_fault_input_voltage: self.regulator.last_fault_input_voltage(),
            output_voltage: output.reading(),
            output_frequency: output.frequency().unwrap_or_default(),
            load_level: self.regulator.load_level(),
            battery_voltage: self.sensors.reading(SensorId::BatteryVoltage),
            battery_level: self.regulator.battery_level(),
            battery_current: self.sensors.reading(SensorId::BatteryCurrent),
            charging_mode: self.charger.mode(),
            charger_duty: self.charger.output(),
        }
    }

    pub fn config(&self) -> &UpsConfig {
        &self.config
    }

    pub fn last_status(&self) -> RegulateStatus {
        self.last_status
    }

    pub fn sensors(&self) -> &SensorBank<A> {
        &self.sensors
    }

    pub fn sensors_mut(&mut self) -> &mut SensorBank<A> {
        &mut self.sensors
    }

    pub fn regulator(&self) -> &LineRegulator<O> {
        &self.regulator
    }

    pub fn charger(&self) -> &ChargeController<P, O> {
        &self.charger
    }
}
