//! PID battery charger
//!
//! Charging runs in three phases: constant current until the battery reaches
//! the target voltage, constant voltage until the current tapers to the
//! cutoff, then a standby trickle at the float voltage. The same PID loop
//! drives the PWM duty in every phase; only its setpoint changes.

use embedded_hal::digital::OutputPin;
use embedded_hal::pwm::SetDutyCycle;
use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::config::{ChargerConfig, PidGains};
use crate::hal::{drive, write_duty};
use crate::sensors::{SensorId, SensorSource};

/// Reported charger state, including the reasons charging cannot proceed
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargingMode {
    #[default]
    NotStarted,
    ByCc,
    ByCv,
    Complete,
    TargetNotSet,
    CurrentSensorNotSet,
    VoltageSensorNotSet,
    CurrentSensorNotReady,
    VoltageSensorNotReady,
    BatteryDead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Cc,
    Cv,
    Complete,
}

impl Phase {
    fn mode(self) -> ChargingMode {
        match self {
            Phase::Cc => ChargingMode::ByCc,
            Phase::Cv => ChargingMode::ByCv,
            Phase::Complete => ChargingMode::Complete,
        }
    }
}

pub struct ChargeController<P: SetDutyCycle, O: OutputPin> {
    config: ChargerConfig,
    pwm: P,
    enable: O,
    current_sensor: Option<SensorId>,
    voltage_sensor: Option<SensorId>,

    target_current: f32,
    target_voltage: f32,
    integral: f32,
    last_deviation: f32,
    last_tick: u32,
    output: u16,

    charging: bool,
    phase: Phase,
    mode: ChargingMode,
}

impl<P: SetDutyCycle, O: OutputPin> ChargeController<P, O> {
    /// Bind to the battery current and voltage sensors; starts disarmed
    pub fn new(config: ChargerConfig, pwm: P, enable: O) -> Self {
        let mut charger = Self {
            config,
            pwm,
            enable,
            current_sensor: Some(SensorId::BatteryCurrent),
            voltage_sensor: Some(SensorId::BatteryVoltage),
            target_current: 0.0,
            target_voltage: 0.0,
            integral: 0.0,
            last_deviation: 0.0,
            last_tick: 0,
            output: 0,
            charging: false,
            phase: Phase::Cc,
            mode: ChargingMode::NotStarted,
        };
        charger.disarm();
        charger
    }

    /// Rebind the sensors; `None` leaves the role unbound
    pub fn bind_sensors(&mut self, current: Option<SensorId>, voltage: Option<SensorId>) {
        self.current_sensor = current;
        self.voltage_sensor = voltage;
    }

    /// Arm with the given targets. Does nothing if already charging.
    ///
    /// Returns whether charging is now armed.
    pub fn start(&mut self, current: f32, voltage: f32, tick: u32) -> bool {
        if self.charging {
            return true;
        }
        self.set_current(current);
        self.set_voltage(voltage);
        if self.target_current <= 0.0 || self.target_voltage <= 0.0 {
            self.mode = ChargingMode::TargetNotSet;
            return false;
        }

        self.reset_pid();
        self.last_tick = tick;
        self.charging = true;
        self.phase = Phase::Cc;
        self.mode = ChargingMode::ByCc;
        drive(&mut self.enable, true, "charger enable");
        info!(
            "Charging started at {} A up to {} V",
            self.target_current, self.target_voltage
        );
        true
    }

    /// Disarm and forget the targets. A second call does nothing.
    pub fn stop(&mut self) {
        if !self.charging {
            return;
        }
        self.target_current = 0.0;
        self.disarm();
        self.mode = ChargingMode::NotStarted;
        info!("Charging stopped");
    }

    /// Set the constant-current target; a non-positive value disarms
    pub fn set_current(&mut self, target: f32) {
        if target <= 0.0 {
            self.target_current = 0.0;
            self.mode = ChargingMode::TargetNotSet;
            self.disarm();
            return;
        }
        self.target_current = target;
    }

    pub fn set_voltage(&mut self, target: f32) {
        self.target_voltage = target;
    }

    pub fn set_min_battery_voltage(&mut self, voltage: f32) {
        self.config.min_battery_voltage = voltage;
    }

    pub fn set_cutoff_current(&mut self, current: f32) {
        self.config.cutoff_current = current;
    }

    pub fn gains(&self) -> PidGains {
        self.config.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.config.gains = gains;
    }

    pub fn config(&self) -> &ChargerConfig {
        &self.config
    }

    pub fn mode(&self) -> ChargingMode {
        self.mode
    }

    pub fn is_charging(&self) -> bool {
        self.charging
    }

    /// Duty code last written to the PWM
    pub fn output(&self) -> u16 {
        self.output
    }

    /// Tick of the last PID step, or of `start`
    pub fn last_tick(&self) -> u32 {
        self.last_tick
    }

    pub fn target_current(&self) -> f32 {
        self.target_current
    }

    pub fn target_voltage(&self) -> f32 {
        self.target_voltage
    }

    /// Run one control step. May be called from interrupt context.
    pub fn regulate(&mut self, tick: u32, sensors: &dyn SensorSource) {
        if !self.charging {
            return;
        }
        let active = matches!(
            self.mode,
            ChargingMode::ByCc
                | ChargingMode::ByCv
                | ChargingMode::Complete
                | ChargingMode::CurrentSensorNotReady
                | ChargingMode::VoltageSensorNotReady
        );
        if !active {
            self.disarm();
            return;
        }
        if self.target_current <= 0.0 || self.target_voltage <= 0.0 {
            self.fail(ChargingMode::TargetNotSet);
            return;
        }

        let Some(current_sensor) = self.current_sensor.and_then(|id| sensors.sensor(id)) else {
            self.fail(ChargingMode::CurrentSensorNotSet);
            return;
        };
        let Some(voltage_sensor) = self.voltage_sensor.and_then(|id| sensors.sensor(id)) else {
            self.fail(ChargingMode::VoltageSensorNotSet);
            return;
        };
        if !current_sensor.ready() {
            self.mode = ChargingMode::CurrentSensorNotReady;
            return;
        }
        if !voltage_sensor.ready() {
            self.mode = ChargingMode::VoltageSensorNotReady;
            return;
        }

        let voltage = voltage_sensor.reading();
        let current = current_sensor.reading();

        let min_voltage = self.config.min_battery_voltage;
        if voltage <= min_voltage {
            warn!("Battery at {} V is below {} V, not charging", voltage, min_voltage);
            self.fail(ChargingMode::BatteryDead);
            return;
        }

        let charge_to_full = (self.target_voltage - voltage) / (self.target_voltage - min_voltage);
        if self.phase == Phase::Cc && charge_to_full < 0.0 {
            info!("Battery reached {} V, switching to constant voltage", voltage);
            self.phase = Phase::Cv;
        }
        if self.phase == Phase::Cv && current >= 0.0 && current <= self.config.cutoff_current {
            info!(
                "Charge current tapered to {} A, holding {} V",
                current, self.config.standby_voltage
            );
            self.phase = Phase::Complete;
            self.target_voltage = self.config.standby_voltage;
        }
        self.mode = self.phase.mode();

        let deviation = match self.phase {
            Phase::Cc => (self.target_current - current) / self.target_current,
            Phase::Cv | Phase::Complete => (self.target_voltage - voltage) / self.target_voltage,
        };

        // Fixed unit time step per control cycle
        let gains = self.config.gains;
        self.integral += deviation;
        let raw = libm::roundf(
            gains.kp * deviation
                + gains.ki * self.integral
                + gains.kd * (deviation - self.last_deviation)
                + gains.bias,
        );
        let duty = raw.clamp(0.0, f32::from(self.config.max_output)) as u16;
        self.output = write_duty(&mut self.pwm, duty, self.config.max_output);

        trace!(
            "Charger {:?}: {} V {} A dev {} out {}",
            self.mode, voltage, current, deviation, self.output
        );
        self.last_deviation = deviation;
        self.last_tick = tick;
    }

    fn fail(&mut self, mode: ChargingMode) {
        debug!("Charger refused: {:?}", mode);
        self.mode = mode;
        self.disarm();
    }

    fn reset_pid(&mut self) {
        self.integral = 0.0;
        self.last_deviation = 0.0;
    }

    fn disarm(&mut self) {
        self.charging = false;
        self.reset_pid();
        self.last_tick = 0;
        self.output = write_duty(&mut self.pwm, 0, self.config.max_output);
        drive(&mut self.enable, false, "charger enable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSensor, FakeSensors, MockPin, MockPwm};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Rig {
        charger: ChargeController<MockPwm, MockPin>,
        duty: Rc<Cell<u16>>,
        enable: Rc<Cell<bool>>,
        sensors: FakeSensors,
    }

    fn rig(gains: PidGains) -> Rig {
        let pwm = MockPwm::new(1023);
        let enable = MockPin::new();
        let duty = pwm.probe();
        let enable_probe = enable.probe();
        let config = ChargerConfig {
            gains,
            ..ChargerConfig::default()
        };
        Rig {
            charger: ChargeController::new(config, pwm, enable),
            duty,
            enable: enable_probe,
            sensors: FakeSensors::default()
                .with(SensorId::BatteryCurrent, FakeSensor::ready(0.5))
                .with(SensorId::BatteryVoltage, FakeSensor::ready(25.0)),
        }
    }

    fn p_only(kp: f32) -> PidGains {
        PidGains {
            kp,
            ki: 0.0,
            kd: 0.0,
            bias: 0.0,
        }
    }

    #[test]
    fn test_proportional_output() {
        let mut r = rig(p_only(400.0));
        assert!(r.charger.start(1.0, 28.8, 0));
        assert!(r.enable.get());

        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::ByCc);
        assert_eq!(r.charger.output(), 200);
        assert_eq!(r.duty.get(), 200);
    }

    #[test]
    fn test_output_is_clamped() {
        let mut r = rig(p_only(5000.0));
        r.charger.start(1.0, 28.8, 0);
        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.output(), 512);

        // Over target current drives the output negative
        r.sensors.set(SensorId::BatteryCurrent, 2.0);
        r.charger.regulate(2, &r.sensors);
        assert_eq!(r.charger.output(), 0);
    }

    #[test]
    fn test_pwm_maximum_wins_over_config() {
        let pwm = MockPwm::new(255);
        let duty = pwm.probe();
        let config = ChargerConfig {
            gains: p_only(5000.0),
            ..ChargerConfig::default()
        };
        let mut charger = ChargeController::new(config, pwm, MockPin::new());
        let sensors = FakeSensors::default()
            .with(SensorId::BatteryCurrent, FakeSensor::ready(0.0))
            .with(SensorId::BatteryVoltage, FakeSensor::ready(25.0));
        charger.start(1.0, 28.8, 0);
        charger.regulate(1, &sensors);
        assert_eq!(duty.get(), 255);
    }

    #[test]
    fn test_integral_and_derivative_terms() {
        let mut r = rig(PidGains {
            kp: 0.0,
            ki: 100.0,
            kd: 40.0,
            bias: 10.0,
        });
        r.charger.start(1.0, 28.8, 0);
        // dev 0.5: 100 * 0.5 + 40 * 0.5 + 10
        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.output(), 80);
        // dev 0.5 again: 100 * 1.0 + 0 + 10
        r.charger.regulate(2, &r.sensors);
        assert_eq!(r.charger.output(), 110);
    }

    #[test]
    fn test_set_current_zero_disarms() {
        let mut r = rig(PidGains::default());
        r.charger.set_current(0.0);
        assert_eq!(r.charger.mode(), ChargingMode::TargetNotSet);
        assert!(!r.charger.is_charging());

        r.charger.start(1.0, 28.8, 0);
        r.charger.set_current(0.0);
        assert_eq!(r.charger.mode(), ChargingMode::TargetNotSet);
        assert!(!r.charger.is_charging());
        assert!(!r.enable.get());
        assert_eq!(r.duty.get(), 0);
    }

    #[test]
    fn test_start_without_targets_is_refused() {
        let mut r = rig(PidGains::default());
        assert!(!r.charger.start(0.9, 0.0, 0));
        assert_eq!(r.charger.mode(), ChargingMode::TargetNotSet);
        assert!(!r.charger.is_charging());
    }

    #[test]
    fn test_start_while_charging_keeps_targets() {
        let mut r = rig(PidGains::default());
        r.charger.start(1.0, 28.8, 0);
        assert!(r.charger.start(2.0, 30.0, 5));
        assert_eq!(r.charger.target_current(), 1.0);
        assert_eq!(r.charger.target_voltage(), 28.8);
    }

    #[test]
    fn test_phase_transitions() {
        let mut r = rig(p_only(400.0));
        r.charger.start(1.0, 28.8, 0);
        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::ByCc);

        r.sensors.set(SensorId::BatteryVoltage, 28.9);
        r.charger.regulate(2, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::ByCv);

        r.sensors.set(SensorId::BatteryCurrent, 0.3);
        r.charger.regulate(3, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::Complete);
        assert_eq!(r.charger.target_voltage(), ChargerConfig::default().standby_voltage);
        assert!(r.charger.is_charging());
    }

    #[test]
    fn test_battery_dead() {
        let mut r = rig(PidGains::default());
        r.charger.start(1.0, 28.8, 0);
        r.sensors.set(SensorId::BatteryVoltage, 21.0);
        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::BatteryDead);
        assert!(!r.charger.is_charging());
        assert_eq!(r.duty.get(), 0);
    }

    #[test]
    fn test_not_ready_sensor_holds_and_retries() {
        let mut r = rig(p_only(400.0));
        r.sensors = FakeSensors::default()
            .with(
                SensorId::BatteryCurrent,
                FakeSensor {
                    ready: false,
                    ..FakeSensor::ready(0.5)
                },
            )
            .with(SensorId::BatteryVoltage, FakeSensor::ready(25.0));
        r.charger.start(1.0, 28.8, 0);
        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::CurrentSensorNotReady);
        assert!(r.charger.is_charging());

        r.sensors.slots[SensorId::BatteryCurrent as usize] = Some(FakeSensor::ready(0.5));
        r.charger.regulate(2, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::ByCc);
        assert_eq!(r.charger.output(), 200);
    }

    #[test]
    fn test_unbound_sensor() {
        let mut r = rig(PidGains::default());
        r.charger.bind_sensors(Some(SensorId::BatteryCurrent), None);
        r.charger.start(1.0, 28.8, 0);
        r.charger.regulate(1, &r.sensors);
        assert_eq!(r.charger.mode(), ChargingMode::VoltageSensorNotSet);
        assert!(!r.charger.is_charging());
    }

    #[test]
    fn test_stop_twice() {
        let mut r = rig(PidGains::default());
        r.charger.start(1.0, 28.8, 0);
        r.charger.regulate(1, &r.sensors);
        r.charger.stop();
        assert_eq!(r.charger.mode(), ChargingMode::NotStarted);
        assert!(!r.charger.is_charging());

        r.charger.stop();
        assert_eq!(r.charger.mode(), ChargingMode::NotStarted);
        assert_eq!(r.duty.get(), 0);
    }

    #[test]
    fn test_restart_zeroes_pid() {
        let mut r = rig(PidGains {
            kp: 0.0,
            ki: 100.0,
            kd: 0.0,
            bias: 0.0,
        });
        r.charger.start(1.0, 28.8, 0);
        r.charger.regulate(1, &r.sensors);
        r.charger.regulate(2, &r.sensors);
        assert_eq!(r.charger.output(), 100);

        r.charger.stop();
        r.charger.start(1.0, 28.8, 3);
        r.charger.regulate(4, &r.sensors);
        assert_eq!(r.charger.output(), 50);
    }
}
