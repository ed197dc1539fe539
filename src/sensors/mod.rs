//! Analog signal estimators and the bank that owns them
//!
//! Two estimators exist: [`AverageSensor`] for DC channels and [`RmsSensor`]
//! for mains-frequency AC channels. Both are folded into the tagged [`Sensor`]
//! enum so the [`SensorBank`] can hold them in a fixed array addressed by
//! [`SensorId`], with no trait objects stored anywhere.

mod average;
mod rms;
mod sine;

pub use average::AverageSensor;
pub use rms::RmsSensor;

pub use crate::config::SensorParams;
use crate::config::{AVERAGE_WINDOW, RMS_PERIODS, RmsConfig, SensorConfig, SensorKind};
use crate::hal::AnalogInput;

/// Common contract of every signal estimator
///
/// All methods may be called from interrupt context.
pub trait SignalSensor {
    /// Take one sample if the channel's divisor has elapsed on `tick`
    fn sample(&mut self, tick: u32, adc: &mut dyn AnalogInput);

    /// Latest value in physical units
    fn reading(&self) -> f32;

    /// Signal frequency in Hz, for estimators that track one
    fn frequency(&self) -> Option<f32> {
        None
    }

    /// Whether a full window has been observed since the last reset
    fn ready(&self) -> bool;

    fn params(&self) -> SensorParams;

    fn set_params(&mut self, params: SensorParams);

    fn reset(&mut self);

    fn channel(&self) -> u8;
}

/// Slot of each sensor in the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    InputVac = 0,
    OutputVac = 1,
    OutputCurrent = 2,
    BatteryVoltage = 3,
    BatteryCurrent = 4,
}

impl SensorId {
    pub const COUNT: usize = 5;

    pub const ALL: [SensorId; Self::COUNT] = [
        SensorId::InputVac,
        SensorId::OutputVac,
        SensorId::OutputCurrent,
        SensorId::BatteryVoltage,
        SensorId::BatteryCurrent,
    ];
}

/// Read-only lookup of sensors by id
pub trait SensorSource {
    fn sensor(&self, id: SensorId) -> Option<&dyn SignalSensor>;
}

/// Either estimator, stored inline
#[derive(Debug, Clone)]
pub enum Sensor {
    Average(AverageSensor<AVERAGE_WINDOW>),
    TrueRms(RmsSensor<RMS_PERIODS>),
}

impl Sensor {
    pub fn from_config(config: &SensorConfig, tick_rate_hz: u32) -> Self {
        match config.kind {
            SensorKind::Average => Sensor::Average(AverageSensor::new(
                config.channel,
                config.sampling,
                config.params,
            )),
            SensorKind::TrueRms => Sensor::TrueRms(RmsSensor::new(
                config.channel,
                config.sampling,
                config.params,
                RmsConfig::for_mains(tick_rate_hz, config.sampling.period.max(1)),
            )),
        }
    }

    fn inner(&self) -> &dyn SignalSensor {
        match self {
            Sensor::Average(s) => s,
            Sensor::TrueRms(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn SignalSensor {
        match self {
            Sensor::Average(s) => s,
            Sensor::TrueRms(s) => s,
        }
    }
}

impl SignalSensor for Sensor {
    fn sample(&mut self, tick: u32, adc: &mut dyn AnalogInput) {
        self.inner_mut().sample(tick, adc);
    }

    fn reading(&self) -> f32 {
        self.inner().reading()
    }

    fn frequency(&self) -> Option<f32> {
        self.inner().frequency()
    }

    fn ready(&self) -> bool {
        self.inner().ready()
    }

    fn params(&self) -> SensorParams {
        self.inner().params()
    }

    fn set_params(&mut self, params: SensorParams) {
        self.inner_mut().set_params(params);
    }

    fn reset(&mut self) {
        self.inner_mut().reset();
    }

    fn channel(&self) -> u8 {
        self.inner().channel()
    }
}

/// Owns the ADC and every sensor of the board
pub struct SensorBank<A: AnalogInput> {
    adc: A,
    sensors: [Sensor; SensorId::COUNT],
}

impl<A: AnalogInput> SensorBank<A> {
    /// Build the bank from one config per [`SensorId`], in id order
    pub fn new(adc: A, configs: &[SensorConfig; SensorId::COUNT], tick_rate_hz: u32) -> Self {
        Self {
            adc,
            sensors: configs.each_ref().map(|c| Sensor::from_config(c, tick_rate_hz)),
        }
    }

    /// Offer `tick` to every sensor; each one applies its own divisor
    pub fn sample_all(&mut self, tick: u32) {
        for sensor in self.sensors.iter_mut() {
            sensor.sample(tick, &mut self.adc);
        }
    }

    pub fn get(&self, id: SensorId) -> &Sensor {
        &self.sensors[id as usize]
    }

    pub fn get_mut(&mut self, id: SensorId) -> &mut Sensor {
        &mut self.sensors[id as usize]
    }

    pub fn reading(&self, id: SensorId) -> f32 {
        self.get(id).reading()
    }

    pub fn all_ready(&self) -> bool {
        self.sensors.iter().all(|s| s.ready())
    }

    /// Current scale/offset of every sensor, in id order
    pub fn params(&self) -> [SensorParams; SensorId::COUNT] {
        self.sensors.each_ref().map(|s| s.params())
    }

    pub fn set_params(&mut self, params: &[SensorParams; SensorId::COUNT]) {
        for (sensor, p) in self.sensors.iter_mut().zip(params) {
            sensor.set_params(*p);
        }
    }

    pub fn reset_all(&mut self) {
        for sensor in self.sensors.iter_mut() {
            sensor.reset();
        }
    }

    pub fn adc_mut(&mut self) -> &mut A {
        &mut self.adc
    }
}

impl<A: AnalogInput> SensorSource for SensorBank<A> {
    fn sensor(&self, id: SensorId) -> Option<&dyn SignalSensor> {
        Some(self.get(id))
    }
}

/// Snapshot of the values the line regulator consumes in one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineReadings {
    pub input_voltage: f32,
    pub output_voltage: f32,
    pub output_current: f32,
    pub battery_voltage: f32,
    /// False until every contributing sensor has filled its window
    pub ready: bool,
}

impl LineReadings {
    pub fn from_sensors(sensors: &dyn SensorSource) -> Self {
        let mut ready = true;
        let mut read = |id| match sensors.sensor(id) {
            Some(s) => {
                ready &= s.ready();
                s.reading()
            }
            None => {
                ready = false;
                0.0
            }
        };
        let input_voltage = read(SensorId::InputVac);
        let output_voltage = read(SensorId::OutputVac);
        let output_current = read(SensorId::OutputCurrent);
        let battery_voltage = read(SensorId::BatteryVoltage);
        Self {
            input_voltage,
            output_voltage,
            output_current,
            battery_voltage,
            ready,
        }
    }
}
