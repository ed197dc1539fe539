//! Host-side doubles for the hardware capabilities

use std::cell::Cell;
use std::rc::Rc;

use embedded_hal::digital::{ErrorType as DigitalErrorType, OutputPin};
use embedded_hal::pwm::{ErrorType as PwmErrorType, SetDutyCycle};

use crate::config::{AC_CURRENT_SCALE, ADC_MIDSCALE, C_BAT_SCALE, V_BAT_SCALE, VAC_SCALE};
use crate::hal::{AnalogInput, IdleControl, OutputPins, WatchdogTimeout};
use crate::sensors::{SensorId, SensorParams, SensorSource, SignalSensor};

/// Output pin whose level can be observed through a shared probe
pub struct MockPin {
    level: Rc<Cell<bool>>,
}

impl MockPin {
    pub fn new() -> Self {
        Self {
            level: Rc::new(Cell::new(false)),
        }
    }

    pub fn probe(&self) -> Rc<Cell<bool>> {
        self.level.clone()
    }
}

impl DigitalErrorType for MockPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level.set(true);
        Ok(())
    }
}

/// Probes onto a full [`OutputPins`] bank
pub struct PinProbes {
    pub input_relay: Rc<Cell<bool>>,
    pub output_relay: Rc<Cell<bool>>,
    pub step_up_relay: Rc<Cell<bool>>,
    pub step_down_relay: Rc<Cell<bool>>,
    pub inverter: Rc<Cell<bool>>,
    pub beeper: Rc<Cell<bool>>,
}

pub fn mock_pins() -> (OutputPins<MockPin>, PinProbes) {
    let pins = OutputPins {
        input_relay: MockPin::new(),
        output_relay: MockPin::new(),
        step_up_relay: MockPin::new(),
        step_down_relay: MockPin::new(),
        inverter: MockPin::new(),
        beeper: MockPin::new(),
    };
    let probes = PinProbes {
        input_relay: pins.input_relay.probe(),
        output_relay: pins.output_relay.probe(),
        step_up_relay: pins.step_up_relay.probe(),
        step_down_relay: pins.step_down_relay.probe(),
        inverter: pins.inverter.probe(),
        beeper: pins.beeper.probe(),
    };
    (pins, probes)
}

pub struct MockPwm {
    duty: Rc<Cell<u16>>,
    max: u16,
}

impl MockPwm {
    pub fn new(max: u16) -> Self {
        Self {
            duty: Rc::new(Cell::new(0)),
            max,
        }
    }

    pub fn probe(&self) -> Rc<Cell<u16>> {
        self.duty.clone()
    }
}

impl PwmErrorType for MockPwm {
    type Error = core::convert::Infallible;
}

impl SetDutyCycle for MockPwm {
    fn max_duty_cycle(&self) -> u16 {
        self.max
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Self::Error> {
        self.duty.set(duty);
        Ok(())
    }
}

/// ADC returning a fixed value per channel
pub struct ConstAdc {
    pub values: [u16; 8],
    pub reads: usize,
}

impl ConstAdc {
    pub fn new() -> Self {
        Self {
            values: [0; 8],
            reads: 0,
        }
    }
}

impl AnalogInput for ConstAdc {
    fn read_adc(&mut self, channel: u8) -> u16 {
        self.reads += 1;
        self.values[channel as usize]
    }
}

/// ADC replaying a sequence on every channel
pub struct SequenceAdc<'a> {
    samples: &'a [u16],
    position: usize,
}

impl<'a> SequenceAdc<'a> {
    pub fn new(samples: &'a [u16]) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl AnalogInput for SequenceAdc<'_> {
    fn read_adc(&mut self, _channel: u8) -> u16 {
        let value = self.samples[self.position % self.samples.len()];
        self.position += 1;
        value
    }
}

/// Reference board as seen through its ADC
///
/// AC channels carry a sine around mid-scale with the given peak in raw
/// counts; DC channels a constant. `tick` must be advanced by the test.
pub struct BoardAdc {
    pub tick: u32,
    pub period_ticks: f32,
    pub ac_peak: [f32; 3],
    pub dc: [u16; 2],
}

impl BoardAdc {
    /// Healthy mains at `vac` volts RMS on input and output
    pub fn mains(vac: f32) -> Self {
        let mut adc = Self {
            tick: 0,
            period_ticks: 40.0,
            ac_peak: [0.0; 3],
            dc: [0; 2],
        };
        adc.set_input(vac);
        adc.set_output(vac);
        adc.ac_peak[2] = 1.0 / AC_CURRENT_SCALE * core::f32::consts::SQRT_2;
        adc.set_battery(27.0, 0.5);
        adc
    }

    pub fn set_input(&mut self, vac: f32) {
        self.ac_peak[0] = vac / VAC_SCALE * core::f32::consts::SQRT_2;
    }

    pub fn set_output(&mut self, vac: f32) {
        self.ac_peak[1] = vac / VAC_SCALE * core::f32::consts::SQRT_2;
    }

    pub fn set_battery(&mut self, volts: f32, amps: f32) {
        self.dc = [(volts / V_BAT_SCALE).round() as u16, (amps / C_BAT_SCALE).round() as u16];
    }
}

impl AnalogInput for BoardAdc {
    fn read_adc(&mut self, channel: u8) -> u16 {
        match channel {
            0..=2 => {
                let phase = (self.tick as f32 + 0.25) / self.period_ticks;
                let value = self.ac_peak[channel as usize]
                    * (2.0 * core::f32::consts::PI * phase).sin();
                (ADC_MIDSCALE as f32 + value).round() as u16
            }
            3 | 4 => self.dc[channel as usize - 3],
            _ => 0,
        }
    }
}

/// Sensor with a directly settable reading
#[derive(Clone, Copy)]
pub struct FakeSensor {
    pub value: f32,
    pub ready: bool,
    pub params: SensorParams,
}

impl FakeSensor {
    pub fn ready(value: f32) -> Self {
        Self {
            value,
            ready: true,
            params: SensorParams::default(),
        }
    }
}

impl SignalSensor for FakeSensor {
    fn sample(&mut self, _tick: u32, _adc: &mut dyn AnalogInput) {}

    fn reading(&self) -> f32 {
        self.value
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn params(&self) -> SensorParams {
        self.params
    }

    fn set_params(&mut self, params: SensorParams) {
        self.params = params;
    }

    fn reset(&mut self) {
        self.ready = false;
    }

    fn channel(&self) -> u8 {
        0
    }
}

/// Sensor source with one optional fake per id
#[derive(Default)]
pub struct FakeSensors {
    pub slots: [Option<FakeSensor>; SensorId::COUNT],
}

impl FakeSensors {
    pub fn with(mut self, id: SensorId, sensor: FakeSensor) -> Self {
        self.slots[id as usize] = Some(sensor);
        self
    }

    pub fn set(&mut self, id: SensorId, value: f32) {
        if let Some(sensor) = self.slots[id as usize].as_mut() {
            sensor.value = value;
        }
    }
}

impl SensorSource for FakeSensors {
    fn sensor(&self, id: SensorId) -> Option<&dyn SignalSensor> {
        self.slots[id as usize]
            .as_ref()
            .map(|s| s as &dyn SignalSensor)
    }
}

/// Records the idle primitive's calls in order
#[derive(Default)]
pub struct RecordingIdle {
    pub calls: Vec<&'static str>,
}

impl IdleControl for RecordingIdle {
    fn arm_watchdog(&mut self, _timeout: WatchdogTimeout) {
        self.calls.push("arm");
    }

    fn disarm_watchdog(&mut self) {
        self.calls.push("disarm");
    }

    fn sleep_cpu(&mut self) {
        self.calls.push("sleep");
    }

    fn disable_adc(&mut self) {
        self.calls.push("adc_off");
    }

    fn enable_adc(&mut self) {
        self.calls.push("adc_on");
    }
}
