//! Hardware capabilities consumed by the control core
//!
//! Digital outputs and the charger PWM use the `embedded-hal` traits directly,
//! so any HAL pin type can be handed to the constructors. The ADC and the
//! low-power primitives have no `embedded-hal` counterpart and are described
//! by the small traits below.
//!
//! Every method here may be called from interrupt context and must not block.

use embedded_hal::digital::{OutputPin, PinState};
use embedded_hal::pwm::SetDutyCycle;
use log::warn;

/// ADC channels of the reference board
pub mod channels {
    pub const INPUT_VAC: u8 = 0;
    pub const OUTPUT_VAC: u8 = 1;
    pub const OUTPUT_CURRENT: u8 = 2;
    pub const BATTERY_VOLTAGE: u8 = 3;
    pub const BATTERY_CURRENT: u8 = 4;
}

/// Single-conversion analog input
pub trait AnalogInput {
    /// Convert `channel` and return the raw 10-bit value
    fn read_adc(&mut self, channel: u8) -> u16;
}

impl<T: AnalogInput + ?Sized> AnalogInput for &mut T {
    fn read_adc(&mut self, channel: u8) -> u16 {
        (**self).read_adc(channel)
    }
}

/// Watchdog periods supported by the idle primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTimeout {
    Ms15,
    Ms60,
    Ms250,
    Ms1000,
}

impl WatchdogTimeout {
    pub const fn as_millis(self) -> u32 {
        match self {
            Self::Ms15 => 15,
            Self::Ms60 => 60,
            Self::Ms250 => 250,
            Self::Ms1000 => 1000,
        }
    }
}

/// Low-power primitives used between regulation cycles
pub trait IdleControl {
    fn arm_watchdog(&mut self, timeout: WatchdogTimeout);
    fn disarm_watchdog(&mut self);
    /// Enter sleep until the watchdog (or any other interrupt) fires
    fn sleep_cpu(&mut self);
    fn disable_adc(&mut self);
    fn enable_adc(&mut self);
}

/// Every digital output driven by the line regulator
#[derive(Clone)]
pub struct OutputPins<O: OutputPin> {
    pub input_relay: O,
    pub output_relay: O,
    /// Tap relay selecting the boost winding
    pub step_up_relay: O,
    /// Tap relay selecting the buck winding
    pub step_down_relay: O,
    pub inverter: O,
    pub beeper: O,
}

/// Drive `pin` to `level`, logging instead of failing
///
/// Output errors cannot be recovered inside the tick loop; the status bits
/// still record the commanded state.
pub(crate) fn drive<O: OutputPin>(pin: &mut O, level: bool, name: &'static str) {
    if let Err(e) = pin.set_state(PinState::from(level)) {
        warn!("Failed to drive {} {}: {:?}", name, level, e);
    }
}

/// Write `duty` clamped to both `limit` and the channel's own maximum.
/// Returns the value actually applied.
pub(crate) fn write_duty<P: SetDutyCycle>(pwm: &mut P, duty: u16, limit: u16) -> u16 {
    let duty = duty.min(limit).min(pwm.max_duty_cycle());
    if let Err(e) = pwm.set_duty_cycle(duty) {
        warn!("Failed to set charger duty {}: {:?}", duty, e);
    }
    duty
}
