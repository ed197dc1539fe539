//! Host simulator for the ups-rs control core.
//!
//! Feeds a synthetic board (mains sine, tap relays, inverter and a lead-acid
//! battery) into [`Ups::on_tick`] and walks it through a scripted mains
//! profile: nominal, brownout, overvoltage, outage and recovery.
//!
//! Run with `RUST_LOG=info` (or `debug`) to follow the transfers.

use std::cell::Cell;
use std::convert::Infallible;
use std::f32::consts::{PI, SQRT_2};
use std::rc::Rc;

use embedded_hal::digital::{ErrorType as DigitalErrorType, OutputPin};
use embedded_hal::pwm::{ErrorType as PwmErrorType, SetDutyCycle};
use log::{info, warn};

use ups_rs::config::{self, UpsConfig, board_sensors};
use ups_rs::hal::{AnalogInput, OutputPins, channels};
use ups_rs::regulator::{RegulateStatus, StatusFlags};
use ups_rs::sensors::SensorBank;
use ups_rs::settings::{MemoryStore, Settings};
use ups_rs::{Ups, UpsSnapshot};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Mains frequency fed to the AC channels.
const MAINS_HZ: f32 = 50.0;

/// Voltage the inverter produces while engaged.
const INVERTER_VOLTS: f32 = 220.0;

/// Load current drawn from the output.
const LOAD_AMPS: f32 = 2.5;

/// Tap ratios of the autotransformer.
const STEP_UP_RATIO: f32 = 1.1;
const STEP_DOWN_RATIO: f32 = 0.9;

/// Battery capacity in ampere-seconds (7 Ah).
const BATTERY_CAPACITY: f32 = 7.0 * 3600.0;

/// Current drawn from the battery per output ampere while inverting.
const INVERTER_DRAW_RATIO: f32 = 9.0;

/// Charge current produced at full PWM duty.
const CHARGER_MAX_AMPS: f32 = 2.0;

/// Scripted mains profile: (start second, RMS volts, label).
const PROFILE: &[(u32, f32, &str)] = &[
    (0, 220.0, "nominal mains"),
    (20, 192.0, "brownout"),
    (35, 248.0, "overvoltage"),
    (50, 0.0, "outage"),
    (80, 221.0, "mains restored"),
];

/// Total simulated time.
const RUN_SECS: u32 = 110;

// ---------------------------------------------------------------------------
// Board model
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SimPin(Rc<Cell<bool>>);

impl SimPin {
    fn is_high(&self) -> bool {
        self.0.get()
    }
}

impl DigitalErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.set(true);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SimPwm(Rc<Cell<u16>>);

impl PwmErrorType for SimPwm {
    type Error = Infallible;
}

impl SetDutyCycle for SimPwm {
    fn max_duty_cycle(&self) -> u16 {
        1023
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Infallible> {
        self.0.set(duty);
        Ok(())
    }
}

/// Shared physical state the ADC reads from and the tick loop advances.
#[derive(Default)]
struct Plant {
    tick: Cell<u32>,
    mains: Cell<f32>,
    battery_charge: Cell<f32>,
    battery_current: Cell<f32>,
}

impl Plant {
    /// Open-circuit voltage of a 24 V lead-acid pack at the current charge.
    fn battery_volts(&self) -> f32 {
        let soc = (self.battery_charge.get() / BATTERY_CAPACITY).clamp(0.0, 1.0);
        21.0 + 6.6 * soc + 0.05 * self.battery_current.get()
    }
}

#[derive(Clone)]
struct SimBoard {
    plant: Rc<Plant>,
    pins: OutputPins<SimPin>,
    duty: SimPwm,
    tick_rate_hz: u32,
}

impl SimBoard {
    fn output_volts(&self) -> f32 {
        if self.pins.inverter.is_high() {
            return INVERTER_VOLTS;
        }
        let mains = self.plant.mains.get();
        if self.pins.step_up_relay.is_high() {
            mains * STEP_UP_RATIO
        } else if self.pins.step_down_relay.is_high() {
            mains * STEP_DOWN_RATIO
        } else {
            mains
        }
    }

    fn load_amps(&self) -> f32 {
        if self.pins.output_relay.is_high() && self.output_volts() > 0.0 {
            LOAD_AMPS
        } else {
            0.0
        }
    }

    /// Integrate the battery over one tick.
    fn step_battery(&self) {
        let current = if self.pins.inverter.is_high() {
            -self.load_amps() * INVERTER_DRAW_RATIO
        } else {
            f32::from(self.duty.0.get()) / 1023.0 * CHARGER_MAX_AMPS
        };
        let dt = 1.0 / self.tick_rate_hz as f32;
        let charge = self.plant.battery_charge.get() + current * dt;
        self.plant.battery_charge.set(charge.clamp(0.0, BATTERY_CAPACITY));
        self.plant.battery_current.set(current);
    }

    fn sine(&self, rms: f32, scale: f32) -> u16 {
        let t = self.plant.tick.get() as f32 / self.tick_rate_hz as f32;
        let value = config::ADC_MIDSCALE as f32 + rms / scale * SQRT_2 * (2.0 * PI * MAINS_HZ * t).sin();
        value.round().clamp(0.0, config::ADC_MAX as f32) as u16
    }
}

impl AnalogInput for SimBoard {
    fn read_adc(&mut self, channel: u8) -> u16 {
        match channel {
            channels::INPUT_VAC => self.sine(self.plant.mains.get(), config::VAC_SCALE),
            channels::OUTPUT_VAC => self.sine(self.output_volts(), config::VAC_SCALE),
            channels::OUTPUT_CURRENT => self.sine(self.load_amps(), config::AC_CURRENT_SCALE),
            channels::BATTERY_VOLTAGE => (self.plant.battery_volts() / config::V_BAT_SCALE) as u16,
            channels::BATTERY_CURRENT => {
                (self.plant.battery_current.get().max(0.0) / config::C_BAT_SCALE) as u16
            }
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn describe(status: StatusFlags) -> String {
    const NAMES: &[(StatusFlags, &str)] = &[
        (StatusFlags::UTILITY_FAIL, "utility-fail"),
        (StatusFlags::BATTERY_LOW, "battery-low"),
        (StatusFlags::REGULATED, "regulated"),
        (StatusFlags::UPS_FAULT, "fault"),
        (StatusFlags::SELF_TEST, "self-test"),
        (StatusFlags::SHUTDOWN_ACTIVE, "shutdown"),
        (StatusFlags::BEEPER_ACTIVE, "beeper"),
        (StatusFlags::BATTERY_DEAD, "battery-dead"),
        (StatusFlags::OVERLOAD, "overload"),
    ];
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(flag, _)| status.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "ok".to_string()
    } else {
        names.join(",")
    }
}

fn report(second: u32, s: &UpsSnapshot) {
    info!(
        "t={:>3}s in={:>5.1}V/{:>4.1}Hz out={:>5.1}V load={:>3.0}% bat={:>4.1}V ({:>3.0}%) {:?} duty={} [{}]",
        second,
        s.input_voltage,
        s.input_frequency,
        s.output_voltage,
        s.load_level * 100.0,
        s.battery_voltage,
        s.battery_level * 100.0,
        s.charging_mode,
        s.charger_duty,
        describe(s.status),
    );
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    info!("Starting ups-rs simulator");

    let config = UpsConfig::default();
    let pins = OutputPins {
        input_relay: SimPin::default(),
        output_relay: SimPin::default(),
        step_up_relay: SimPin::default(),
        step_down_relay: SimPin::default(),
        inverter: SimPin::default(),
        beeper: SimPin::default(),
    };
    let plant = Rc::new(Plant::default());
    plant.battery_charge.set(BATTERY_CAPACITY * 0.6);
    let duty = SimPwm::default();
    let board = SimBoard {
        plant: Rc::clone(&plant),
        pins: pins.clone(),
        duty: duty.clone(),
        tick_rate_hz: config.tick_rate_hz,
    };

    let sensors = SensorBank::new(board.clone(), &board_sensors(), config.tick_rate_hz);
    let mut ups = match Ups::new(config, sensors, pins, duty, SimPin::default()) {
        Ok(ups) => ups,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return;
        }
    };

    let mut settings = Settings::new(MemoryStore::<256>::new());
    if let Err(e) = ups.load_settings(&mut settings) {
        warn!("Settings load failed: {}", e);
    }

    let tick_rate = ups.config().tick_rate_hz;
    let mut profile = PROFILE.iter().peekable();
    let mut last_status = RegulateStatus::None;

    for second in 0..RUN_SECS {
        if let Some(&(_, volts, label)) = profile.next_if(|(start, _, _)| *start <= second) {
            info!("t={:>3}s mains -> {:.0} V ({})", second, volts, label);
            plant.mains.set(volts);
        }
        if second == 95 {
            info!("t={:>3}s operator starts a 5 s self test", second);
            ups.start_self_test(Some(5 * ups.cycles_per_sec()));
        }

        for _ in 0..tick_rate {
            let tick = plant.tick.get();
            if let Some(status) = ups.on_tick(tick)
                && status != last_status
            {
                info!("t={:>3}s regulator {:?} -> {:?}", second, last_status, status);
                last_status = status;
            }
            board.step_battery();
            plant.tick.set(tick.wrapping_add(1));
        }

        if second % 5 == 4 {
            report(second + 1, &ups.snapshot());
        }
    }

    if let Err(e) = ups.save_settings(&mut settings) {
        warn!("Settings save failed: {}", e);
    }
    info!("Simulator exiting");
}
