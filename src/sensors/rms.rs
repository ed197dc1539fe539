use log::{debug, warn};

use super::sine::SineCheck;
use super::{SensorParams, SignalSensor};
use crate::config::{ADC_MAX, ADC_MIDSCALE, RmsConfig, SamplingConfig};
use crate::hal::AnalogInput;

/// One closed mains period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeriodSlot {
    /// Sum of `delta² × sampling_period` over the period
    sum_sq: u64,
    /// Accepted samples in the period
    samples: u32,
}

/// True-RMS and frequency estimator for an AC channel biased to mid-scale
///
/// Periods are delimited by rising zero crossings around the median. The last
/// `P` closed periods are kept in a ring whose sums are maintained
/// incrementally. Until the ring first fills, the RMS value and frequency are
/// recomputed on every closed period over the slots filled so far; after
/// that, each time the ring wraps.
///
/// A separate presence window of [`RmsConfig::window_samples`] samples
/// detects a missing or unmeasurable signal: if no period, or more periods
/// than [`RmsConfig::max_periods`], closed inside it, the sensor resets and
/// reads zero until a clean signal returns.
#[derive(Debug, Clone)]
pub struct RmsSensor<const P: usize> {
    channel: u8,
    sampling: SamplingConfig,
    params: SensorParams,
    config: RmsConfig,
    median: i32,

    ring: [PeriodSlot; P],
    cursor: usize,
    /// Slots written since the last clear, saturating at `P`
    filled: usize,
    reading_sum: u64,
    period_sum: u32,

    running: PeriodSlot,
    /// `None` until the first sample after a reset seeds it
    last_delta: Option<i32>,
    /// Set by the first rising crossing; earlier samples belong to no period
    synced: bool,
    peak: i32,
    amplitude: i32,

    window_samples: u32,
    window_periods: u32,
    sine: SineCheck,
    signal_lost: bool,

    reading: f32,
    frequency: f32,
    avg_period_ticks: f32,
    ready: bool,
}

impl<const P: usize> RmsSensor<P> {
    pub const fn new(
        channel: u8,
        sampling: SamplingConfig,
        params: SensorParams,
        config: RmsConfig,
    ) -> Self {
        const { assert!(P > 0, "RMS ring must hold at least one period") };
        Self {
            channel,
            sampling,
            params,
            config,
            median: ADC_MIDSCALE + params.offset as i32,
            ring: [PeriodSlot {
                sum_sq: 0,
                samples: 0,
            }; P],
            cursor: 0,
            filled: 0,
            reading_sum: 0,
            period_sum: 0,
            running: PeriodSlot {
                sum_sq: 0,
                samples: 0,
            },
            last_delta: None,
            synced: false,
            peak: 0,
            amplitude: 0,
            window_samples: 0,
            window_periods: 0,
            sine: SineCheck::new(),
            signal_lost: false,
            reading: 0.0,
            frequency: 0.0,
            avg_period_ticks: 0.0,
            ready: false,
        }
    }

    /// Peak `|delta|` of the last closed period, in raw counts
    pub fn amplitude(&self) -> i32 {
        self.amplitude
    }

    /// Whether the last presence window looked distorted
    pub fn bad_sine(&self) -> bool {
        self.sine.bad_sine()
    }

    fn clear_accumulators(&mut self) {
        self.ring = [PeriodSlot::default(); P];
        self.cursor = 0;
        self.filled = 0;
        self.reading_sum = 0;
        self.period_sum = 0;
        self.running = PeriodSlot::default();
        self.last_delta = None;
        self.synced = false;
        self.peak = 0;
        self.amplitude = 0;
        self.window_samples = 0;
        self.window_periods = 0;
        self.sine = SineCheck::new();
        self.avg_period_ticks = 0.0;
    }

    fn accumulate(&mut self, delta: i32) {
        let wide = i64::from(delta);
        let sq = (wide * wide) as u64 * u64::from(self.sampling.period);
        self.running.sum_sq += sq;
        self.running.samples += 1;
        self.peak = self.peak.max(delta.abs());

        if let Some(tolerance) = self.config.sine_tolerance {
            if self.avg_period_ticks > 0.0 {
                let elapsed = self.running.samples * u32::from(self.sampling.period);
                let phase = elapsed as f32 / self.avg_period_ticks;
                self.sine.check(delta, self.amplitude, phase, tolerance);
            }
        }
    }

    fn close_period(&mut self) {
        let old = self.ring[self.cursor];
        let new = self.running;
        self.reading_sum = self.reading_sum - old.sum_sq + new.sum_sq;
        self.period_sum = self.period_sum - old.samples + new.samples;
        self.ring[self.cursor] = new;

        self.running = PeriodSlot::default();
        self.amplitude = self.peak;
        self.peak = 0;
        self.window_periods += 1;

        self.cursor += 1;
        if self.cursor == P {
            self.cursor = 0;
            self.ready = true;
        }
        self.filled = (self.filled + 1).min(P);
        if self.filled < P || self.cursor == 0 {
            self.compute_reading();
        }
    }

    fn compute_reading(&mut self) {
        let sampling_period = f32::from(self.sampling.period);
        self.avg_period_ticks = self.period_sum as f32 * sampling_period / self.filled as f32;
        // Keep reading zero until a whole presence window looks like mains again
        if self.signal_lost || self.period_sum == 0 {
            return;
        }
        let mean_sq = self.reading_sum as f32 / (self.period_sum as f32 * sampling_period);
        self.reading = libm::sqrtf(mean_sq) * self.params.scale;
        self.frequency = if self.avg_period_ticks > 0.0 {
            self.config.tick_rate_hz as f32 / self.avg_period_ticks
        } else {
            0.0
        };
        debug!(
            "RMS channel {}: {} at {} Hz",
            self.channel, self.reading, self.frequency
        );
    }

    fn finish_window(&mut self) {
        let periods = self.window_periods;
        if periods == 0 || periods > self.config.max_periods {
            self.on_counter_overflow(periods);
        } else {
            if self.signal_lost {
                debug!("Signal on channel {} recovered", self.channel);
                self.signal_lost = false;
            }
            self.sine.finish_window(self.config.max_bad_ratio);
        }
        self.window_samples = 0;
        self.window_periods = 0;
    }

    /// Signal is absent or unmeasurable: read zero until it comes back
    fn on_counter_overflow(&mut self, periods: u32) {
        if !self.signal_lost {
            warn!(
                "No usable signal on channel {} ({} periods in window), resetting",
                self.channel, periods
            );
            self.signal_lost = true;
        }
        self.clear_accumulators();
        self.reading = 0.0;
        self.frequency = 0.0;
        self.ready = true;
    }
}

impl<const P: usize> SignalSensor for RmsSensor<P> {
    fn sample(&mut self, tick: u32, adc: &mut dyn AnalogInput) {
        if !self.sampling.is_due(tick) {
            return;
        }
        let raw = adc.read_adc(self.channel).min(ADC_MAX);
        let delta = i32::from(raw) - self.median;

        if let Some(last) = self.last_delta {
            let rising = delta > 0 && last <= 0;
            if self.synced {
                self.accumulate(delta);
                if rising {
                    self.close_period();
                }
            } else if rising {
                self.synced = true;
                self.peak = 0;
            }
        }
        self.last_delta = Some(delta);

        self.window_samples += 1;
        if self.window_samples >= self.config.window_samples {
            self.finish_window();
        }
    }

    fn reading(&self) -> f32 {
        self.reading
    }

    fn frequency(&self) -> Option<f32> {
        Some(self.frequency)
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn params(&self) -> SensorParams {
        self.params
    }

    fn set_params(&mut self, params: SensorParams) {
        self.params = params;
        self.median = ADC_MIDSCALE + params.offset as i32;
    }

    fn reset(&mut self) {
        self.clear_accumulators();
        self.signal_lost = false;
        self.reading = 0.0;
        self.frequency = 0.0;
        self.ready = false;
    }

    fn channel(&self) -> u8 {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::AnalogInput;
    use core::f32::consts::PI;

    /// Sine generator around mid-scale with an exact period in ticks
    struct SineAdc {
        amplitude: f32,
        period_ticks: f32,
        tick: u32,
    }

    impl SineAdc {
        fn new(amplitude: f32, period_ticks: f32) -> Self {
            Self {
                amplitude,
                period_ticks,
                tick: 0,
            }
        }
    }

    impl AnalogInput for SineAdc {
        fn read_adc(&mut self, _channel: u8) -> u16 {
            let angle = 2.0 * PI * self.tick as f32 / self.period_ticks;
            // Quarter-tick phase shift keeps samples off the exact zero
            let angle = angle + 0.25 * 2.0 * PI / self.period_ticks;
            (ADC_MIDSCALE as f32 + self.amplitude * libm::sinf(angle)).round() as u16
        }
    }

    /// Square wave, high for the first half of each period
    struct SquareAdc {
        high: u16,
        low: u16,
        period_ticks: u32,
        tick: u32,
    }

    impl AnalogInput for SquareAdc {
        fn read_adc(&mut self, _channel: u8) -> u16 {
            if self.tick % self.period_ticks < self.period_ticks / 2 {
                self.high
            } else {
                self.low
            }
        }
    }

    trait Waveform: AnalogInput {
        fn tick_mut(&mut self) -> &mut u32;
    }

    impl Waveform for SineAdc {
        fn tick_mut(&mut self) -> &mut u32 {
            &mut self.tick
        }
    }

    impl Waveform for SquareAdc {
        fn tick_mut(&mut self) -> &mut u32 {
            &mut self.tick
        }
    }

    fn run<const P: usize, W: Waveform>(sensor: &mut RmsSensor<P>, adc: &mut W, ticks: u32) {
        for _ in 0..ticks {
            let tick = *adc.tick_mut();
            sensor.sample(tick, adc);
            *adc.tick_mut() += 1;
        }
    }

    fn sensor(scale: f32, sampling: SamplingConfig) -> RmsSensor<10> {
        RmsSensor::new(
            0,
            sampling,
            SensorParams { scale, offset: 0.0 },
            RmsConfig::for_mains(2000, sampling.period),
        )
    }

    #[test]
    fn test_sine_converges_to_rms_and_frequency() {
        let mut rms = sensor(0.5, SamplingConfig::default());
        // 50 Hz at 2 kHz
        let mut adc = SineAdc::new(400.0, 40.0);

        run(&mut rms, &mut adc, 40 * 12);
        assert!(rms.ready());

        let expected = 400.0 / 2f32.sqrt() * 0.5;
        assert!((rms.reading() - expected).abs() < expected * 0.01, "{}", rms.reading());
        let frequency = rms.frequency().unwrap_or_default();
        assert!((frequency - 50.0).abs() < 0.5, "{}", frequency);
        assert!(!rms.bad_sine());
    }

    #[test]
    fn test_sampling_divisor_keeps_reading_and_frequency() {
        let sampling = SamplingConfig {
            period: 2,
            phase: 1,
        };
        let mut rms = sensor(1.0, sampling);
        // 40 Hz at 2 kHz, 25 samples per period
        let mut adc = SineAdc::new(300.0, 50.0);

        run(&mut rms, &mut adc, 50 * 30);
        assert!(rms.ready());

        let expected = 300.0 / 2f32.sqrt();
        assert!((rms.reading() - expected).abs() < expected * 0.02, "{}", rms.reading());
        let frequency = rms.frequency().unwrap_or_default();
        assert!((frequency - 40.0).abs() < 0.5, "{}", frequency);
    }

    #[test]
    fn test_partial_reading_before_ring_fills() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        let mut adc = SineAdc::new(400.0, 40.0);
        // Synced at tick 40, three periods closed by tick 199
        run(&mut rms, &mut adc, 40 * 5);
        assert!(!rms.ready());
        assert_eq!(rms.filled, 3);

        let expected = 400.0 / 2f32.sqrt();
        assert!((rms.reading() - expected).abs() < expected * 0.01, "{}", rms.reading());
        let frequency = rms.frequency().unwrap_or_default();
        assert!((frequency - 50.0).abs() < 0.5, "{}", frequency);
    }

    #[test]
    fn test_full_scale_input_is_clamped() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        let mut adc = SquareAdc {
            high: u16::MAX,
            low: 0,
            period_ticks: 40,
            tick: 0,
        };
        run(&mut rms, &mut adc, 2000);
        assert!(rms.ready());

        // Clamped to 1023 / 0 around mid-scale 512
        let expected = libm::sqrtf((511.0 * 511.0 + 512.0 * 512.0) / 2.0);
        assert!((rms.reading() - expected).abs() < 1.0, "{}", rms.reading());
    }

    #[test]
    fn test_first_sample_after_reset_only_seeds() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        let mut adc = SineAdc::new(400.0, 40.0);
        // Last sample before the reset is just below zero
        run(&mut rms, &mut adc, 40 * 12);
        rms.reset();

        run(&mut rms, &mut adc, 1);
        assert!(rms.last_delta.is_some_and(|d| d > 0));
        assert!(!rms.synced);
        assert_eq!(rms.running, PeriodSlot::default());
        assert_eq!(rms.window_periods, 0);

        // Nothing accumulates until the next rising crossing
        run(&mut rms, &mut adc, 39);
        assert!(!rms.synced);
        assert_eq!(rms.running.samples, 0);
        run(&mut rms, &mut adc, 1);
        assert!(rms.synced);
        assert_eq!(rms.running.samples, 0);
        assert_eq!(rms.window_periods, 0);
    }

    #[test]
    fn test_square_mains_sets_bad_sine() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        let mut sine = SineAdc::new(400.0, 40.0);
        run(&mut rms, &mut sine, 1000);
        assert!(!rms.bad_sine());

        let mut square = SquareAdc {
            high: (ADC_MIDSCALE + 400) as u16,
            low: (ADC_MIDSCALE - 400) as u16,
            period_ticks: 40,
            tick: sine.tick,
        };
        run(&mut rms, &mut square, 1000);
        assert!(rms.bad_sine());
        assert!(rms.reading() > 0.0);

        sine.tick = square.tick;
        run(&mut rms, &mut sine, 1000);
        assert!(!rms.bad_sine());
    }

    #[test]
    fn test_sliding_sums_exact_after_many_periods() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        // Slightly off-grid period so slot lengths vary
        let mut adc = SineAdc::new(350.0, 41.3);
        run(&mut rms, &mut adc, (41.3 * 10_050.0) as u32);

        let sum_sq: u64 = rms.ring.iter().map(|s| s.sum_sq).sum();
        let samples: u32 = rms.ring.iter().map(|s| s.samples).sum();
        assert_eq!(rms.reading_sum, sum_sq);
        assert_eq!(rms.period_sum, samples);

        let expected = 350.0 / 2f32.sqrt();
        assert!((rms.reading() - expected).abs() < expected * 0.02);
    }

    #[test]
    fn test_flat_signal_reads_zero() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        let mut adc = SineAdc::new(400.0, 40.0);
        run(&mut rms, &mut adc, 40 * 20);
        assert!(rms.reading() > 0.0);

        // Outage: ADC sits at mid-scale
        adc.amplitude = 0.0;
        run(&mut rms, &mut adc, 1000);
        assert!(rms.ready());
        assert_eq!(rms.reading(), 0.0);
        assert_eq!(rms.frequency(), Some(0.0));

        // Mains returns
        adc.amplitude = 400.0;
        run(&mut rms, &mut adc, 40 * 12);
        assert!(rms.reading() > 100.0);
    }

    #[test]
    fn test_noise_above_max_periods_reads_zero() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        // 500 Hz is far above any mains frequency
        let mut adc = SineAdc::new(400.0, 4.0);
        run(&mut rms, &mut adc, 1000);
        assert!(rms.ready());
        assert_eq!(rms.reading(), 0.0);
    }

    #[test]
    fn test_reset_zeroes_state() {
        let mut rms = sensor(1.0, SamplingConfig::default());
        let mut adc = SineAdc::new(400.0, 40.0);
        run(&mut rms, &mut adc, 40 * 12);
        rms.reset();
        assert!(!rms.ready());
        assert_eq!(rms.reading(), 0.0);
        assert_eq!(rms.reading_sum, 0);
        assert_eq!(rms.period_sum, 0);
    }
}
