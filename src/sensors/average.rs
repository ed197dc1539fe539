use log::debug;

use super::{SensorParams, SignalSensor};
use crate::config::SamplingConfig;
use crate::hal::AnalogInput;

/// Running average over the last `N` raw samples of one channel
///
/// Used for the DC channels (battery voltage and current) where a mean is the
/// wanted quantity. The sum is adjusted by `+new -old` on every sample, so the
/// reading is available in constant time after every accepted sample.
#[derive(Debug, Clone)]
pub struct AverageSensor<const N: usize> {
    channel: u8,
    sampling: SamplingConfig,
    params: SensorParams,
    samples: [u16; N],
    cursor: usize,
    /// Samples currently held, saturating at `N`
    count: usize,
    sum: u32,
    ready: bool,
}

impl<const N: usize> AverageSensor<N> {
    pub const fn new(channel: u8, sampling: SamplingConfig, params: SensorParams) -> Self {
        const { assert!(N > 0, "averaging window must hold at least one sample") };
        Self {
            channel,
            sampling,
            params,
            samples: [0; N],
            cursor: 0,
            count: 0,
            sum: 0,
            ready: false,
        }
    }

    fn push(&mut self, raw: u16) {
        let oldest = self.samples[self.cursor];
        if self.count == N {
            self.sum = self.sum - u32::from(oldest) + u32::from(raw);
        } else {
            self.sum += u32::from(raw);
            self.count += 1;
        }
        self.samples[self.cursor] = raw;

        self.cursor += 1;
        if self.cursor == N {
            self.cursor = 0;
            if !self.ready {
                debug!("Average sensor on channel {} filled its window", self.channel);
                self.ready = true;
            }
        }
    }

    /// Mean of the held raw samples, before scaling
    pub fn raw_mean(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f32 / self.count as f32
    }
}

impl<const N: usize> SignalSensor for AverageSensor<N> {
    fn sample(&mut self, tick: u32, adc: &mut dyn AnalogInput) {
        if !self.sampling.is_due(tick) {
            return;
        }
        let raw = adc.read_adc(self.channel);
        self.push(raw);
    }

    fn reading(&self) -> f32 {
        self.raw_mean() * self.params.scale + self.params.offset
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
        self.samples = [0; N];
        self.cursor = 0;
        self.count = 0;
        self.sum = 0;
        self.ready = false;
    }

    fn channel(&self) -> u8 {
        self.channel
    }
}
