//! Waveform sanity check for True-RMS channels

/// `sin(i * PI / 64) * 1024` for the first quarter period
const QUARTER_SINE: [i32; 33] = [
    0, 50, 100, 150, 200, 249, 297, 345, 392, 438, 483, 526, 569, 610, 650, 688, 724, 759, 792,
    822, 851, 878, 903, 926, 946, 964, 980, 993, 1004, 1013, 1019, 1023, 1024,
];

const STEPS_PER_PERIOD: i32 = 128;
const QUARTER: i32 = 32;

/// Sine of `phase` (fraction of a period) scaled by 1024
pub(crate) fn sine_q10(phase: f32) -> i32 {
    let step = (libm::roundf(phase * STEPS_PER_PERIOD as f32) as i32).rem_euclid(STEPS_PER_PERIOD);
    let index = step % QUARTER;
    match step / QUARTER {
        0 => QUARTER_SINE[index as usize],
        1 => QUARTER_SINE[(QUARTER - index) as usize],
        2 => -QUARTER_SINE[index as usize],
        _ => -QUARTER_SINE[(QUARTER - index) as usize],
    }
}

/// Counts samples that stray from the sine predicted by the last amplitude
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SineCheck {
    checked: u32,
    bad: u32,
    bad_sine: bool,
}

impl SineCheck {
    pub(crate) const fn new() -> Self {
        Self {
            checked: 0,
            bad: 0,
            bad_sine: false,
        }
    }

    /// Compare one sample against the expected value
    ///
    /// `phase` is the position inside the current period as a fraction.
    pub(crate) fn check(&mut self, delta: i32, amplitude: i32, phase: f32, tolerance: f32) {
        if amplitude <= 0 {
            return;
        }
        let expected = amplitude * sine_q10(phase) / 1024;
        let limit = tolerance * amplitude as f32;
        self.checked += 1;
        if ((delta - expected).abs() as f32) > limit {
            self.bad += 1;
        }
    }

    /// Close a presence window and latch its verdict until the next one
    pub(crate) fn finish_window(&mut self, max_bad_ratio: f32) {
        self.bad_sine = self.checked > 0 && self.bad as f32 > max_bad_ratio * self.checked as f32;
        self.checked = 0;
        self.bad = 0;
    }

    pub(crate) fn bad_sine(&self) -> bool {
        self.bad_sine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_quadrants() {
        assert_eq!(sine_q10(0.0), 0);
        assert_eq!(sine_q10(0.25), 1024);
        assert_eq!(sine_q10(0.5), 0);
        assert_eq!(sine_q10(0.75), -1024);
        assert_eq!(sine_q10(1.0), 0);
        assert_eq!(sine_q10(0.125), 724);
        assert_eq!(sine_q10(0.625), -724);
    }

    #[test]
    fn test_clean_sine_passes() {
        let mut check = SineCheck::default();
        for i in 0..40 {
            let phase = i as f32 / 40.0;
            let delta = libm::roundf(400.0 * libm::sinf(phase * 2.0 * core::f32::consts::PI)) as i32;
            check.check(delta, 400, phase, 0.25);
        }
        check.finish_window(0.1);
        assert!(!check.bad_sine());
    }

    #[test]
    fn test_square_wave_is_flagged() {
        let mut check = SineCheck::default();
        for i in 0..40 {
            let phase = i as f32 / 40.0;
            let delta = if phase < 0.5 { 400 } else { -400 };
            check.check(delta, 400, phase, 0.25);
        }
        check.finish_window(0.1);
        assert!(check.bad_sine());

        // Verdict is per window
        check.finish_window(0.1);
        assert!(!check.bad_sine());
    }
}
