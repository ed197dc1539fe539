//! Low-power idle between activity bursts

use log::debug;

use crate::hal::{IdleControl, WatchdogTimeout};

/// Sleep for `cycles` watchdog periods with the ADC powered down
///
/// Each cycle arms the watchdog, sleeps until it fires and disarms it again.
/// Returns the time spent asleep in milliseconds.
pub fn low_power_idle<C: IdleControl + ?Sized>(ctl: &mut C, cycles: u16, timeout: WatchdogTimeout) -> u32 {
    if cycles == 0 {
        return 0;
    }
    debug!("Idling for {} x {} ms", cycles, timeout.as_millis());
    ctl.disable_adc();
    for _ in 0..cycles {
        ctl.arm_watchdog(timeout);
        ctl.sleep_cpu();
        ctl.disarm_watchdog();
    }
    ctl.enable_adc();
    u32::from(cycles) * timeout.as_millis()
}
