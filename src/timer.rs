//! Tick-counted timers and the shared tick counter
//!
//! A [`SimpleTimer`] alternates between an idle phase of `period` cycles and
//! an active phase of `duration` cycles. Instead of invoking callbacks it
//! reports [`TimerEvent`]s from [`SimpleTimer::tick`]; the [`TimerManager`]
//! collects them for the owner to dispatch.
//!
//! A timer with `period == 0` is one-shot: it becomes active on the first
//! tick after `start` and disables itself when the duration elapses. A timer
//! with `duration == 0` fires `Started` every `period` cycles and never
//! becomes active.

use core::sync::atomic::{AtomicU32, Ordering};

use heapless::Vec;

use crate::error::TimerError;

/// Capacity of the timer table
pub const MAX_TIMERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Started,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimpleTimer {
    period: u32,
    duration: u32,
    counter: u32,
    active: bool,
    enabled: bool,
}

impl SimpleTimer {
    pub const fn new(period: u32, duration: u32, enabled: bool) -> Self {
        Self {
            period,
            duration,
            counter: 0,
            active: false,
            enabled,
        }
    }

    pub fn start(&mut self) {
        self.counter = 0;
        self.enabled = true;
    }

    pub fn start_with(&mut self, period: u32, duration: u32) {
        self.period = period;
        self.duration = duration;
        self.start();
    }

    /// Disable the timer; an active phase reports `Finished` on the next tick
    pub fn stop(&mut self) {
        self.enabled = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn set_period(&mut self, period: u32) {
        self.period = period;
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.duration = duration;
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Advance by one control cycle
    pub fn tick(&mut self) -> Option<TimerEvent> {
        if !self.enabled {
            let was_active = self.active;
            self.active = false;
            return was_active.then_some(TimerEvent::Finished);
        }

        let mut event = None;
        if self.active {
            if self.counter >= self.duration {
                self.active = false;
                event = Some(TimerEvent::Finished);
                if self.period == 0 {
                    self.stop();
                }
            }
        } else if self.counter >= self.period {
            self.counter = 0;
            self.active = self.duration > 0;
            self.enabled = self.active || self.period > 0;
            event = Some(TimerEvent::Started);
        }

        self.counter = self.counter.saturating_add(1);
        event
    }
}

/// Index of a timer inside its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

impl TimerId {
    pub fn index(self) -> usize {
        self.0
    }
}

pub type TimerEvents = Vec<(TimerId, TimerEvent), MAX_TIMERS>;

/// Fixed-capacity table of timers advanced together
#[derive(Debug, Default)]
pub struct TimerManager {
    timers: Vec<SimpleTimer, MAX_TIMERS>,
    ticks: u32,
}

impl TimerManager {
    pub const fn new() -> Self {
        Self {
            timers: Vec::new(),
            ticks: 0,
        }
    }

    pub fn create(&mut self, period: u32, duration: u32, start: bool) -> Result<TimerId, TimerError> {
        let id = TimerId(self.timers.len());
        self.timers
            .push(SimpleTimer::new(period, duration, start))
            .map_err(|_| TimerError::Full)?;
        Ok(id)
    }

    pub fn get(&self, id: TimerId) -> Result<&SimpleTimer, TimerError> {
        self.timers.get(id.0).ok_or(TimerError::UnknownTimer(id.0))
    }

    pub fn get_mut(&mut self, id: TimerId) -> Result<&mut SimpleTimer, TimerError> {
        self.timers
            .get_mut(id.0)
            .ok_or(TimerError::UnknownTimer(id.0))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Control cycles since creation or the last [`reset_ticks`](Self::reset_ticks)
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn reset_ticks(&mut self) {
        self.ticks = 0;
    }

    /// Advance every timer and return the events they produced, in table order
    pub fn tick(&mut self) -> TimerEvents {
        self.ticks = self.ticks.wrapping_add(1);
        let mut events = TimerEvents::new();
        for (index, timer) in self.timers.iter_mut().enumerate() {
            if let Some(event) = timer.tick() {
                // One event per timer at most, so this cannot overflow
                let _ = events.push((TimerId(index), event));
            }
        }
        events
    }
}

/// Monotonic tick counter shared between the timer interrupt and the main loop
#[derive(Debug, Default)]
pub struct TickCounter(AtomicU32);

impl TickCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Advance by one tick and return the new count
    pub fn advance(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn now(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}
