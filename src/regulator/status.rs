use core::cell::Cell;

use critical_section::Mutex;
use serde::{Deserialize, Serialize};

/// Bit set reported by the UPS status word
///
/// Bit positions are part of the external protocol and must not change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags(u16);

impl StatusFlags {
    pub const BEEPER_ACTIVE: Self = Self(1 << 0);
    pub const SHUTDOWN_ACTIVE: Self = Self(1 << 1);
    pub const SELF_TEST: Self = Self(1 << 2);
    /// Unit type marker, always set for a line-interactive UPS
    pub const LINE_INTERACTIVE: Self = Self(1 << 3);
    /// Inverter output out of band
    pub const UPS_FAULT: Self = Self(1 << 4);
    /// Boost or buck tap engaged
    pub const REGULATED: Self = Self(1 << 5);
    pub const BATTERY_LOW: Self = Self(1 << 6);
    pub const UTILITY_FAIL: Self = Self(1 << 7);
    pub const BATTERY_DEAD: Self = Self(1 << 8);
    /// Load current measured while the output relay is open
    pub const UNUSUAL: Self = Self(1 << 9);
    pub const INPUT_RELAY: Self = Self(1 << 10);
    pub const OUTPUT_RELAY: Self = Self(1 << 11);
    pub const OVERLOAD: Self = Self(1 << 12);

    /// Faults that stay set until the regulator is re-created
    pub const LATCHED: Self =
        Self(Self::UPS_FAULT.0 | Self::BATTERY_DEAD.0 | Self::OVERLOAD.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn toggle(&mut self, other: Self) {
        self.0 ^= other.0;
    }

    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl core::ops::BitOr for StatusFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Status word shared with interrupt context
///
/// Every access runs inside one critical section, so a multi-bit update is
/// never observed half-applied.
pub struct StatusRegister(Mutex<Cell<StatusFlags>>);

impl StatusRegister {
    pub const fn new(initial: StatusFlags) -> Self {
        Self(Mutex::new(Cell::new(initial)))
    }

    pub fn get(&self) -> StatusFlags {
        critical_section::with(|cs| self.0.borrow(cs).get())
    }

    pub fn contains(&self, flags: StatusFlags) -> bool {
        self.get().contains(flags)
    }

    /// Apply `f` to the status word atomically
    pub fn update(&self, f: impl FnOnce(&mut StatusFlags)) {
        critical_section::with(|cs| {
            let cell = self.0.borrow(cs);
            let mut flags = cell.get();
            f(&mut flags);
            cell.set(flags);
        });
    }

    pub fn set(&self, flags: StatusFlags, value: bool) {
        self.update(|s| s.set(flags, value));
    }
}
