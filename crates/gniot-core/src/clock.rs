//! Free-running cycle counter abstraction
//!
//! Every timing decision in the node is expressed as a 32-bit tick delta
//! converted to microseconds. The conversion tolerates exactly one wraparound
//! of the counter between the reference and the current reading.

use core::sync::atomic::{AtomicU32, Ordering};

/// A free-running 32-bit hardware counter.
///
/// Implementations must be cheap to read: the decoder samples the counter
/// from inside the GPIO interrupt handler.
pub trait CycleCounter {
    /// Number of counter ticks per microsecond of wall time.
    const TICKS_PER_MICROSECOND: u32;

    /// Current raw counter value.
    fn ticks(&self) -> u32;
}

impl<T: CycleCounter> CycleCounter for &T {
    const TICKS_PER_MICROSECOND: u32 = T::TICKS_PER_MICROSECOND;

    #[inline]
    fn ticks(&self) -> u32 {
        (**self).ticks()
    }
}

/// Microseconds between two raw counter values.
///
/// Correct across at most one counter overflow.
#[inline]
pub const fn elapsed_micros_between(reference: u32, now: u32, ticks_per_us: u32) -> u32 {
    now.wrapping_sub(reference) / ticks_per_us
}

/// Converts a [`CycleCounter`] into elapsed-microsecond deltas.
pub struct CycleClock<C> {
    counter: C,
}

impl<C: CycleCounter> CycleClock<C> {
    pub const fn new(counter: C) -> Self {
        Self { counter }
    }

    /// Current raw tick count.
    #[inline]
    pub fn now(&self) -> u32 {
        self.counter.ticks()
    }

    /// Microseconds elapsed since `reference` ticks.
    #[inline]
    pub fn elapsed_micros(&self, reference: u32) -> u32 {
        elapsed_micros_between(reference, self.now(), C::TICKS_PER_MICROSECOND)
    }

    /// Microseconds between `reference` and an already sampled `now`.
    #[inline]
    pub fn micros_between(&self, reference: u32, now: u32) -> u32 {
        elapsed_micros_between(reference, now, C::TICKS_PER_MICROSECOND)
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }
}

/// Software counter advanced explicitly, one tick per microsecond.
///
/// Used by the simulator and tests to stand in for the hardware counter while
/// a synthetic waveform is replayed.
#[derive(Debug, Default)]
pub struct VirtualCounter {
    ticks: AtomicU32,
}

impl VirtualCounter {
    pub const fn new(start: u32) -> Self {
        Self {
            ticks: AtomicU32::new(start),
        }
    }

    pub fn advance_micros(&self, micros: u32) {
        self.ticks.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn advance_secs(&self, secs: u32) {
        self.advance_micros(secs.wrapping_mul(1_000_000));
    }
}

impl CycleCounter for VirtualCounter {
    const TICKS_PER_MICROSECOND: u32 = 1;

    fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ccount80(u32);

    impl CycleCounter for Ccount80 {
        const TICKS_PER_MICROSECOND: u32 = 80;

        fn ticks(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_elapsed_without_wrap() {
        let clock = CycleClock::new(Ccount80(80 * 250));
        assert_eq!(clock.elapsed_micros(0), 250);
    }

    #[test]
    fn test_elapsed_across_wraparound() {
        // 40 ticks before overflow, 760 after: 800 ticks = 10 us
        let clock = CycleClock::new(Ccount80(760));
        assert_eq!(clock.elapsed_micros(u32::MAX - 39), 10);
    }

    #[test]
    fn test_virtual_counter_advances() {
        let counter = VirtualCounter::new(u32::MAX - 5);
        let start = counter.ticks();
        counter.advance_micros(100);
        let clock = CycleClock::new(&counter);
        assert_eq!(clock.elapsed_micros(start), 100);
    }
}
