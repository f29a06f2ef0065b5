use esp_hal::time::Instant;
use gniot_core::clock::CycleCounter;

/// The 52-bit system timer, truncated to 32 bits of microseconds.
///
/// Readable from interrupt context. Restarts from zero after deep sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimerCounter;

impl CycleCounter for SystemTimerCounter {
    const TICKS_PER_MICROSECOND: u32 = 1;

    #[inline]
    fn ticks(&self) -> u32 {
        Instant::now().duration_since_epoch().as_micros() as u32
    }
}
