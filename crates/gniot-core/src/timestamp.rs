//! Seconds clock that keeps counting across deep sleep
//!
//! While running, the clock is advanced from a microsecond [`CycleCounter`].
//! Before sleeping the seconds are saved to the retained region; on wake they
//! are restored and the configured sleep length is added, since the counter
//! itself restarts from zero.
//!
//! The counter is 32 bits wide, so [`TimestampService::now`] must be called at
//! least once per counter period (about 71 minutes at 1 MHz).

use log::{debug, info};

use crate::clock::{CycleClock, CycleCounter};
use crate::config::NodeConfig;
use crate::retained::{BootKind, RetainedRegion, ScratchMemory};

const MICROS_PER_SECOND: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// No retained time was available, counting from zero
    ColdStart,
    /// Restored from the retained region after deep sleep
    Running,
}

pub struct TimestampService<'a, C, M, const HOT: usize> {
    clock: CycleClock<C>,
    region: RetainedRegion<'a, M, HOT>,
    state: ClockState,
    current_seconds: u32,
    last_ticks: u32,
    /// Sub-second part not yet folded into `current_seconds`
    pending_micros: u32,
    synced: bool,
}

impl<'a, C: CycleCounter, M: ScratchMemory, const HOT: usize> TimestampService<'a, C, M, HOT> {
    pub fn new(counter: C, region: RetainedRegion<'a, M, HOT>) -> Self {
        let clock = CycleClock::new(counter);
        let last_ticks = clock.now();
        Self {
            clock,
            region,
            state: ClockState::ColdStart,
            current_seconds: 0,
            last_ticks,
            pending_micros: 0,
            synced: false,
        }
    }

    /// Restore the clock from the retained region.
    pub fn init(&mut self, config: &NodeConfig) {
        match self.region.boot_kind() {
            BootKind::Resumed => {
                self.current_seconds = self
                    .region
                    .saved_seconds()
                    .wrapping_add(config.sleep_seconds());
                self.state = ClockState::Running;
                info!(
                    "clock resumed at {} s (slept {} s)",
                    self.current_seconds,
                    config.sleep_seconds()
                );
            }
            BootKind::ColdStart => {
                self.current_seconds = 0;
                self.state = ClockState::ColdStart;
                info!("clock cold start");
            }
        }

        self.last_ticks = self.clock.now();
        self.pending_micros = 0;
    }

    /// Current time in seconds.
    pub fn now(&mut self) -> u32 {
        let now_ticks = self.clock.now();
        let elapsed =
            self.pending_micros as u64 + self.clock.micros_between(self.last_ticks, now_ticks) as u64;

        self.current_seconds = self
            .current_seconds
            .wrapping_add((elapsed / MICROS_PER_SECOND) as u32);
        self.pending_micros = (elapsed % MICROS_PER_SECOND) as u32;
        self.last_ticks = now_ticks;

        self.current_seconds
    }

    /// Authoritative override, e.g. server time.
    pub fn set(&mut self, seconds: u32) {
        debug!("clock set {} -> {}", self.current_seconds, seconds);
        self.current_seconds = seconds;
        self.last_ticks = self.clock.now();
        self.pending_micros = 0;
        self.synced = true;
    }

    /// Save the clock before suspending.
    ///
    /// The sleep length is added by the next [`TimestampService::init`], not
    /// here; `sleep_seconds` is only reported.
    pub fn persist(&mut self, sleep_seconds: u32) {
        let seconds = self.now();
        self.region.save_seconds(seconds);
        info!("clock saved at {} s, sleeping {} s", seconds, sleep_seconds);
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    /// Whether [`TimestampService::set`] was called since boot.
    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualCounter;
    use crate::retained::{ScratchWords, retained_words};

    const HOT: usize = 2;
    type Words = ScratchWords<{ retained_words(HOT) }>;

    fn five_minute_sleep() -> NodeConfig {
        NodeConfig {
            sleep_length_minutes: 5,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_cold_start_counts_from_zero() {
        let memory = Words::new();
        let counter = VirtualCounter::new(0);
        let mut clock = TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
        clock.init(&five_minute_sleep());

        assert_eq!(clock.state(), ClockState::ColdStart);
        counter.advance_secs(12);
        assert_eq!(clock.now(), 12);
    }

    #[test]
    fn test_continuity_across_deep_sleep() {
        let memory = Words::new();
        let config = five_minute_sleep();

        let before = {
            let counter = VirtualCounter::new(0);
            let mut clock =
                TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
            clock.init(&config);
            counter.advance_secs(40);
            let before = clock.now();
            clock.persist(300);
            before
        };

        // Counter restarts after wake
        let counter = VirtualCounter::new(0);
        let mut clock = TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
        clock.init(&config);

        assert_eq!(clock.state(), ClockState::Running);
        assert!(clock.now() >= before + 300);
    }

    #[test]
    fn test_power_loss_resets_clock() {
        let memory = Words::new();
        {
            let counter = VirtualCounter::new(0);
            let mut clock =
                TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
            clock.init(&NodeConfig::default());
            clock.set(1_000_000);
            clock.persist(180);
        }
        memory.power_loss(0);

        let counter = VirtualCounter::new(0);
        let mut clock = TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
        clock.init(&NodeConfig::default());
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn test_sub_second_calls_do_not_lose_time() {
        let memory = Words::new();
        let counter = VirtualCounter::new(0);
        let mut clock = TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
        clock.init(&NodeConfig::default());

        for _ in 0..10 {
            counter.advance_micros(400_000);
            clock.now();
        }
        assert_eq!(clock.now(), 4);
    }

    #[test]
    fn test_counter_wraparound() {
        let memory = Words::new();
        let counter = VirtualCounter::new(u32::MAX - 499_999);
        let mut clock = TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
        clock.init(&NodeConfig::default());

        counter.advance_micros(3_000_000);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn test_set_overrides_and_resyncs() {
        let memory = Words::new();
        let counter = VirtualCounter::new(0);
        let mut clock = TimestampService::new(&counter, RetainedRegion::<_, HOT>::attach(&memory));
        clock.init(&NodeConfig::default());
        counter.advance_secs(30);

        clock.set(1_700_000_000);
        assert!(clock.is_synced());
        counter.advance_secs(2);
        assert_eq!(clock.now(), 1_700_000_002);
    }
}
