//! Retained scratch words in RTC fast memory
//!
//! RTC fast memory stays powered in deep sleep. The `persistent` placement
//! keeps the startup code from zeroing it, so after power-on it holds garbage
//! until the retained region marker check clears it.

use core::sync::atomic::{AtomicBool, Ordering};

use gniot_core::retained::{ScratchMemory, retained_words};
use gniot_core::storage::HOT_TIER_CAPACITY;

pub const RTC_WORDS: usize = retained_words(HOT_TIER_CAPACITY);

#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut RETAINED: [u32; RTC_WORDS] = [0; RTC_WORDS];

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Exclusive handle to the retained words.
#[derive(Debug)]
pub struct RtcFastWords {
    _private: (),
}

impl RtcFastWords {
    /// The handle, once per boot.
    pub fn take() -> Option<Self> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self { _private: () })
        }
    }

    fn word(index: usize) -> *mut u32 {
        assert!(index < RTC_WORDS, "retained word {} out of range", index);
        // SAFETY: in bounds, and only the single handle reaches the array.
        unsafe { (&raw mut RETAINED).cast::<u32>().add(index) }
    }
}

impl ScratchMemory for RtcFastWords {
    fn word_count(&self) -> usize {
        RTC_WORDS
    }

    fn read_word(&self, index: usize) -> u32 {
        // SAFETY: see `word`; volatile so every access reaches RTC memory.
        unsafe { Self::word(index).read_volatile() }
    }

    fn write_word(&self, index: usize, value: u32) {
        // SAFETY: see `word`.
        unsafe { Self::word(index).write_volatile(value) }
    }
}
