//! Retained scratch region shared by the timestamp and the hot tier
//!
//! A few hundred bytes of memory survive deep sleep but not power loss. The
//! region is laid out as 32-bit words:
//!
//! | word        | content                          |
//! |-------------|----------------------------------|
//! | 0           | magic marker [`RETAINED_MAGIC`]  |
//! | 1           | saved timestamp seconds          |
//! | 2 + 2i      | hot slot `i` timestamp           |
//! | 3 + 2i      | hot slot `i` data                |
//!
//! The marker is the single validity flag for the whole region. It is checked
//! once in [`RetainedRegion::attach`]; when missing, every word is cleared and
//! the marker is written last.

use core::sync::atomic::{AtomicU32, Ordering};

use log::info;

use crate::storage::StorageSample;

pub const RETAINED_MAGIC: u32 = 0x1331_defe;

const MAGIC_WORD: usize = 0;
const TIMESTAMP_WORD: usize = 1;
const HOT_TIER_WORD: usize = 2;

/// Words needed for a region with `hot_capacity` hot slots.
pub const fn retained_words(hot_capacity: usize) -> usize {
    HOT_TIER_WORD + hot_capacity * 2
}

/// Word-addressed memory that survives deep sleep.
pub trait ScratchMemory {
    fn word_count(&self) -> usize;
    fn read_word(&self, index: usize) -> u32;
    fn write_word(&self, index: usize, value: u32);
}

impl<T: ScratchMemory> ScratchMemory for &T {
    fn word_count(&self) -> usize {
        (**self).word_count()
    }

    fn read_word(&self, index: usize) -> u32 {
        (**self).read_word(index)
    }

    fn write_word(&self, index: usize, value: u32) {
        (**self).write_word(index, value)
    }
}

/// How the region was found at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    /// Marker missing: power-on or reset, region freshly cleared
    ColdStart,
    /// Marker present: woke from deep sleep with the region intact
    Resumed,
}

/// Typed view over the scratch words for a hot tier of `HOT` slots.
pub struct RetainedRegion<'a, M, const HOT: usize> {
    memory: &'a M,
    boot: BootKind,
}

impl<M, const HOT: usize> Clone for RetainedRegion<'_, M, HOT> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M, const HOT: usize> Copy for RetainedRegion<'_, M, HOT> {}

impl<'a, M: ScratchMemory, const HOT: usize> RetainedRegion<'a, M, HOT> {
    /// Validate the region, clearing it when the marker is missing.
    ///
    /// # Panics
    /// If `memory` is smaller than [`retained_words`]`(HOT)`.
    pub fn attach(memory: &'a M) -> Self {
        assert!(
            memory.word_count() >= retained_words(HOT),
            "scratch memory too small for {} hot slots",
            HOT
        );

        let boot = if memory.read_word(MAGIC_WORD) == RETAINED_MAGIC {
            BootKind::Resumed
        } else {
            info!("retained region invalid, initializing");
            for index in TIMESTAMP_WORD..retained_words(HOT) {
                memory.write_word(index, 0);
            }
            memory.write_word(MAGIC_WORD, RETAINED_MAGIC);
            BootKind::ColdStart
        };

        Self { memory, boot }
    }

    pub fn boot_kind(&self) -> BootKind {
        self.boot
    }

    pub fn saved_seconds(&self) -> u32 {
        self.memory.read_word(TIMESTAMP_WORD)
    }

    /// Store the timestamp and (re)write the marker.
    pub fn save_seconds(&self, seconds: u32) {
        self.memory.write_word(TIMESTAMP_WORD, seconds);
        self.memory.write_word(MAGIC_WORD, RETAINED_MAGIC);
    }

    pub fn slot(&self, index: usize) -> StorageSample {
        let word = HOT_TIER_WORD + index * 2;
        StorageSample::new(self.memory.read_word(word), self.memory.read_word(word + 1))
    }

    pub fn set_slot(&self, index: usize, sample: StorageSample) {
        let word = HOT_TIER_WORD + index * 2;
        self.memory.write_word(word, sample.timestamp);
        self.memory.write_word(word + 1, sample.data);
    }

    /// Index of the first empty hot slot.
    pub fn first_free_slot(&self) -> Option<usize> {
        (0..HOT).find(|&index| self.slot(index).is_empty())
    }

    pub fn hot_tier_image(&self) -> [StorageSample; HOT] {
        core::array::from_fn(|index| self.slot(index))
    }

    pub fn clear_hot_tier(&self) {
        for index in 0..HOT {
            self.set_slot(index, StorageSample::EMPTY);
        }
    }

    pub fn hot_len(&self) -> usize {
        (0..HOT).filter(|&index| !self.slot(index).is_empty()).count()
    }
}

/// Plain word array usable as [`ScratchMemory`].
///
/// Backs the region in the simulator and tests. Its contents persist for as
/// long as the value lives, which models deep sleep; [`ScratchWords::power_loss`]
/// models the region decaying when the supply is removed.
#[derive(Debug)]
pub struct ScratchWords<const N: usize> {
    words: [AtomicU32; N],
}

impl<const N: usize> Default for ScratchWords<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ScratchWords<N> {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU32::new(0) }; N],
        }
    }

    /// Fill every word with `pattern`, destroying the marker.
    pub fn power_loss(&self, pattern: u32) {
        for word in &self.words {
            word.store(pattern, Ordering::Relaxed);
        }
    }
}

impl<const N: usize> ScratchMemory for ScratchWords<N> {
    fn word_count(&self) -> usize {
        N
    }

    fn read_word(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    fn write_word(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }
}
