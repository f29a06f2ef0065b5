//! Two-tier durable FIFO of undelivered samples
//!
//! New samples land in the hot tier, `HOT` slots of retained memory that
//! survive deep sleep. When the hot tier is full its whole image is flushed
//! into one of `BANKS` cold banks in the blob store, which survive power loss.
//! Banks rotate as a ring: once all are written, a flush overwrites the oldest
//! one, evicting exactly `HOT` samples.
//!
//! ## Retention
//!
//! At most `HOT + BANKS * HOT` samples are held. Appending never fails on
//! capacity; only store I/O errors surface.
//!
//! ## Reading
//!
//! A session ([`SampleQueue::begin_session`] .. [`SampleQueue::end_session`])
//! yields every retained sample oldest first: cold banks from the oldest one,
//! then the hot tier.

use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::{BlobStore, MAX_COLD_BANKS, StorageSample, StoreError, bank_key};
use crate::retained::{RetainedRegion, ScratchMemory};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("no more samples")]
    Exhausted,
    #[error("no read session open")]
    SessionClosed,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Position of the bank ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct BankCursor {
    oldest: usize,
    written: usize,
}

impl BankCursor {
    fn next_free(&self, banks: usize) -> usize {
        if self.written < banks {
            self.written
        } else {
            self.oldest
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadCursor {
    /// `offset` banks past the oldest one
    Bank { offset: usize, slot: usize },
    Hot { slot: usize },
    Done,
}

pub struct SampleQueue<'a, M, S, const HOT: usize, const BANKS: usize> {
    region: RetainedRegion<'a, M, HOT>,
    store: S,
    /// `None` until the banks have been scanned since boot
    banks: Option<BankCursor>,
    session_open: bool,
    read: ReadCursor,
    bank_image: [StorageSample; HOT],
    loaded_bank: Option<usize>,
}

impl<'a, M, S, const HOT: usize, const BANKS: usize> SampleQueue<'a, M, S, HOT, BANKS>
where
    M: ScratchMemory,
    S: BlobStore,
{
    /// Bank blob size in bytes.
    pub const BANK_BYTES: usize = HOT * StorageSample::SIZE;

    /// Most samples the queue retains.
    pub const CAPACITY: usize = HOT + BANKS * HOT;

    pub fn new(region: RetainedRegion<'a, M, HOT>, store: S) -> Self {
        const {
            assert!(HOT > 0, "hot tier needs at least one slot");
            assert!(
                BANKS > 0 && BANKS <= MAX_COLD_BANKS,
                "unsupported cold bank count"
            );
        }

        Self {
            region,
            store,
            banks: None,
            session_open: false,
            read: ReadCursor::Done,
            bank_image: [StorageSample::EMPTY; HOT],
            loaded_bank: None,
        }
    }

    /// Open the store and position the read cursor on the oldest sample.
    pub fn begin_session(&mut self) -> Result<(), StoreError> {
        self.store.open()?;
        self.session_open = true;
        self.read = ReadCursor::Bank { offset: 0, slot: 0 };
        self.loaded_bank = None;

        match self.scan_banks() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.store.close();
                self.session_open = false;
                self.read = ReadCursor::Done;
                Err(e)
            }
        }
    }

    /// Store `sample`, flushing the hot tier to a cold bank when it is full.
    pub fn append(&mut self, sample: StorageSample) -> Result<(), StoreError> {
        if sample.is_empty() {
            warn!("refusing to queue a sample indistinguishable from an empty slot");
            return Ok(());
        }

        if let Some(index) = self.region.first_free_slot() {
            self.region.set_slot(index, sample);
            debug!("queued sample {} in hot slot {}", sample.timestamp, index);
            return Ok(());
        }

        self.with_open_store(Self::flush)?;
        self.region.set_slot(0, sample);
        debug!("queued sample {} in hot slot 0", sample.timestamp);

        Ok(())
    }

    /// Next sample, oldest first.
    pub fn next(&mut self) -> Result<StorageSample, QueueError> {
        if !self.session_open {
            return Err(QueueError::SessionClosed);
        }

        loop {
            match self.read {
                ReadCursor::Bank { offset, slot } => {
                    let banks = self.banks.unwrap_or_default();
                    if offset >= banks.written {
                        self.read = ReadCursor::Hot { slot: 0 };
                        continue;
                    }
                    if slot >= HOT {
                        self.read = ReadCursor::Bank {
                            offset: offset + 1,
                            slot: 0,
                        };
                        continue;
                    }

                    let bank = (banks.oldest + offset) % BANKS;
                    if self.loaded_bank != Some(bank) {
                        self.load_bank(bank)?;
                    }

                    self.read = ReadCursor::Bank {
                        offset,
                        slot: slot + 1,
                    };
                    let sample = self.bank_image[slot];
                    if !sample.is_empty() {
                        return Ok(sample);
                    }
                }
                ReadCursor::Hot { slot } => {
                    if slot >= HOT {
                        self.read = ReadCursor::Done;
                        continue;
                    }

                    self.read = ReadCursor::Hot { slot: slot + 1 };
                    let sample = self.region.slot(slot);
                    if !sample.is_empty() {
                        return Ok(sample);
                    }
                }
                ReadCursor::Done => return Err(QueueError::Exhausted),
            }
        }
    }

    /// Close the session, dropping every retained sample when `clear_all`.
    ///
    /// The store is closed even when clearing fails.
    pub fn end_session(&mut self, clear_all: bool) -> Result<(), StoreError> {
        let result = if clear_all {
            self.with_open_store(Self::clear_banks)
        } else {
            Ok(())
        };

        if self.session_open {
            self.store.close();
            self.session_open = false;
        }
        self.read = ReadCursor::Done;
        self.loaded_bank = None;

        if clear_all && result.is_ok() {
            self.region.clear_hot_tier();
            info!("sample backlog cleared");
        }

        result
    }

    /// Samples currently in the hot tier.
    pub fn hot_len(&self) -> usize {
        self.region.hot_len()
    }

    /// Cold banks holding data, if known since boot.
    pub fn banks_written(&self) -> Option<usize> {
        self.banks.map(|banks| banks.written)
    }

    pub fn is_session_open(&self) -> bool {
        self.session_open
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Run `op` with the store open, opening and closing it around `op` when
    /// no session holds it.
    fn with_open_store<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let opened_here = !self.session_open;
        if opened_here {
            self.store.open()?;
        }

        let result = op(self);

        if opened_here {
            self.store.close();
        }
        result
    }

    /// Rebuild the bank cursor from the banks present in the store.
    ///
    /// Until the ring is full, flushes fill banks in index order from bank 0,
    /// so the cursor walks `0..written` whatever the timestamps say; they
    /// restart from zero after a power loss. Only a full ring is ordered by
    /// the first timestamp of each bank.
    fn scan_banks(&mut self) -> Result<(), StoreError> {
        let mut end = 0;
        let mut oldest = 0;
        let mut oldest_timestamp = u32::MAX;

        for bank in 0..BANKS {
            if !self.load_bank(bank)? {
                continue;
            }
            end = bank + 1;

            let first = self.bank_image[0].timestamp;
            if first < oldest_timestamp {
                oldest_timestamp = first;
                oldest = bank;
            }
        }

        let cursor = if end < BANKS {
            BankCursor {
                oldest: 0,
                written: end,
            }
        } else {
            BankCursor {
                oldest,
                written: BANKS,
            }
        };

        debug!(
            "bank scan: {} written, oldest {}",
            cursor.written, cursor.oldest
        );
        self.banks = Some(cursor);
        Ok(())
    }

    /// Read bank `bank` into the bank image. A missing bank reads as empty.
    fn load_bank(&mut self, bank: usize) -> Result<bool, StoreError> {
        let mut bytes = [0u8; 8];
        let mut buffer = alloc::vec![0u8; Self::BANK_BYTES];

        let found = self.store.get(bank_key(bank), &mut buffer).map_err(|e| {
            error!("reading {} failed: {}", bank_key(bank), e);
            e
        })?;

        for (slot, chunk) in buffer.chunks_exact(StorageSample::SIZE).enumerate() {
            bytes.copy_from_slice(chunk);
            self.bank_image[slot] = if found {
                StorageSample::from_bytes(&bytes)
            } else {
                StorageSample::EMPTY
            };
        }
        self.loaded_bank = Some(bank);

        Ok(found)
    }

    /// Move the full hot tier into the next bank and clear it.
    ///
    /// The hot tier is only cleared once the bank is committed.
    fn flush(&mut self) -> Result<(), StoreError> {
        if self.banks.is_none() {
            self.scan_banks()?;
        }
        let mut banks = self.banks.unwrap_or_default();
        let target = banks.next_free(BANKS);

        let mut buffer = alloc::vec![0u8; Self::BANK_BYTES];
        for (sample, chunk) in self
            .region
            .hot_tier_image()
            .iter()
            .zip(buffer.chunks_exact_mut(StorageSample::SIZE))
        {
            chunk.copy_from_slice(&sample.to_bytes());
        }

        self.store
            .set(bank_key(target), &buffer)
            .and_then(|()| self.store.commit())
            .map_err(|e| {
                error!("flushing hot tier to {} failed: {}", bank_key(target), e);
                e
            })?;

        if banks.written < BANKS {
            banks.written += 1;
        } else {
            warn!("cold banks full, evicted {} oldest samples", HOT);
            banks.oldest = (banks.oldest + 1) % BANKS;
        }
        self.banks = Some(banks);
        if self.loaded_bank == Some(target) {
            self.loaded_bank = None;
        }

        self.region.clear_hot_tier();
        info!("hot tier flushed to {}", bank_key(target));
        Ok(())
    }

    fn clear_banks(&mut self) -> Result<(), StoreError> {
        for bank in 0..BANKS {
            self.store.erase(bank_key(bank))?;
        }
        self.store.commit()?;
        self.banks = Some(BankCursor::default());
        Ok(())
    }
}
