//! In-memory [`BlobStore`] for the simulator and tests
//!
//! Writes are staged until [`BlobStore::commit`]; [`MemoryBlobStore::power_loss`]
//! throws away whatever was not committed, which is what flash does when the
//! supply drops mid-transaction.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::trace;

use super::{BlobStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Write(Vec<u8>),
    Erase,
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    committed: BTreeMap<&'static str, Vec<u8>>,
    pending: BTreeMap<&'static str, Pending>,
    open: bool,
    fail_writes: bool,
    fail_open: bool,
    /// Reads left before every [`BlobStore::get`] fails
    reads_left: Option<usize>,
    commits: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Committed contents of `key`.
    pub fn blob(&self, key: &str) -> Option<&[u8]> {
        self.committed.get(key).map(Vec::as_slice)
    }

    /// Number of committed keys.
    pub fn key_count(&self) -> usize {
        self.committed.len()
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Make every following [`BlobStore::set`] fail.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Make every following [`BlobStore::open`] fail.
    pub fn fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    /// Let `reads` more [`BlobStore::get`] calls succeed, then fail every one.
    /// `None` lifts the limit.
    pub fn fail_reads_after(&mut self, reads: Option<usize>) {
        self.reads_left = reads;
    }

    /// Drop uncommitted changes and the open handle.
    pub fn power_loss(&mut self) {
        self.pending.clear();
        self.open = false;
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::NotOpen)
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn open(&mut self) -> Result<(), StoreError> {
        if self.fail_open {
            return Err(StoreError::OpenFailed {
                details: "injected open failure",
            });
        }
        self.open = true;
        Ok(())
    }

    fn get(&mut self, key: &'static str, buf: &mut [u8]) -> Result<bool, StoreError> {
        self.ensure_open()?;
        match self.reads_left.as_mut() {
            Some(0) => {
                return Err(StoreError::ReadFailed {
                    key,
                    details: "injected read failure",
                });
            }
            Some(left) => *left -= 1,
            None => {}
        }

        // Reads see staged writes, like an NVS handle does
        let data = match self.pending.get(key) {
            Some(Pending::Write(data)) => Some(data),
            Some(Pending::Erase) => None,
            None => self.committed.get(key),
        };

        match data {
            Some(data) if data.len() == buf.len() => {
                buf.copy_from_slice(data);
                Ok(true)
            }
            Some(_) => Err(StoreError::ReadFailed {
                key,
                details: "stored blob has a different size",
            }),
            None => Ok(false),
        }
    }

    fn set(&mut self, key: &'static str, data: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.fail_writes {
            return Err(StoreError::WriteFailed {
                key,
                details: "injected write failure",
            });
        }

        trace!("staging {} bytes for {}", data.len(), key);
        self.pending.insert(key, Pending::Write(data.to_vec()));
        Ok(())
    }

    fn erase(&mut self, key: &'static str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.pending.insert(key, Pending::Erase);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        for (key, change) in core::mem::take(&mut self.pending) {
            match change {
                Pending::Write(data) => {
                    self.committed.insert(key, data);
                }
                Pending::Erase => {
                    self.committed.remove(key);
                }
            }
        }
        self.commits += 1;
        Ok(())
    }

    fn close(&mut self) {
        // Closing without commit discards staged changes
        self.pending.clear();
        self.open = false;
    }
}
