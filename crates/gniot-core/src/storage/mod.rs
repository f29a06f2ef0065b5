pub mod memory;
pub mod queue;

pub use memory::MemoryBlobStore;
pub use queue::{QueueError, SampleQueue};

use thiserror_no_std::Error;

/// Hot tier slots kept in retained memory.
///
/// With [`retained_words`](crate::retained::retained_words) this is 128 words
/// (512 bytes), the size of the user RTC area on the first generation of nodes.
pub const HOT_TIER_CAPACITY: usize = 63;

/// Rotating cold banks in non-volatile storage.
pub const COLD_BANKS: usize = 8;

/// Timestamped measurement as it is persisted and delivered.
///
/// Size: 8 bytes
///
/// Binary format (little-endian):
/// - timestamp: 4 bytes (u32 seconds)
/// - data: 4 bytes (encoded measurement)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StorageSample {
    pub timestamp: u32,
    pub data: u32,
}

impl StorageSample {
    /// Marks an unoccupied slot.
    pub const EMPTY: Self = Self {
        timestamp: 0,
        data: 0,
    };

    pub const SIZE: usize = 8;

    pub const fn new(timestamp: u32, data: u32) -> Self {
        Self { timestamp, data }
    }

    pub const fn is_empty(&self) -> bool {
        self.timestamp == 0 && self.data == 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.data.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut timestamp_bytes = [0u8; 4];
        timestamp_bytes.copy_from_slice(&bytes[0..4]);
        let mut data_bytes = [0u8; 4];
        data_bytes.copy_from_slice(&bytes[4..8]);

        Self {
            timestamp: u32::from_le_bytes(timestamp_bytes),
            data: u32::from_le_bytes(data_bytes),
        }
    }
}

/// Failure of the non-volatile store. Never recoverable at the queue level.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is not open")]
    NotOpen,
    #[error("failed to open store: {details}")]
    OpenFailed { details: &'static str },
    #[error("failed to read {key}: {details}")]
    ReadFailed {
        key: &'static str,
        details: &'static str,
    },
    #[error("failed to write {key}: {details}")]
    WriteFailed {
        key: &'static str,
        details: &'static str,
    },
    #[error("failed to erase {key}: {details}")]
    EraseFailed {
        key: &'static str,
        details: &'static str,
    },
    #[error("failed to commit: {details}")]
    CommitFailed { details: &'static str },
}

/// Key/value store of named fixed-size blobs that survives power loss.
///
/// Writes become durable at [`BlobStore::commit`]. All other calls require
/// the store to be open.
pub trait BlobStore {
    fn open(&mut self) -> Result<(), StoreError>;

    /// Read `key` into `buf`. `Ok(false)` when the key does not exist.
    fn get(&mut self, key: &'static str, buf: &mut [u8]) -> Result<bool, StoreError>;

    fn set(&mut self, key: &'static str, data: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn erase(&mut self, key: &'static str) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn close(&mut self);
}

impl<T: BlobStore> BlobStore for &mut T {
    fn open(&mut self) -> Result<(), StoreError> {
        (**self).open()
    }

    fn get(&mut self, key: &'static str, buf: &mut [u8]) -> Result<bool, StoreError> {
        (**self).get(key, buf)
    }

    fn set(&mut self, key: &'static str, data: &[u8]) -> Result<(), StoreError> {
        (**self).set(key, data)
    }

    fn erase(&mut self, key: &'static str) -> Result<(), StoreError> {
        (**self).erase(key)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        (**self).commit()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

const BANK_KEYS: [&str; 16] = [
    "bank0", "bank1", "bank2", "bank3", "bank4", "bank5", "bank6", "bank7", "bank8", "bank9",
    "bank10", "bank11", "bank12", "bank13", "bank14", "bank15",
];

/// Store key of cold bank `index`.
pub const fn bank_key(index: usize) -> &'static str {
    BANK_KEYS[index]
}

/// Most banks a queue can rotate through.
pub const MAX_COLD_BANKS: usize = BANK_KEYS.len();
