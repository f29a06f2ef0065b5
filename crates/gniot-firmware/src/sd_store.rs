//! Cold banks as files on the SD card
//!
//! Each bank key maps to an 8.3 file in the root directory (`bank3` ->
//! `BANK3.BIN`). Writes and erases are staged in RAM and applied at
//! [`BlobStore::commit`]; closing the store without committing drops them.
//!
//! SD card operations are blocking, like every other transfer on this SPI bus.

use alloc::vec::Vec;
use core::fmt::Write;

use embedded_sdmmc::{Mode, SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use gniot_core::storage::{BlobStore, MAX_COLD_BANKS, StoreError};
use heapless::String;
use log::{debug, error};

type SdError = embedded_sdmmc::Error<SdCardError>;

enum Staged {
    Write(Vec<u8>),
    Erase,
}

pub struct SdBlobStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
    staged: heapless::Vec<(&'static str, Staged), MAX_COLD_BANKS>,
    open: bool,
}

impl<S, D, T> SdBlobStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        Self {
            volume_mgr: VolumeManager::new(sd_card, ts),
            staged: heapless::Vec::new(),
            open: false,
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::NotOpen)
        }
    }

    fn stage(&mut self, key: &'static str, change: Staged) -> Result<(), StoreError> {
        if let Some(entry) = self.staged.iter_mut().find(|(staged, _)| *staged == key) {
            entry.1 = change;
            return Ok(());
        }

        self.staged.push((key, change)).map_err(|_| {
            error!("too many staged changes, {} not written", key);
            StoreError::WriteFailed {
                key,
                details: "too many staged changes",
            }
        })
    }

    fn read_file(&self, key: &'static str, buf: &mut [u8]) -> Result<bool, SdError> {
        let name = file_name(key);
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let file = match root_dir.open_file_in_dir(name.as_str(), Mode::ReadOnly) {
            Ok(file) => file,
            Err(embedded_sdmmc::Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };

        if file.length() as usize != buf.len() {
            return Err(embedded_sdmmc::Error::EndOfFile);
        }

        let mut filled = 0;
        while filled < buf.len() {
            let read = file.read(&mut buf[filled..])?;
            if read == 0 {
                return Err(embedded_sdmmc::Error::EndOfFile);
            }
            filled += read;
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(true)
    }

    fn apply(&self, key: &'static str, change: &Staged) -> Result<(), SdError> {
        let name = file_name(key);
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        match change {
            Staged::Write(data) => {
                let file =
                    root_dir.open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)?;
                file.write(data)?;
                file.close()?;
            }
            Staged::Erase => match root_dir.delete_file_in_dir(name.as_str()) {
                Ok(()) | Err(embedded_sdmmc::Error::NotFound) => {}
                Err(e) => return Err(e),
            },
        }

        root_dir.close()?;
        volume0.close()?;
        Ok(())
    }
}

impl<S, D, T> BlobStore for SdBlobStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    fn open(&mut self) -> Result<(), StoreError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(|e| {
            error!("Failed to open SD volume: {:?}", e);
            StoreError::OpenFailed {
                details: "SD volume unavailable",
            }
        })?;
        volume0.close().map_err(|e| {
            error!("Failed to close SD volume: {:?}", e);
            StoreError::OpenFailed {
                details: "SD volume unavailable",
            }
        })?;

        self.open = true;
        Ok(())
    }

    fn get(&mut self, key: &'static str, buf: &mut [u8]) -> Result<bool, StoreError> {
        self.ensure_open()?;

        match self.staged.iter().find(|(staged, _)| *staged == key) {
            Some((_, Staged::Write(data))) if data.len() == buf.len() => {
                buf.copy_from_slice(data);
                return Ok(true);
            }
            Some((_, Staged::Write(_))) => {
                return Err(StoreError::ReadFailed {
                    key,
                    details: "staged blob has a different size",
                });
            }
            Some((_, Staged::Erase)) => return Ok(false),
            None => {}
        }

        self.read_file(key, buf).map_err(|e| {
            error!("Failed to read {} from SD: {:?}", key, e);
            StoreError::ReadFailed {
                key,
                details: "SD read error",
            }
        })
    }

    fn set(&mut self, key: &'static str, data: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.stage(key, Staged::Write(data.to_vec()))
    }

    fn erase(&mut self, key: &'static str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.stage(key, Staged::Erase)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        for &(key, ref change) in self.staged.iter() {
            self.apply(key, change).map_err(|e| {
                error!("Failed to commit {} to SD: {:?}", key, e);
                match change {
                    Staged::Write(_) => StoreError::CommitFailed {
                        details: "SD write error",
                    },
                    Staged::Erase => StoreError::EraseFailed {
                        key,
                        details: "SD delete error",
                    },
                }
            })?;
        }

        debug!("committed {} staged changes", self.staged.len());
        self.staged.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.staged.clear();
        self.open = false;
    }
}

/// `bank3` -> `BANK3.BIN`
fn file_name(key: &str) -> String<12> {
    let mut name = String::new();
    // Bank keys are at most six characters, the result always fits
    let _ = write!(name, "{}.BIN", key);
    name.as_mut_str().make_ascii_uppercase();
    name
}

/// Fixed file timestamps; the node has no calendar time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 51,
            zero_indexed_month: 1,
            zero_indexed_day: 12,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}
