//! Reduction of raw sensor readings into one encoded measurement
//!
//! The DHT11 occasionally reports a value far off the true one, so several
//! readings are taken per measurement and the one with the median humidity is
//! kept. Its temperature travels with it; temperature is not filtered on its
//! own.

use alloc::vec::Vec;

use log::debug;
use thiserror_no_std::Error;

use crate::sensors::{HumTempReading, Humidity, Temperature};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementError {
    #[error("no samples collected for this measurement")]
    Empty,
}

/// Humidity and temperature packed into 32 bits, each in tenths.
///
/// Bit layout: humidity in bits 31..16, temperature in bits 15..0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedMeasurement(u32);

impl EncodedMeasurement {
    pub const fn new(humidity: Humidity, temperature: Temperature) -> Self {
        Self(((humidity.tenths() as u32) << 16) | temperature.tenths() as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn humidity_tenths(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn temperature_tenths(self) -> u16 {
        self.0 as u16
    }
}

impl From<HumTempReading> for EncodedMeasurement {
    fn from(reading: HumTempReading) -> Self {
        Self::new(reading.humidity, reading.temperature)
    }
}

/// Readings collected during one measurement.
#[derive(Debug, Default)]
pub struct SampleBatch {
    samples: Vec<HumTempReading>,
    capacity: usize,
}

impl SampleBatch {
    pub fn new(expected_count: usize) -> Self {
        let mut batch = Self::default();
        batch.init(expected_count);
        batch
    }

    /// Start a new batch for `expected_count` readings, discarding the old one.
    ///
    /// Running out of memory here aborts; there is no degraded mode without a
    /// sample buffer.
    pub fn init(&mut self, expected_count: usize) {
        self.samples = Vec::with_capacity(expected_count);
        self.capacity = expected_count;
    }

    /// Append a reading. Readings beyond the batch capacity are dropped.
    pub fn add(&mut self, humidity: Humidity, temperature: Temperature) {
        if self.samples.len() >= self.capacity {
            debug!("sample batch full ({}), reading dropped", self.capacity);
            return;
        }
        self.samples.push(HumTempReading {
            humidity,
            temperature,
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Reduce the batch to one encoded value and empty it.
    ///
    /// One or two readings: the first one wins. More: the reading with the
    /// median humidity wins, temperature included.
    pub fn reduce(&mut self) -> Result<EncodedMeasurement, MeasurementError> {
        if self.samples.is_empty() {
            return Err(MeasurementError::Empty);
        }

        let chosen = if self.samples.len() > 2 {
            insertion_sort_by_humidity(&mut self.samples);
            self.samples[self.samples.len() / 2]
        } else {
            self.samples[0]
        };

        self.samples.clear();
        Ok(chosen.into())
    }
}

/// Stable, in place. Batches are a handful of readings.
fn insertion_sort_by_humidity(samples: &mut [HumTempReading]) {
    for i in 1..samples.len() {
        let mut j = i;
        while j > 0 && samples[j - 1].humidity.tenths() > samples[j].humidity.tenths() {
            samples.swap(j - 1, j);
            j -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::FixedPoint;

    fn fp(integer: u8, decimal: u8) -> FixedPoint {
        FixedPoint::new(integer, decimal)
    }

    #[test]
    fn test_encoding_layout() {
        let m = EncodedMeasurement::new(fp(45, 3), fp(23, 1));
        assert_eq!(m.raw(), (453 << 16) | 231);
        assert_eq!(m.humidity_tenths(), 453);
        assert_eq!(m.temperature_tenths(), 231);
    }

    #[test]
    fn test_empty_batch_fails() {
        let mut batch = SampleBatch::new(3);
        assert_eq!(batch.reduce(), Err(MeasurementError::Empty));
    }

    #[test]
    fn test_median_by_humidity_in_any_order() {
        let orders = [[44, 45, 46], [46, 44, 45], [45, 46, 44], [46, 45, 44]];

        for order in orders {
            let mut batch = SampleBatch::new(3);
            for h in order {
                // temperature tags which record was picked
                batch.add(fp(h, 0), fp(h - 20, 0));
            }
            assert_eq!(
                batch.reduce(),
                Ok(EncodedMeasurement::new(fp(45, 0), fp(25, 0))),
                "order {:?}",
                order
            );
        }
    }

    #[test]
    fn test_temperature_follows_median_humidity_record() {
        let mut batch = SampleBatch::new(3);
        batch.add(fp(40, 0), fp(30, 0));
        batch.add(fp(50, 0), fp(10, 0));
        batch.add(fp(60, 0), fp(20, 0));

        // Independent medians would give 50 / 20
        let m = batch.reduce().unwrap();
        assert_eq!(m.humidity_tenths(), 500);
        assert_eq!(m.temperature_tenths(), 100);
    }

    #[test]
    fn test_two_samples_return_first() {
        let mut batch = SampleBatch::new(2);
        batch.add(fp(70, 0), fp(21, 5));
        batch.add(fp(30, 0), fp(19, 0));
        assert_eq!(
            batch.reduce(),
            Ok(EncodedMeasurement::new(fp(70, 0), fp(21, 5)))
        );
    }

    #[test]
    fn test_add_beyond_capacity_is_ignored() {
        let mut batch = SampleBatch::new(1);
        batch.add(fp(10, 0), fp(10, 0));
        batch.add(fp(90, 0), fp(90, 0));
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.reduce(),
            Ok(EncodedMeasurement::new(fp(10, 0), fp(10, 0)))
        );
    }

    #[test]
    fn test_reduce_empties_batch() {
        let mut batch = SampleBatch::new(3);
        batch.add(fp(10, 0), fp(10, 0));
        assert!(batch.reduce().is_ok());
        assert!(batch.is_empty());
        assert_eq!(batch.reduce(), Err(MeasurementError::Empty));
    }
}
