pub mod dht11;

use thiserror_no_std::Error;

pub use dht11::{DecoderShared, Dht11, SensorLine};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor}: no complete frame within the read timeout")]
    Timeout { sensor: &'static str },
    #[error("{sensor}: checksum mismatch, frame says {expected} but bytes sum to {computed}")]
    Checksum {
        sensor: &'static str,
        expected: u8,
        computed: u16,
    },
}

/// Trait for sensor reading data structures.
/// Provides compile-time guarantees about the number of values and their conversion to arrays.
pub trait SensorReadings<const COUNT: usize> {
    /// Convert the readings into a fixed-size array.
    fn to_array(self) -> [i32; COUNT];
}

/// Trait for sensors that produce typed readings.
pub trait Sensor<const COUNT: usize> {
    /// The type of readings this sensor produces.
    type Readings: SensorReadings<COUNT>;

    /// Read the sensor and return typed readings.
    fn read(&mut self) -> impl Future<Output = Result<Self::Readings, SensorError>>;
}

/// One-decimal fixed-point value as reported by the DHT11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedPoint {
    /// Integral part
    pub integer: u8,
    /// Tenths (base ten, 0-9 in practice)
    pub decimal: u8,
}

impl FixedPoint {
    pub const fn new(integer: u8, decimal: u8) -> Self {
        Self { integer, decimal }
    }

    /// Value in tenths, e.g. 45.3 -> 453.
    pub const fn tenths(self) -> u16 {
        self.integer as u16 * 10 + self.decimal as u16
    }
}

impl core::fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.integer, self.decimal)
    }
}

pub type Humidity = FixedPoint;
pub type Temperature = FixedPoint;

/// Typed readings from a humidity/temperature sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumTempReading {
    pub humidity: Humidity,
    pub temperature: Temperature,
}

impl SensorReadings<2> for HumTempReading {
    fn to_array(self) -> [i32; 2] {
        [
            self.humidity.tenths() as i32,
            self.temperature.tenths() as i32,
        ]
    }
}
