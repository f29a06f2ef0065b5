//! Measurement cycle: sensor reads, reduction and reporting
//!
//! A measurement collects `samples_per_measure` good readings, tolerating read
//! failures up to twice that many attempts, and reduces them to the median.
//! [`run_measurements`] repeats this for one wake period and reports every
//! outcome, so the consumer can tell a failed measurement from a missing one.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Sender;
use embassy_time::Timer;
use log::{debug, info, warn};

use crate::config::NodeConfig;
use crate::measurement::{EncodedMeasurement, SampleBatch};
use crate::sensors::{HumTempReading, Sensor};

/// Reports queued between the measurement task and the consumer.
pub const REPORT_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementReport {
    Measured(EncodedMeasurement),
    /// No good reading within the attempt budget
    Failed,
    /// All measurements of this wake period are done
    Finished,
}

/// Take one measurement.
///
/// Every read, good or bad, is followed by the configured retry delay; the
/// DHT11 needs that long to settle between transactions.
pub async fn measure<S>(sensor: &mut S, config: &NodeConfig, batch: &mut SampleBatch) -> MeasurementReport
where
    S: Sensor<2, Readings = HumTempReading>,
{
    let wanted = config.samples_per_measure as usize;
    batch.init(wanted);

    let mut attempts = 0;
    while batch.len() < wanted && attempts < config.max_read_attempts() {
        attempts += 1;

        match sensor.read().await {
            Ok(reading) => {
                info!("{} C {} rh", reading.temperature, reading.humidity);
                batch.add(reading.humidity, reading.temperature);
            }
            Err(e) => warn!("read {} failed: {}", attempts, e),
        }

        Timer::after(config.retry_delay()).await;
    }

    match batch.reduce() {
        Ok(encoded) => {
            debug!(
                "measurement {:#010x} from {} attempts",
                encoded.raw(),
                attempts
            );
            MeasurementReport::Measured(encoded)
        }
        Err(e) => {
            warn!("measurement failed: {}", e);
            MeasurementReport::Failed
        }
    }
}

/// Run the measurements of one wake period, then report [`MeasurementReport::Finished`].
///
/// With `measures_per_sleep == 0` this never returns.
pub async fn run_measurements<S, M, const N: usize>(
    sensor: &mut S,
    config: &NodeConfig,
    reports: Sender<'_, M, MeasurementReport, N>,
) where
    S: Sensor<2, Readings = HumTempReading>,
    M: RawMutex,
{
    let mut batch = SampleBatch::new(config.samples_per_measure as usize);
    let mut taken = 0u32;

    loop {
        let report = measure(sensor, config, &mut batch).await;
        reports.send(report).await;
        taken += 1;

        if config.sleep_due(taken) {
            break;
        }

        Timer::after(config.measure_period()).await;
    }

    info!("{} measurements done", taken);
    reports.send(MeasurementReport::Finished).await;
}
