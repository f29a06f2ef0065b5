//! Consumer side of the measurement cycle
//!
//! Every measurement is timestamped and delivered right away. When the server
//! cannot be reached the sample goes to the persistent queue instead, and the
//! backlog is replayed oldest first after the next delivery that succeeds.

use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::clock::CycleCounter;
use crate::cycle::MeasurementReport;
use crate::retained::ScratchMemory;
use crate::storage::{BlobStore, QueueError, SampleQueue, StorageSample, StoreError};
use crate::timestamp::TimestampService;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkError {
    #[error("server unreachable: {details}")]
    Unreachable { details: &'static str },
    #[error("server rejected the request: {details}")]
    Rejected { details: &'static str },
}

/// Transport to the collecting server.
pub trait Uplink {
    /// Send one timestamped measurement.
    fn deliver(&mut self, sample: &StorageSample) -> impl Future<Output = Result<(), UplinkError>>;

    /// Tell the server the node is alive without a measurement.
    fn heartbeat(&mut self) -> impl Future<Output = Result<(), UplinkError>>;
}

impl<T: Uplink> Uplink for &mut T {
    fn deliver(&mut self, sample: &StorageSample) -> impl Future<Output = Result<(), UplinkError>> {
        (**self).deliver(sample)
    }

    fn heartbeat(&mut self) -> impl Future<Output = Result<(), UplinkError>> {
        (**self).heartbeat()
    }
}

/// What the caller does after a report was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Wait for the next report
    Continue,
    /// Wake period over: persist the clock and deep-sleep
    Sleep,
}

/// Totals since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub delivered: u32,
    pub replayed: u32,
    pub queued: u32,
    pub heartbeats: u32,
}

pub struct ReportService<U> {
    uplink: U,
    stats: ServiceStats,
}

impl<U: Uplink> ReportService<U> {
    pub fn new(uplink: U) -> Self {
        Self {
            uplink,
            stats: ServiceStats::default(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    pub fn uplink_mut(&mut self) -> &mut U {
        &mut self.uplink
    }

    /// Handle one report from the measurement cycle.
    ///
    /// Store errors are logged and returned. A sample whose append failed is
    /// lost; the caller keeps handling reports regardless.
    pub async fn handle<C, M, S, const HOT: usize, const BANKS: usize>(
        &mut self,
        report: MeasurementReport,
        clock: &mut TimestampService<'_, C, M, HOT>,
        queue: &mut SampleQueue<'_, M, S, HOT, BANKS>,
    ) -> Result<Flow, StoreError>
    where
        C: CycleCounter,
        M: ScratchMemory,
        S: BlobStore,
    {
        match report {
            MeasurementReport::Measured(encoded) => {
                let sample = StorageSample::new(clock.now(), encoded.raw());
                self.publish(sample, queue).await?;
                Ok(Flow::Continue)
            }
            MeasurementReport::Failed => {
                info!("measurement failed, sending heartbeat");
                match self.uplink.heartbeat().await {
                    Ok(()) => self.stats.heartbeats += 1,
                    Err(e) => warn!("heartbeat failed: {}", e),
                }
                Ok(Flow::Continue)
            }
            MeasurementReport::Finished => Ok(Flow::Sleep),
        }
    }

    async fn publish<M, S, const HOT: usize, const BANKS: usize>(
        &mut self,
        sample: StorageSample,
        queue: &mut SampleQueue<'_, M, S, HOT, BANKS>,
    ) -> Result<(), StoreError>
    where
        M: ScratchMemory,
        S: BlobStore,
    {
        match self.uplink.deliver(&sample).await {
            Ok(()) => {
                self.stats.delivered += 1;
                debug!("delivered sample {}", sample.timestamp);
                self.replay_backlog(queue).await
            }
            Err(e) => {
                warn!("delivery failed ({}), queueing sample {}", e, sample.timestamp);
                queue.append(sample).map_err(|e| {
                    error!("failed to queue sample {}: {}", sample.timestamp, e);
                    e
                })?;
                self.stats.queued += 1;
                Ok(())
            }
        }
    }

    /// Deliver the queued samples oldest first.
    ///
    /// The backlog is cleared only when all of it went out; after a partial
    /// replay the delivered part is sent again next time.
    async fn replay_backlog<M, S, const HOT: usize, const BANKS: usize>(
        &mut self,
        queue: &mut SampleQueue<'_, M, S, HOT, BANKS>,
    ) -> Result<(), StoreError>
    where
        M: ScratchMemory,
        S: BlobStore,
    {
        if queue.hot_len() == 0 && queue.banks_written() == Some(0) {
            return Ok(());
        }

        queue.begin_session().map_err(|e| {
            error!("failed to open sample backlog: {}", e);
            e
        })?;

        let mut replayed = 0u32;
        let complete = loop {
            let sample = match queue.next() {
                Ok(sample) => sample,
                Err(QueueError::Exhausted) => break true,
                Err(QueueError::Store(e)) => {
                    error!("failed to read sample backlog: {}", e);
                    if let Err(close) = queue.end_session(false) {
                        warn!("closing sample backlog failed: {}", close);
                    }
                    return Err(e);
                }
                Err(QueueError::SessionClosed) => break false,
            };

            if let Err(e) = self.uplink.deliver(&sample).await {
                warn!("backlog replay stopped after {} samples: {}", replayed, e);
                break false;
            }
            replayed += 1;
        };

        self.stats.replayed += replayed;
        if complete && replayed > 0 {
            info!("replayed {} queued samples", replayed);
        }

        queue.end_session(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualCounter;
    use crate::config::NodeConfig;
    use crate::measurement::EncodedMeasurement;
    use crate::retained::{RetainedRegion, ScratchWords, retained_words};
    use crate::sensors::FixedPoint;
    use crate::storage::MemoryBlobStore;
    use alloc::vec::Vec;
    use embassy_futures::block_on;

    const HOT: usize = 3;
    const BANKS: usize = 2;
    type Words = ScratchWords<{ retained_words(HOT) }>;

    #[derive(Default)]
    struct RecordingUplink {
        online: bool,
        /// Deliveries allowed before going offline, if limited
        budget: Option<usize>,
        delivered: Vec<StorageSample>,
        heartbeats: usize,
    }

    impl Uplink for RecordingUplink {
        async fn deliver(&mut self, sample: &StorageSample) -> Result<(), UplinkError> {
            if let Some(budget) = self.budget.as_mut() {
                if *budget == 0 {
                    self.online = false;
                } else {
                    *budget -= 1;
                }
            }
            if !self.online {
                return Err(UplinkError::Unreachable { details: "offline" });
            }
            self.delivered.push(*sample);
            Ok(())
        }

        async fn heartbeat(&mut self) -> Result<(), UplinkError> {
            if !self.online {
                return Err(UplinkError::Unreachable { details: "offline" });
            }
            self.heartbeats += 1;
            Ok(())
        }
    }

    fn measured(h: u8) -> MeasurementReport {
        MeasurementReport::Measured(EncodedMeasurement::new(
            FixedPoint::new(h, 0),
            FixedPoint::new(20, 0),
        ))
    }

    struct Node<'a> {
        counter: &'a VirtualCounter,
        clock: TimestampService<'a, &'a VirtualCounter, Words, HOT>,
        queue: SampleQueue<'a, Words, &'a mut MemoryBlobStore, HOT, BANKS>,
        service: ReportService<RecordingUplink>,
    }

    impl<'a> Node<'a> {
        fn boot(
            counter: &'a VirtualCounter,
            memory: &'a Words,
            store: &'a mut MemoryBlobStore,
        ) -> Self {
            let region = RetainedRegion::attach(memory);
            let mut clock = TimestampService::new(counter, region);
            clock.init(&NodeConfig::default());
            Self {
                counter,
                clock,
                queue: SampleQueue::new(region, store),
                service: ReportService::new(RecordingUplink::default()),
            }
        }

        fn report(&mut self, report: MeasurementReport) -> Flow {
            self.counter.advance_secs(60);
            block_on(
                self.service
                    .handle(report, &mut self.clock, &mut self.queue),
            )
            .unwrap()
        }
    }

    #[test]
    fn test_online_delivery_is_immediate() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        let mut node = Node::boot(&counter, &memory, &mut store);
        node.service.uplink_mut().online = true;

        assert_eq!(node.report(measured(45)), Flow::Continue);

        let delivered = &node.service.uplink().delivered;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].timestamp, 60);
        assert_eq!(node.queue.hot_len(), 0);
        assert_eq!(node.service.stats().queued, 0);
    }

    #[test]
    fn test_offline_samples_are_queued_then_replayed_oldest_first() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        let mut node = Node::boot(&counter, &memory, &mut store);

        // Enough to spill into a cold bank
        for h in 40..45 {
            node.report(measured(h));
        }
        assert_eq!(node.service.stats().queued, 5);
        assert!(node.service.uplink().delivered.is_empty());

        node.service.uplink_mut().online = true;
        node.report(measured(50));

        let timestamps: Vec<u32> = node
            .service
            .uplink()
            .delivered
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(timestamps, [360, 60, 120, 180, 240, 300]);
        assert_eq!(node.service.stats().replayed, 5);

        // Backlog cleared
        node.report(measured(51));
        assert_eq!(node.service.uplink().delivered.len(), 7);
        assert_eq!(node.queue.hot_len(), 0);
    }

    #[test]
    fn test_partial_replay_keeps_backlog() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        let mut node = Node::boot(&counter, &memory, &mut store);

        for h in 40..42 {
            node.report(measured(h));
        }

        // Current sample and one backlog sample, then the link drops
        let uplink = node.service.uplink_mut();
        uplink.online = true;
        uplink.budget = Some(2);
        node.report(measured(50));
        assert_eq!(node.queue.hot_len(), 2);

        let uplink = node.service.uplink_mut();
        uplink.online = true;
        uplink.budget = None;
        node.report(measured(51));

        let timestamps: Vec<u32> = node
            .service
            .uplink()
            .delivered
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(timestamps, [180, 60, 240, 60, 120]);
        assert_eq!(node.queue.hot_len(), 0);
    }

    #[test]
    fn test_failed_measurement_sends_heartbeat() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        let mut node = Node::boot(&counter, &memory, &mut store);

        assert_eq!(node.report(MeasurementReport::Failed), Flow::Continue);
        node.service.uplink_mut().online = true;
        assert_eq!(node.report(MeasurementReport::Failed), Flow::Continue);

        assert_eq!(node.service.uplink().heartbeats, 1);
        assert_eq!(node.queue.hot_len(), 0);
    }

    #[test]
    fn test_finished_requests_sleep() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        let mut node = Node::boot(&counter, &memory, &mut store);

        assert_eq!(node.report(MeasurementReport::Finished), Flow::Sleep);
    }

    #[test]
    fn test_store_failure_is_returned() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        store.fail_open(true);
        let mut node = Node::boot(&counter, &memory, &mut store);

        for h in 40..43 {
            node.report(measured(h));
        }

        // Hot tier full, the flush cannot open the store
        let result = block_on(node.service.handle(
            measured(43),
            &mut node.clock,
            &mut node.queue,
        ));
        assert!(matches!(result, Err(StoreError::OpenFailed { .. })));
        assert_eq!(node.queue.hot_len(), HOT);
    }

    #[test]
    fn test_backlog_read_failure_closes_store_and_keeps_samples() {
        let counter = VirtualCounter::new(0);
        let memory = Words::new();
        let mut store = MemoryBlobStore::new();
        let mut node = Node::boot(&counter, &memory, &mut store);

        // bank0 holds 60..180, the hot tier 240
        for h in 40..44 {
            node.report(measured(h));
        }

        // The bank scan succeeds, reading bank0 for replay fails
        node.queue.store_mut().fail_reads_after(Some(BANKS));
        node.service.uplink_mut().online = true;
        let result = block_on(node.service.handle(
            measured(50),
            &mut node.clock,
            &mut node.queue,
        ));

        assert!(matches!(result, Err(StoreError::ReadFailed { .. })));
        assert!(!node.queue.is_session_open());
        assert!(!node.queue.store().is_open());
        assert_eq!(node.queue.hot_len(), 1);
        assert!(node.queue.store().blob("bank0").is_some());
        assert_eq!(node.service.stats().replayed, 0);
    }
}
