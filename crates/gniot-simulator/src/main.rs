//! Desktop simulator for the gniot sensor node.
//!
//! Runs the node's wake periods against simulated hardware: a DHT11 that
//! answers on the data line with real edge timing, a virtual microsecond
//! counter, retained scratch words and an in-memory flash store. The server is
//! unreachable for a few wake periods so the backlog builds up, spills into
//! cold banks and is replayed once the link comes back. One wake period starts
//! from a power loss.
//!
//! # Usage
//!
//! ```text
//! gniot-simulator [WAKE_PERIODS]
//! ```
//!
//! `GNIOT_*` variables override the node configuration like they do for the
//! firmware build. `RUST_LOG=debug` shows decoder and queue detail.

use std::ops::Range;

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use log::{error, info, warn};

use gniot_core::clock::VirtualCounter;
use gniot_core::config::NodeConfig;
use gniot_core::cycle::{MeasurementReport, REPORT_QUEUE_DEPTH, run_measurements};
use gniot_core::measurement::EncodedMeasurement;
use gniot_core::retained::{RetainedRegion, ScratchWords, retained_words};
use gniot_core::sensors::dht11::waveform::{frame_edges, frame_for};
use gniot_core::sensors::{DecoderShared, Dht11, FixedPoint, SensorLine};
use gniot_core::service::{Flow, ReportService, Uplink, UplinkError};
use gniot_core::storage::{MemoryBlobStore, SampleQueue, StorageSample};
use gniot_core::timestamp::TimestampService;

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// Hot tier slots; small so flushes and eviction show up quickly.
const HOT: usize = 4;

/// Cold banks.
const BANKS: usize = 3;

type Words = ScratchWords<{ retained_words(HOT) }>;

const DEFAULT_WAKE_PERIODS: u32 = 8;

/// Wake periods during which the server cannot be reached.
const OFFLINE_WAKES: Range<u32> = 1..5;

/// Wake period that starts from a power loss instead of deep sleep.
const POWER_LOSS_WAKE: u32 = 6;

// ---------------------------------------------------------------------------
// Simulated DHT11
// ---------------------------------------------------------------------------

/// Data line with a DHT11 attached.
///
/// Releasing the armed line plays the sensor's answer into the decoder, one
/// edge at a time on the virtual counter. Some reads misbehave on purpose: no
/// answer, a corrupted checksum, or an outlier that the median has to reject.
struct SimulatedDht<'a> {
    shared: &'a DecoderShared,
    counter: &'a VirtualCounter,
    armed: bool,
    reads: u32,
    /// Simulated seconds since the first wake, drives the climate curve
    elapsed_secs: f64,
}

impl<'a> SimulatedDht<'a> {
    fn new(shared: &'a DecoderShared, counter: &'a VirtualCounter, elapsed_secs: f64) -> Self {
        Self {
            shared,
            counter,
            armed: false,
            reads: 0,
            elapsed_secs,
        }
    }

    fn climate(&self) -> (FixedPoint, FixedPoint) {
        let t = self.elapsed_secs + self.reads as f64 * 2.0;
        let humidity = 50.0 + 10.0 * (t / 900.0).sin() + 1.5 * (t / 110.0).cos();
        let temperature = 22.0 + 3.0 * (t / 1400.0).sin();
        (to_fixed(humidity), to_fixed(temperature))
    }
}

fn to_fixed(value: f64) -> FixedPoint {
    let tenths = (value * 10.0).round().clamp(0.0, 2559.0) as u16;
    FixedPoint::new((tenths / 10) as u8, (tenths % 10) as u8)
}

impl SensorLine for SimulatedDht<'_> {
    fn drive_low(&mut self) {}

    fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.reads += 1;

        if self.reads % 11 == 5 {
            // Sensor did not answer
            return;
        }

        let (mut humidity, temperature) = self.climate();
        if self.reads % 7 == 3 {
            humidity.integer = humidity.integer.saturating_add(30);
        }

        let mut frame = frame_for(humidity, temperature);
        if self.reads % 13 == 7 {
            frame[4] ^= 0x10;
        }

        for edge in frame_edges(&frame) {
            self.counter.advance_micros(edge.after_us);
            self.shared.on_edge(self.counter, edge.high);
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

// ---------------------------------------------------------------------------
// Simulated server
// ---------------------------------------------------------------------------

/// Uplink to a server that records what it receives.
struct SimulatedServer {
    node_id: u32,
    online: bool,
    received: Vec<StorageSample>,
    heartbeats: u32,
}

impl SimulatedServer {
    fn new(node_id: u32) -> Self {
        Self {
            node_id,
            online: true,
            received: Vec::new(),
            heartbeats: 0,
        }
    }

    fn unreachable(&self) -> Result<(), UplinkError> {
        if self.online {
            Ok(())
        } else {
            Err(UplinkError::Unreachable {
                details: "simulated outage",
            })
        }
    }
}

impl Uplink for SimulatedServer {
    async fn deliver(&mut self, sample: &StorageSample) -> Result<(), UplinkError> {
        self.unreachable()?;

        let encoded = EncodedMeasurement::from_raw(sample.data);
        info!(
            "server <- node {} t={} rh={}.{} temp={}.{}",
            self.node_id,
            sample.timestamp,
            encoded.humidity_tenths() / 10,
            encoded.humidity_tenths() % 10,
            encoded.temperature_tenths() / 10,
            encoded.temperature_tenths() % 10
        );
        self.received.push(*sample);
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), UplinkError> {
        self.unreachable()?;
        info!("server <- node {} alive, no measurement", self.node_id);
        self.heartbeats += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn node_config() -> NodeConfig {
    let mut config = NodeConfig {
        measures_per_sleep: 3,
        ..NodeConfig::default()
    };

    for (name, value) in std::env::vars() {
        let Some(key) = name.strip_prefix("GNIOT_") else {
            continue;
        };
        if let Err(e) = config.set(key, &value) {
            warn!("ignoring {} = {:?}: {}", name, value, e);
        }
    }

    if config.measures_per_sleep == 0 {
        warn!("measures_per_sleep = 0 never sleeps, simulating 3 measures per wake");
        config.measures_per_sleep = 3;
    }
    config
}

/// The same cycle without real waiting; simulated time is advanced explicitly.
fn fast_forward(config: &NodeConfig) -> NodeConfig {
    NodeConfig {
        measure_period_secs: 0,
        retry_delay_ms: 0,
        read_timeout_ms: config.read_timeout_ms.min(50),
        ..*config
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let wakes = match std::env::args().nth(1) {
        Some(arg) => arg.parse().unwrap_or_else(|_| {
            warn!("invalid wake period count {:?}, using {}", arg, DEFAULT_WAKE_PERIODS);
            DEFAULT_WAKE_PERIODS
        }),
        None => DEFAULT_WAKE_PERIODS,
    };

    let config = node_config();
    let fast = fast_forward(&config);
    info!(
        "Starting gniot simulator: {} wake periods, {} measures each, hot tier {}, {} banks",
        wakes, config.measures_per_sleep, HOT, BANKS
    );

    // Survive deep sleep: retained words and the flash store
    let memory = Words::new();
    let mut store = MemoryBlobStore::new();
    let shared = DecoderShared::new();
    let mut service = ReportService::new(SimulatedServer::new(config.node_id));
    let mut elapsed_secs = 0.0;

    for wake in 0..wakes {
        if wake == POWER_LOSS_WAKE {
            warn!("--- power lost before wake {} ---", wake);
            memory.power_loss(0xdead_beef);
            store.power_loss();
        }

        service.uplink_mut().online = !OFFLINE_WAKES.contains(&wake);

        // Fresh boot: the counter restarts, retained state is re-attached
        let counter = VirtualCounter::new(0);
        let region = RetainedRegion::<_, HOT>::attach(&memory);
        let boot = region.boot_kind();

        let mut clock = TimestampService::new(&counter, region);
        clock.init(&config);
        let mut queue = SampleQueue::<_, _, HOT, BANKS>::new(region, &mut store);
        info!(
            "--- wake {} ({:?}, t={} s, server {}) ---",
            wake,
            boot,
            clock.now(),
            if service.uplink().online { "online" } else { "offline" }
        );

        let line = SimulatedDht::new(&shared, &counter, elapsed_secs);
        let mut sensor = Dht11::new(line, &counter, &shared).with_timeout(fast.read_timeout());
        let reports = Channel::<NoopRawMutex, MeasurementReport, REPORT_QUEUE_DEPTH>::new();

        let measuring = run_measurements(&mut sensor, &fast, reports.sender());
        let handling = async {
            loop {
                let report = reports.receive().await;
                if report != MeasurementReport::Finished {
                    counter.advance_secs(config.measure_period_secs as u32);
                }
                match service.handle(report, &mut clock, &mut queue).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Sleep) => break,
                    Err(e) => error!("sample store failed: {}", e),
                }
            }
        };
        block_on(join(measuring, handling));

        info!(
            "backlog: {} in hot tier, {:?} banks written",
            queue.hot_len(),
            queue.banks_written()
        );
        clock.persist(config.sleep_seconds());
        elapsed_secs += (config.measure_period_secs as u32 * config.measures_per_sleep as u32
            + config.sleep_seconds()) as f64;
    }

    let stats = service.stats();
    let server = service.uplink();
    info!(
        "Simulation done: server received {} samples ({} replayed) and {} heartbeats, {} queued, {} commits",
        server.received.len(),
        stats.replayed,
        server.heartbeats,
        stats.queued,
        store.commits()
    );
}
