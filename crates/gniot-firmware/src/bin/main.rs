#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Io, Level, Output, OutputConfig};
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use esp_hal::rtc_cntl::{Rtc, reset_reason, wakeup_cause};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::system::Cpu;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};

use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::SdCard;

use gniot_core::config::NodeConfig;
use gniot_core::cycle::{MeasurementReport, REPORT_QUEUE_DEPTH, run_measurements};
use gniot_core::retained::RetainedRegion;
use gniot_core::sensors::Dht11;
use gniot_core::service::{Flow, ReportService};
use gniot_core::storage::{COLD_BANKS, HOT_TIER_CAPACITY, SampleQueue};
use gniot_core::timestamp::TimestampService;
use gniot_firmware::clock::SystemTimerCounter;
use gniot_firmware::dht_pin::{self, DHT_SHARED, DhtPin};
use gniot_firmware::rtc_memory::RtcFastWords;
use gniot_firmware::sd_store::{FixedTimeSource, SdBlobStore};
use gniot_firmware::uplink::OfflineUplink;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static REPORTS: Channel<CriticalSectionRawMutex, MeasurementReport, REPORT_QUEUE_DEPTH> =
    Channel::new();

type NodeSensor = Dht11<'static, DhtPin, SystemTimerCounter>;

#[embassy_executor::task]
async fn measurement_task(mut sensor: NodeSensor, config: NodeConfig) {
    run_measurements(&mut sensor, &config, REPORTS.sender()).await;
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!(
        "gniot boot: reset {:?}, wakeup {:?}",
        reset_reason(Cpu::ProCpu),
        wakeup_cause()
    );

    let config = gniot_firmware::config::node_config();

    // Retained region: timestamp and hot tier
    let memory = RtcFastWords::take().expect("RTC memory handle taken twice");
    let region = RetainedRegion::<_, HOT_TIER_CAPACITY>::attach(&memory);

    let mut clock = TimestampService::new(SystemTimerCounter, region);
    clock.init(&config);

    // SD card for the cold banks
    let spi_bus = Spi::new(
        peripherals.SPI2,
        SpiConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .expect("Failed to configure SD card SPI bus")
    .with_sck(peripherals.GPIO36)
    .with_mosi(peripherals.GPIO37)
    .with_miso(peripherals.GPIO35);
    let sd_cs = Output::new(peripherals.GPIO4, Level::High, OutputConfig::default());
    let sd_spi = ExclusiveDevice::new(spi_bus, sd_cs, Delay::new())
        .expect("Failed to create SD card SPI device");
    let sd_card = SdCard::new(sd_spi, Delay::new());

    let store = SdBlobStore::new(sd_card, FixedTimeSource);
    let mut queue = SampleQueue::<_, _, HOT_TIER_CAPACITY, COLD_BANKS>::new(region, store);

    // DHT11 data line and its edge interrupt
    let mut io = Io::new(peripherals.IO_MUX);
    io.set_interrupt_handler(dht_pin::edge_handler);
    let line = DhtPin::install(peripherals.GPIO5);
    let sensor = Dht11::new(line, SystemTimerCounter, &DHT_SHARED).with_timeout(config.read_timeout());

    spawner.spawn(measurement_task(sensor, config).expect("measurement task"));

    let mut service = ReportService::new(OfflineUplink::new(config.node_id));
    let reports = REPORTS.receiver();

    loop {
        let report = reports.receive().await;
        match service.handle(report, &mut clock, &mut queue).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Sleep) => break,
            Err(e) => error!("sample store failed, continuing without backlog: {}", e),
        }
    }

    let stats = service.stats();
    info!(
        "wake period done: {} delivered, {} replayed, {} queued",
        stats.delivered, stats.replayed, stats.queued
    );

    let sleep_seconds = config.sleep_seconds();
    clock.persist(sleep_seconds);

    let mut rtc = Rtc::new(peripherals.LPWR);
    let wakeup = TimerWakeupSource::new(core::time::Duration::from_secs(sleep_seconds as u64));
    info!("going to sleep for {} minutes", config.sleep_length_minutes);
    rtc.sleep_deep(&[&wakeup]);
}
