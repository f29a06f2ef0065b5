//! DHT11 single-wire data line for ESP32-S3
//!
//! The line is an open-drain [`Flex`] pin with pull-up: driving it low starts a
//! transaction, releasing it hands the bus to the sensor. While armed, every
//! edge raises the GPIO interrupt and [`edge_handler`] feeds the level and the
//! system timer into [`DHT_SHARED`].
//!
//! The pin lives in a critical-section mutex so the handler and the reading
//! task never touch it at the same time.

use core::cell::RefCell;

use critical_section::Mutex;
use esp_hal::gpio::{DriveMode, Event, Flex, InputConfig, OutputConfig, Pin, Pull};
use esp_hal::{handler, ram};
use gniot_core::sensors::{DecoderShared, SensorLine};
use log::warn;

use crate::clock::SystemTimerCounter;

/// Decoder state shared between [`edge_handler`] and the DHT11 driver.
pub static DHT_SHARED: DecoderShared = DecoderShared::new();

static DHT_LINE: Mutex<RefCell<Option<Flex<'static>>>> = Mutex::new(RefCell::new(None));

/// Handle to the installed data line.
#[derive(Debug)]
pub struct DhtPin {
    _private: (),
}

impl DhtPin {
    /// Configure `pin` as the DHT11 data line, released (high).
    ///
    /// [`edge_handler`] must be registered as the GPIO interrupt handler.
    pub fn install(pin: impl Pin + 'static) -> Self {
        let mut line = Flex::new(pin);
        line.apply_output_config(
            &OutputConfig::default()
                .with_drive_mode(DriveMode::OpenDrain)
                .with_pull(Pull::Up),
        );
        line.apply_input_config(&InputConfig::default().with_pull(Pull::Up));
        line.set_input_enable(true);
        line.set_high();
        line.set_output_enable(true);

        critical_section::with(|cs| {
            if DHT_LINE.borrow_ref_mut(cs).replace(line).is_some() {
                warn!("DHT11 line installed twice, previous pin dropped");
            }
        });

        Self { _private: () }
    }

    fn with_line(&mut self, f: impl FnOnce(&mut Flex<'static>)) {
        critical_section::with(|cs| {
            if let Some(line) = DHT_LINE.borrow_ref_mut(cs).as_mut() {
                f(line);
            }
        });
    }
}

impl SensorLine for DhtPin {
    fn drive_low(&mut self) {
        self.with_line(|line| line.set_low());
    }

    fn release(&mut self) {
        // Open drain: high means floating, the pull-up takes the line
        self.with_line(|line| line.set_high());
    }

    fn arm(&mut self) {
        self.with_line(|line| {
            line.clear_interrupt();
            line.listen(Event::AnyEdge);
        });
    }

    fn disarm(&mut self) {
        self.with_line(|line| {
            line.unlisten();
            line.clear_interrupt();
        });
    }
}

/// GPIO interrupt handler for the DHT11 line.
#[handler]
#[ram]
pub fn edge_handler() {
    critical_section::with(|cs| {
        let mut line = DHT_LINE.borrow_ref_mut(cs);
        let Some(line) = line.as_mut() else {
            return;
        };
        if !line.is_interrupt_set() {
            return;
        }

        let high = line.is_high();
        line.clear_interrupt();
        DHT_SHARED.on_edge(&SystemTimerCounter, high);
    });
}
