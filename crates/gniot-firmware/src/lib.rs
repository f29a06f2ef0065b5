//! ESP32-S3 firmware-specific modules for the gniot node
//!
//! This crate contains the platform adapters that cannot compile on desktop
//! targets: the DHT11 data line and its edge interrupt, the system timer used
//! as cycle counter, RTC fast memory as retained scratch words, and the SD card
//! as the cold-bank blob store.

#![no_std]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod dht_pin;
pub mod rtc_memory;
pub mod sd_store;
pub mod uplink;
