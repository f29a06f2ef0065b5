//! Hardware-independent core library for the gniot sensor node
//!
//! This crate contains the platform-agnostic logic of the node: the DHT11
//! edge-timing decoder, the cycle clock it runs on, the median sample encoder,
//! the sleep-aware timestamp service and the two-tier persistent sample queue,
//! plus the measurement cycle and report service that drive them.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod cycle;
pub mod measurement;
pub mod retained;
pub mod sensors;
pub mod service;
pub mod storage;
pub mod timestamp;
