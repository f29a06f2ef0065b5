//! DHT11 single-wire protocol decoder
//!
//! The DHT11 answers a host request with a start pulse followed by 40 data
//! bits, each bit a ~50 us low phase and a high phase whose length carries the
//! value (~26 us for 0, ~70 us for 1). The line is sampled from a both-edge
//! GPIO interrupt: every edge feeds [`DecoderShared::on_edge`], which advances
//! an [`EdgeDecoder`] using the time elapsed since the last accepted edge.
//!
//! ## Handoff
//!
//! The interrupt side owns the bit buffer while a frame is being collected.
//! When the 40th bit lands, the finished frame is moved by value into a
//! single-slot channel and the decoder goes back to `Idle`; the task waiting in
//! [`Dht11::read`] only ever sees the frame it received from that channel.

use core::cell::RefCell;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer, with_timeout};
use log::{debug, warn};

use super::{FixedPoint, HumTempReading, Sensor, SensorError};
use crate::clock::{CycleClock, CycleCounter, elapsed_micros_between};

const SENSOR_NAME: &str = "DHT11";

pub const FRAME_BYTES: usize = 5;
pub const FRAME_BITS: u8 = 40;

/// How long the host holds the line low to request a transmission (>= 18 ms).
pub const REQUEST_HOLD_MS: u64 = 30;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

// Minimum phase lengths accepted by the decoder, in microseconds
const START_LOW_MIN_US: u32 = 80;
const START_HIGH_MIN_US: u32 = 160;
const BIT_LOW_MIN_US: u32 = 30;
const BIT_HIGH_MIN_US: u32 = 10;
const BIT_ONE_MIN_US: u32 = 50;

/// Raw frame: humidity integer, humidity decimal, temperature integer,
/// temperature decimal, checksum.
pub type Frame = [u8; FRAME_BYTES];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Requesting,
    AwaitingStartLow,
    AwaitingStartHigh,
    AwaitingBitLow,
    AwaitingBitHigh,
}

/// Edge-timing state machine for one DHT11 transaction.
#[derive(Debug)]
pub struct EdgeDecoder {
    state: DecodeState,
    /// Tick count of the last accepted edge
    reference: u32,
    bit: u8,
    frame: Frame,
}

impl Default for EdgeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            reference: 0,
            bit: 0,
            frame: [0; FRAME_BYTES],
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Drop any partial frame and enter the request phase.
    pub fn request(&mut self) {
        *self = Self::new();
        self.state = DecodeState::Requesting;
    }

    /// Start listening for the sensor response, timing from `now`.
    pub fn start(&mut self, now: u32) {
        self.state = DecodeState::AwaitingStartLow;
        self.reference = now;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one edge. Returns the completed frame after the 40th bit.
    ///
    /// Edges that do not satisfy the current state's level and timing
    /// condition are ignored.
    pub fn on_edge(&mut self, high: bool, now: u32, ticks_per_us: u32) -> Option<Frame> {
        let dt_us = elapsed_micros_between(self.reference, now, ticks_per_us);

        match self.state {
            // The start pulse is timed from the request, the reference stays put
            DecodeState::AwaitingStartLow if high && dt_us > START_LOW_MIN_US => {
                self.state = DecodeState::AwaitingStartHigh;
            }
            DecodeState::AwaitingStartHigh if !high && dt_us > START_HIGH_MIN_US => {
                self.state = DecodeState::AwaitingBitLow;
                self.reference = now;
                self.bit = 0;
                self.frame = [0; FRAME_BYTES];
            }
            DecodeState::AwaitingBitLow if high && dt_us > BIT_LOW_MIN_US => {
                self.state = DecodeState::AwaitingBitHigh;
                self.reference = now;
            }
            DecodeState::AwaitingBitHigh if !high && dt_us > BIT_HIGH_MIN_US => {
                self.state = DecodeState::AwaitingBitLow;
                self.reference = now;
                self.push_bit(dt_us > BIT_ONE_MIN_US);

                if self.bit >= FRAME_BITS {
                    self.state = DecodeState::Idle;
                    return Some(core::mem::take(&mut self.frame));
                }
            }
            _ => {}
        }

        None
    }

    fn push_bit(&mut self, one: bool) {
        if one {
            self.frame[(self.bit >> 3) as usize] |= 1 << (7 - (self.bit & 7));
        }
        self.bit += 1;
    }
}

/// State shared between the GPIO interrupt handler and [`Dht11`].
///
/// Meant to live in a `static`; the interrupt handler calls
/// [`DecoderShared::on_edge`] for every edge on the data line.
pub struct DecoderShared {
    machine: Mutex<CriticalSectionRawMutex, RefCell<EdgeDecoder>>,
    completed: Channel<CriticalSectionRawMutex, Frame, 1>,
}

impl Default for DecoderShared {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderShared {
    pub const fn new() -> Self {
        Self {
            machine: Mutex::new(RefCell::new(EdgeDecoder::new())),
            completed: Channel::new(),
        }
    }

    /// Interrupt entry point. `high` is the line level sampled in the handler.
    ///
    /// Never blocks: the completion channel is written with `try_send`.
    pub fn on_edge<C: CycleCounter>(&self, counter: &C, high: bool) {
        let now = counter.ticks();
        let frame = self.with_machine(|machine| {
            machine.on_edge(high, now, C::TICKS_PER_MICROSECOND)
        });

        if let Some(frame) = frame {
            // Only one frame per transaction; a full slot means nobody armed a read
            let _ = self.completed.try_send(frame);
        }
    }

    pub fn state(&self) -> DecodeState {
        self.with_machine(|machine| machine.state())
    }

    fn with_machine<R>(&self, f: impl FnOnce(&mut EdgeDecoder) -> R) -> R {
        self.machine.lock(|machine| f(&mut machine.borrow_mut()))
    }

    fn discard_stale(&self) {
        while self.completed.try_receive().is_ok() {}
    }
}

/// Platform side of the DHT11 data line.
///
/// `arm` is always called before `release`, and every transaction ends with
/// `disarm`, whatever its outcome.
pub trait SensorLine {
    /// Configure the pin as output and pull the line low.
    fn drive_low(&mut self);
    /// Switch the pin to input with pull-up so the sensor can drive it.
    fn release(&mut self);
    /// Route both-edge interrupts of the pin to [`DecoderShared::on_edge`].
    fn arm(&mut self);
    /// Stop delivering edge interrupts.
    fn disarm(&mut self);
}

/// DHT11 humidity/temperature sensor on a bit-banged GPIO line.
pub struct Dht11<'a, L, C> {
    line: L,
    clock: CycleClock<C>,
    shared: &'a DecoderShared,
    timeout: Duration,
}

impl<'a, L: SensorLine, C: CycleCounter> Dht11<'a, L, C> {
    pub fn new(line: L, counter: C, shared: &'a DecoderShared) -> Self {
        Self {
            line,
            clock: CycleClock::new(counter),
            shared,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Timeout used by the [`Sensor`] implementation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    /// Perform one complete transaction, waiting at most `timeout` for the
    /// frame after the request phase.
    pub async fn read(&mut self, timeout: Duration) -> Result<HumTempReading, SensorError> {
        self.shared.with_machine(EdgeDecoder::request);
        self.shared.discard_stale();

        self.line.drive_low();
        Timer::after_millis(REQUEST_HOLD_MS).await;

        let now = self.clock.now();
        self.shared.with_machine(|machine| machine.start(now));
        self.line.arm();
        self.line.release();

        let outcome = with_timeout(timeout, self.shared.completed.receive()).await;

        self.line.disarm();
        self.shared.with_machine(EdgeDecoder::reset);

        match outcome {
            Ok(frame) => decode_frame(&frame),
            Err(_) => {
                warn!("{} read timed out", SENSOR_NAME);
                Err(SensorError::Timeout {
                    sensor: SENSOR_NAME,
                })
            }
        }
    }
}

impl<L: SensorLine, C: CycleCounter> Sensor<2> for Dht11<'_, L, C> {
    type Readings = HumTempReading;

    async fn read(&mut self) -> Result<HumTempReading, SensorError> {
        let timeout = self.timeout;
        Dht11::read(self, timeout).await
    }
}

/// Validate the checksum and split a frame into humidity and temperature.
///
/// The checksum is compared against the full sum of the four data bytes.
pub fn decode_frame(frame: &Frame) -> Result<HumTempReading, SensorError> {
    let computed = frame[..4].iter().map(|&b| b as u16).sum::<u16>();

    if computed != frame[4] as u16 {
        warn!(
            "{} checksum error: {}+{}+{}+{}={} not {}",
            SENSOR_NAME, frame[0], frame[1], frame[2], frame[3], computed, frame[4]
        );
        return Err(SensorError::Checksum {
            sensor: SENSOR_NAME,
            expected: frame[4],
            computed,
        });
    }

    let reading = HumTempReading {
        humidity: FixedPoint::new(frame[0], frame[1]),
        temperature: FixedPoint::new(frame[2], frame[3]),
    };
    debug!(
        "{}: {} rh, {} C",
        SENSOR_NAME, reading.humidity, reading.temperature
    );

    Ok(reading)
}

/// Synthesis of the edge sequence a DHT11 produces for a frame.
pub mod waveform {
    use super::*;

    /// An edge `after_us` microseconds after the previous one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Edge {
        pub after_us: u32,
        pub high: bool,
    }

    pub const RESPONSE_DELAY_US: u32 = 30;
    pub const START_PHASE_US: u32 = 80;
    pub const BIT_LOW_US: u32 = 50;
    pub const ZERO_HIGH_US: u32 = 26;
    pub const ONE_HIGH_US: u32 = 70;

    /// Frame with a valid checksum.
    pub fn frame_for(humidity: FixedPoint, temperature: FixedPoint) -> Frame {
        let checksum = humidity
            .integer
            .wrapping_add(humidity.decimal)
            .wrapping_add(temperature.integer)
            .wrapping_add(temperature.decimal);
        [
            humidity.integer,
            humidity.decimal,
            temperature.integer,
            temperature.decimal,
            checksum,
        ]
    }

    /// Edges seen on the line from the moment the host releases it.
    pub fn frame_edges(frame: &Frame) -> Vec<Edge> {
        let mut edges = Vec::with_capacity(3 + FRAME_BITS as usize * 2 + 1);

        edges.push(Edge {
            after_us: RESPONSE_DELAY_US,
            high: false,
        });
        edges.push(Edge {
            after_us: START_PHASE_US,
            high: true,
        });
        edges.push(Edge {
            after_us: START_PHASE_US,
            high: false,
        });

        for bit in 0..FRAME_BITS {
            let one = frame[(bit >> 3) as usize] & (1 << (7 - (bit & 7))) != 0;
            edges.push(Edge {
                after_us: BIT_LOW_US,
                high: true,
            });
            edges.push(Edge {
                after_us: if one { ONE_HIGH_US } else { ZERO_HIGH_US },
                high: false,
            });
        }

        // Sensor lets go of the line after the last bit
        edges.push(Edge {
            after_us: BIT_LOW_US,
            high: true,
        });

        edges
    }
}

#[cfg(test)]
mod tests {
    use super::waveform::{Edge, frame_edges, frame_for};
    use super::*;
    use crate::clock::VirtualCounter;
    use crate::sensors::SensorReadings;
    use alloc::collections::VecDeque;
    use embassy_futures::block_on;

    struct ScriptedLine<'a> {
        shared: &'a DecoderShared,
        counter: &'a VirtualCounter,
        scripts: VecDeque<Vec<Edge>>,
        armed: bool,
        driven_low: bool,
    }

    impl<'a> ScriptedLine<'a> {
        fn new(shared: &'a DecoderShared, counter: &'a VirtualCounter) -> Self {
            Self {
                shared,
                counter,
                scripts: VecDeque::new(),
                armed: false,
                driven_low: false,
            }
        }

        fn queue(&mut self, edges: Vec<Edge>) {
            self.scripts.push_back(edges);
        }
    }

    impl SensorLine for ScriptedLine<'_> {
        fn drive_low(&mut self) {
            self.driven_low = true;
        }

        fn release(&mut self) {
            self.driven_low = false;
            if !self.armed {
                return;
            }
            if let Some(script) = self.scripts.pop_front() {
                for edge in script {
                    self.counter.advance_micros(edge.after_us);
                    self.shared.on_edge(self.counter, edge.high);
                }
            }
        }

        fn arm(&mut self) {
            self.armed = true;
        }

        fn disarm(&mut self) {
            self.armed = false;
        }
    }

    fn reading(h: (u8, u8), t: (u8, u8)) -> HumTempReading {
        HumTempReading {
            humidity: FixedPoint::new(h.0, h.1),
            temperature: FixedPoint::new(t.0, t.1),
        }
    }

    #[test]
    fn test_decodes_synthesized_frame() {
        let shared = DecoderShared::new();
        let counter = VirtualCounter::new(0);
        let mut line = ScriptedLine::new(&shared, &counter);
        let expected = reading((45, 0), (23, 4));
        line.queue(frame_edges(&frame_for(expected.humidity, expected.temperature)));

        let mut dht = Dht11::new(line, &counter, &shared);
        let result = block_on(dht.read(Duration::from_millis(100)));

        assert_eq!(result, Ok(expected));
        assert!(!dht.line().armed);
        assert_eq!(shared.state(), DecodeState::Idle);
    }

    #[test]
    fn test_checksum_error_does_not_bleed_into_next_read() {
        let shared = DecoderShared::new();
        let counter = VirtualCounter::new(1234);
        let mut line = ScriptedLine::new(&shared, &counter);

        let mut corrupted = frame_for(FixedPoint::new(61, 0), FixedPoint::new(19, 0));
        corrupted[4] = corrupted[4].wrapping_add(1);
        line.queue(frame_edges(&corrupted));
        let expected = reading((33, 0), (27, 1));
        line.queue(frame_edges(&frame_for(expected.humidity, expected.temperature)));

        let mut dht = Dht11::new(line, &counter, &shared);

        let first = block_on(dht.read(Duration::from_millis(100)));
        assert!(matches!(
            first,
            Err(SensorError::Checksum {
                expected: 81,
                computed: 80,
                ..
            })
        ));
        assert_eq!(shared.state(), DecodeState::Idle);
        assert!(!dht.line().armed);

        let second = block_on(dht.read(Duration::from_millis(100)));
        assert_eq!(second, Ok(expected));
    }

    #[test]
    fn test_timeout_leaves_no_interrupt_armed() {
        let shared = DecoderShared::new();
        let counter = VirtualCounter::new(0);
        let line = ScriptedLine::new(&shared, &counter);

        let mut dht = Dht11::new(line, &counter, &shared);
        let result = block_on(dht.read(Duration::from_millis(20)));

        assert_eq!(
            result,
            Err(SensorError::Timeout {
                sensor: SENSOR_NAME
            })
        );
        assert!(!dht.line().armed);
        assert!(!dht.line().driven_low);
        assert_eq!(shared.state(), DecodeState::Idle);
    }

    #[test]
    fn test_partial_frame_times_out() {
        let shared = DecoderShared::new();
        let counter = VirtualCounter::new(0);
        let mut line = ScriptedLine::new(&shared, &counter);
        let mut edges = frame_edges(&frame_for(FixedPoint::new(50, 0), FixedPoint::new(20, 0)));
        edges.truncate(40);
        line.queue(edges);

        let mut dht = Dht11::new(line, &counter, &shared);
        let result = block_on(dht.read(Duration::from_millis(20)));

        assert!(matches!(result, Err(SensorError::Timeout { .. })));
        assert_eq!(shared.state(), DecodeState::Idle);
    }

    #[test]
    fn test_bounces_before_start_pulse_are_ignored() {
        let shared = DecoderShared::new();
        let counter = VirtualCounter::new(0);
        let mut line = ScriptedLine::new(&shared, &counter);
        let expected = reading((52, 0), (21, 0));

        let mut edges = alloc::vec![
            Edge {
                after_us: 3,
                high: true
            },
            Edge {
                after_us: 2,
                high: false
            },
        ];
        edges.extend(frame_edges(&frame_for(expected.humidity, expected.temperature)));
        line.queue(edges);

        let mut dht = Dht11::new(line, &counter, &shared);
        assert_eq!(block_on(dht.read(Duration::from_millis(100))), Ok(expected));
    }

    #[test]
    fn test_sensor_trait_uses_configured_timeout() {
        let shared = DecoderShared::new();
        let counter = VirtualCounter::new(0);
        let mut line = ScriptedLine::new(&shared, &counter);
        let expected = reading((40, 0), (25, 0));
        line.queue(frame_edges(&frame_for(expected.humidity, expected.temperature)));

        let mut dht = Dht11::new(line, &counter, &shared).with_timeout(Duration::from_millis(50));
        let readings = block_on(Sensor::read(&mut dht)).map(|r| r.to_array());

        assert_eq!(readings, Ok([400, 250]));
    }

    #[test]
    fn test_bits_are_packed_msb_first() {
        let mut decoder = EdgeDecoder::new();
        decoder.start(0);
        let mut now = 0;
        let mut feed = |decoder: &mut EdgeDecoder, dt: u32, high: bool| {
            now += dt;
            decoder.on_edge(high, now, 1)
        };

        feed(&mut decoder, 110, true);
        feed(&mut decoder, 80, false);
        assert_eq!(decoder.state(), DecodeState::AwaitingBitLow);

        // 1 followed by 39 zeros
        feed(&mut decoder, 50, true);
        feed(&mut decoder, 70, false);
        let mut frame = None;
        for _ in 1..FRAME_BITS {
            feed(&mut decoder, 50, true);
            frame = feed(&mut decoder, 26, false);
        }

        assert_eq!(frame, Some([0x80, 0, 0, 0, 0]));
        assert_eq!(decoder.state(), DecodeState::Idle);
    }

    #[test]
    fn test_checksum_is_not_truncated_to_a_byte() {
        // 200 + 100 = 300, low byte 44
        let frame = [200, 0, 100, 0, 44];
        assert!(matches!(
            decode_frame(&frame),
            Err(SensorError::Checksum { computed: 300, .. })
        ));
    }
}
