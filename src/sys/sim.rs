//! Simulated scan engine.
//!
//! Implements the register/stream interface of the bitfile closely enough to run the whole
//! acquisition path without hardware: the state machine, the waveform memory and its "write done"
//! indicator, and detector streams carrying `filtered << 16 | raw` words produced by a per-channel
//! recursive filter. Knobs allow injecting the faults the host has to cope with.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{Error, Result};
use crate::averaging::{from_fixed16, RecursiveFilter};
use crate::regs::fpga::{self, FpgaState};

/// Raw sample of `(channel, sub_frame, pixel)`; `sub_frame` counts from the start of the scan.
pub type PixelPattern = Arc<dyn Fn(usize, u64, usize) -> u16 + Send + Sync>;

#[derive(Debug, Default)]
struct ReadStream {
    started: bool,
    queue: VecDeque<u32>,
    visible: usize,
    produced: u64,
}

struct State {
    registers: HashMap<u32, u32>,
    state: u32,
    streams: [ReadStream; 4],
    filters: [RecursiveFilter; 4],
    waveform: Vec<u32>,
    pattern: PixelPattern,
    // statistics
    writes: usize,
    resets: usize,
    runs: usize,
    waveform_uploads: usize,
    // knobs
    chunk_size: usize,
    extra_samples: usize,
    stalled: bool,
    state_after_reset: Option<u32>,
    waveform_capacity: Option<usize>,
    failing_register: Option<u32>,
    failing_stream: Option<u32>,
}

impl State {
    fn register(&self, addr: u32) -> u32 {
        self.registers.get(&addr).copied().unwrap_or(0)
    }

    fn waveform_capacity(&self) -> usize {
        self.waveform_capacity.unwrap_or(self.register(fpga::ADDR_TOTAL_ELEMENTS) as usize)
    }

    fn filter_gain(&self, sub_frame: u64) -> f64 {
        if self.register(fpga::ADDR_CUSTOMIZED_FILTER_GAIN) != 0 {
            from_fixed16(self.register(fpga::ADDR_FILTER_GAIN) as u16, 1)
        } else {
            let factor = self.register(fpga::ADDR_AVERAGING_FACTOR).max(1) as u64;
            1.0 / ((sub_frame % factor) + 1) as f64
        }
    }

    fn set_state(&mut self, code: u32) {
        match FpgaState::from_code(code) {
            // DRAM clear completes instantly
            Some(FpgaState::Init) =>
                self.state = FpgaState::Idle.code(),
            Some(FpgaState::Write) => {
                self.waveform.clear();
                self.registers.insert(fpga::ADDR_GALVO_SIGNAL_WRITE_DONE, 0);
                self.state = code;
            }
            Some(FpgaState::Scan) => {
                if self.register(fpga::ADDR_READY_TO_SCAN) != 0 {
                    for stream in self.streams.iter_mut() {
                        stream.produced = 0;
                    }
                    self.state = code;
                }
            }
            Some(FpgaState::Stop) =>
                self.state = FpgaState::Idle.code(),
            _ =>
                self.state = code,
        }
    }

    fn produce_sub_frame(&mut self, channel: usize) {
        let frames = self.register(fpga::ADDR_NUMBER_OF_FRAMES) as u64;
        let sub_frame = self.streams[channel].produced;
        if self.stalled || self.state != FpgaState::Scan.code() ||
                self.register(fpga::ADDR_ENABLE_DETECTOR) == 0 || sub_frame >= frames {
            return
        }
        let resolution = self.register(fpga::ADDR_RESOLUTION) as usize;
        let raw = (0..resolution * resolution)
            .map(|pixel| (self.pattern)(channel, sub_frame, pixel))
            .collect::<Vec<_>>();
        let gain = self.filter_gain(sub_frame);
        let filtered = self.filters[channel].update(&raw, gain);
        let extra_samples = self.extra_samples;
        let stream = &mut self.streams[channel];
        stream.queue.extend(filtered.iter().zip(raw.iter())
            .map(|(&filtered, &raw)| (filtered as u32) << 16 | raw as u32));
        stream.queue.extend(std::iter::repeat(0xdead_beef).take(extra_samples));
        stream.produced += 1;
    }
}

/// In-process scan engine. Clones share the same simulated device.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<State>>,
}

impl Default for Simulator {
    fn default() -> Self {
        Simulator::new()
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Simulator")
            .field("state", &state.state)
            .field("writes", &state.writes)
            .field("waveform_uploads", &state.waveform_uploads)
            .finish_non_exhaustive()
    }
}

impl Simulator {
    pub fn new() -> Simulator {
        let pattern: PixelPattern = Arc::new(|channel, sub_frame, pixel| {
            (channel * 0x1000 + (sub_frame as usize % 16) * 0x100 + pixel % 0x100) as u16
        });
        Simulator {
            state: Arc::new(Mutex::new(State {
                registers: HashMap::new(),
                state: FpgaState::Idle.code(),
                streams: Default::default(),
                filters: Default::default(),
                waveform: Vec::new(),
                pattern,
                writes: 0,
                resets: 0,
                runs: 0,
                waveform_uploads: 0,
                chunk_size: usize::MAX,
                extra_samples: 0,
                stalled: false,
                state_after_reset: None,
                waveform_capacity: None,
                failing_register: None,
                failing_stream: None,
            }))
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_pattern<F>(self, pattern: F) -> Simulator
            where F: Fn(usize, u64, usize) -> u16 + Send + Sync + 'static {
        self.lock().pattern = Arc::new(pattern);
        self
    }

    /// Limits how many more words of a read stream become visible on every probe.
    pub fn set_chunk_size(&self, words: usize) {
        self.lock().chunk_size = words.max(1);
    }

    /// Appends `words` surplus words to every sub-frame.
    pub fn set_extra_samples(&self, words: usize) {
        self.lock().extra_samples = words;
    }

    /// Stops producing detector data.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Makes the device come out of reset in state `code` instead of idle.
    pub fn set_state_after_reset(&self, code: Option<u32>) {
        self.lock().state_after_reset = code;
    }

    /// Overrides the waveform memory size, which otherwise follows the total elements register.
    pub fn set_waveform_capacity(&self, words: Option<usize>) {
        self.lock().waveform_capacity = words;
    }

    /// Makes every write to `addr` fail.
    pub fn set_failing_register(&self, addr: Option<u32>) {
        self.lock().failing_register = addr;
    }

    /// Makes every read from target-to-host `stream` fail, probes included.
    pub fn set_failing_stream(&self, stream: Option<u32>) {
        self.lock().failing_stream = stream;
    }

    pub fn register(&self, addr: u32) -> u32 {
        let state = self.lock();
        if addr == fpga::ADDR_CURRENT_STATE { state.state } else { state.register(addr) }
    }

    /// Number of register writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of times the waveform memory was filled completely.
    pub fn waveform_uploads(&self) -> usize {
        self.lock().waveform_uploads
    }

    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    pub fn runs(&self) -> usize {
        self.lock().runs
    }

    /// Sub-frames produced on `channel` since the scan started.
    pub fn sub_frames_produced(&self, channel: usize) -> u64 {
        self.lock().streams[channel].produced
    }

    pub fn is_stream_started(&self, stream: u32) -> bool {
        match fpga::read_stream_channel(stream) {
            Some(channel) => self.lock().streams[channel].started,
            None => false,
        }
    }

    fn read_channel(stream: u32) -> Result<usize> {
        fpga::read_stream_channel(stream).ok_or(Error::Unsupported("not a target-to-host stream"))
    }
}

impl super::Driver for Simulator {
    fn reset(&self) -> Result<()> {
        let mut state = self.lock();
        state.registers.clear();
        state.waveform.clear();
        state.streams = Default::default();
        state.filters = Default::default();
        state.state = state.state_after_reset.unwrap_or(FpgaState::Idle.code());
        state.resets += 1;
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lock().runs += 1;
        Ok(())
    }

    fn read_scalar(&self, addr: u32) -> Result<u32> {
        Ok(self.register(addr))
    }

    fn write_scalar(&self, addr: u32, value: u32) -> Result<()> {
        let mut state = self.lock();
        if state.failing_register == Some(addr) {
            return Err(Error::Communication(
                io::Error::new(io::ErrorKind::Other, "simulated register fault")))
        }
        state.writes += 1;
        match addr {
            fpga::ADDR_CURRENT_STATE =>
                state.set_state(value),
            fpga::ADDR_READY_TO_SCAN => {
                state.registers.insert(addr, value);
                if value == 0 && state.state == FpgaState::Scan.code() {
                    state.state = FpgaState::Idle.code();
                }
            }
            _ => {
                state.registers.insert(addr, value);
            }
        }
        Ok(())
    }

    fn start_stream(&self, stream: u32) -> Result<()> {
        if stream == fpga::WRITE_STREAM_WAVEFORM {
            return Ok(())
        }
        let channel = Self::read_channel(stream)?;
        let mut state = self.lock();
        if !state.streams[channel].started {
            state.streams[channel].started = true;
            state.produce_sub_frame(channel);
        }
        Ok(())
    }

    fn stop_stream(&self, stream: u32) -> Result<()> {
        if stream == fpga::WRITE_STREAM_WAVEFORM {
            return Ok(())
        }
        let channel = Self::read_channel(stream)?;
        let mut state = self.lock();
        let stream = &mut state.streams[channel];
        stream.started = false;
        stream.queue.clear();
        stream.visible = 0;
        Ok(())
    }

    fn read_stream(&self, stream: u32, data: &mut [u32], _timeout: Duration) -> Result<usize> {
        let channel = Self::read_channel(stream)?;
        let mut state = self.lock();
        if state.failing_stream == Some(stream) {
            return Err(Error::Communication(
                io::Error::new(io::ErrorKind::Other, "simulated DMA fault")))
        }
        let chunk_size = state.chunk_size;
        let stream = &mut state.streams[channel];
        if data.is_empty() {
            stream.visible = stream.visible.saturating_add(chunk_size).min(stream.queue.len());
            return Ok(stream.visible)
        }
        if data.len() > stream.queue.len() {
            return Err(Error::Timeout("reading detector stream"))
        }
        let count = data.len();
        for (word, sample) in data.iter_mut().zip(stream.queue.drain(..count)) {
            *word = sample;
        }
        stream.visible = stream.visible.saturating_sub(count);
        Ok(stream.queue.len())
    }

    fn write_stream(&self, stream: u32, data: &[u32], _timeout: Duration) -> Result<usize> {
        if stream != fpga::WRITE_STREAM_WAVEFORM {
            return Err(Error::Unsupported("not a host-to-target stream"))
        }
        let mut state = self.lock();
        let capacity = state.waveform_capacity();
        if state.state != FpgaState::Write.code() {
            if data.is_empty() {
                return Ok(0)
            }
            return Err(Error::Communication(
                io::Error::new(io::ErrorKind::Other, "waveform memory not in write mode")))
        }
        let accepted = data.len().min(capacity.saturating_sub(state.waveform.len()));
        state.waveform.extend_from_slice(&data[..accepted]);
        if !data.is_empty() && state.waveform.len() == capacity {
            state.registers.insert(fpga::ADDR_GALVO_SIGNAL_WRITE_DONE, 1);
            state.state = FpgaState::Idle.code();
            state.waveform_uploads += 1;
        }
        Ok(capacity.saturating_sub(state.waveform.len()))
    }
}
