//! Register map of the scan engine bitfile.
//!
//! Every front panel control and indicator of the bitfile is exposed as a 32-bit scalar register;
//! boolean controls read back as `0` or `1`, and narrower integer controls use the low bits.

#![allow(dead_code)]

use bitflags::bitflags;

/// Scan engine state (`Current` control).
pub const ADDR_CURRENT_STATE: u32 = 0x10022;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpgaState {
    Idle  = 0,
    Init  = 1,
    Write = 2,
    Scan  = 3,
    Blank = 4,
    Done  = 5,
    Stop  = 6,
}

impl FpgaState {
    pub fn from_code(code: u32) -> Option<FpgaState> {
        Some(match code {
            0 => FpgaState::Idle,
            1 => FpgaState::Init,
            2 => FpgaState::Write,
            3 => FpgaState::Scan,
            4 => FpgaState::Blank,
            5 => FpgaState::Done,
            6 => FpgaState::Stop,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

// Geometry
pub const ADDR_RESOLUTION: u32 = 0x10044;
pub const ADDR_ELEMENTS_PER_LINE: u32 = 0x10048;
pub const ADDR_NUM_UNDERSHOOT: u32 = 0x10054;
pub const ADDR_MAX_ADDR: u32 = 0x10078;
pub const ADDR_TOTAL_ELEMENTS: u32 = 0x10070;
pub const ADDR_NUM_ELEMENTS: u32 = 0x1004C;
pub const ADDR_SAMPLES_PER_FRAME: u32 = 0x10060;
pub const ADDR_MAX_DRAM_ADDRESS: u32 = 0x10000;
pub const ADDR_FRAME_RETRACE_TIME: u32 = 0x1005C;

// Pixel clock
pub const ADDR_PIXEL_TIME_TICK: u32 = 0x10050;
pub const ADDR_PIXEL_CLOCK_PULSE_WIDTH_TICK: u32 = 0x10040;
pub const ADDR_PIXEL_PULSE_INITIAL_DELAY: u32 = 0x10058;

// Task
pub const ADDR_NUMBER_OF_FRAMES: u32 = 0x10064;
/// Number of frames averaged by the device. Named "Kalman factor" in the bitfile, but it is plain
/// averaging.
pub const ADDR_AVERAGING_FACTOR: u32 = 0x1003A;
/// Recursive filter gain, unsigned fixed point with one integer bit.
pub const ADDR_FILTER_GAIN: u32 = 0x1001A;
pub const ADDR_ENABLE_SCANNER: u32 = 0x1000A;
pub const ADDR_ENABLE_DETECTOR: u32 = 0x10006;

// Scanning
pub const ADDR_READY_TO_SCAN: u32 = 0x1002A;
/// Galvo position, packed as `x << 16 | y`.
pub const ADDR_GALVO_SIGNAL: u32 = 0x10024;

// Waveform memory
pub const ADDR_WRITE_DRAM_ENABLE: u32 = 0x10076;
pub const ADDR_WRITE_FRAME_GALVO_SIGNAL: u32 = 0x1007E;
/// Set by the device once the waveform memory holds `ADDR_TOTAL_ELEMENTS` words.
pub const ADDR_GALVO_SIGNAL_WRITE_DONE: u32 = 0x1006A;

bitflags! {
    /// Handshake controls and indicators that must be cleared before a new scan is set up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Handshake: u32 {
        const ImageAveragingDone         = 1<<0;
        const AveragedImageDisplayed     = 1<<1;
        const WriteFrameGalvoSignal      = 1<<2;
        const WriteDramEnable            = 1<<3;
        const FrameGalvoSignalWriteDone  = 1<<4;
        const FrameWaveformOutputFinish  = 1<<5;
        const FrameAcquisitionFinish     = 1<<6;
        const Done                       = 1<<7;
        const WriteDramDone              = 1<<8;
        const CustomizedFilterGain       = 1<<9;
    }
}

impl Handshake {
    /// Register address of every handshake flag.
    pub const ADDRS: [(Handshake, u32); 10] = [
        (Handshake::ImageAveragingDone,        0x10036),
        (Handshake::AveragedImageDisplayed,    0x10032),
        (Handshake::WriteFrameGalvoSignal,     ADDR_WRITE_FRAME_GALVO_SIGNAL),
        (Handshake::WriteDramEnable,           ADDR_WRITE_DRAM_ENABLE),
        (Handshake::FrameGalvoSignalWriteDone, ADDR_GALVO_SIGNAL_WRITE_DONE),
        (Handshake::FrameWaveformOutputFinish, 0x1003E),
        (Handshake::FrameAcquisitionFinish,    0x1002E),
        (Handshake::Done,                      0x1001E),
        (Handshake::WriteDramDone,             0x1006E),
        (Handshake::CustomizedFilterGain,      ADDR_CUSTOMIZED_FILTER_GAIN),
    ];

    pub fn addrs(self) -> impl Iterator<Item = u32> {
        Self::ADDRS.into_iter()
            .filter(move |&(flag, _)| self.contains(flag))
            .map(|(_, addr)| addr)
    }
}

/// Use the host-programmed `ADDR_FILTER_GAIN` instead of the built-in averaging gain.
pub const ADDR_CUSTOMIZED_FILTER_GAIN: u32 = 0x10012;

// Streams

/// Target-to-host streams carrying `filtered << 16 | raw` words, indexed by channel.
pub const READ_STREAMS: [u32; 4] = [0, 3, 2, 1];

/// Host-to-target stream feeding the waveform memory.
pub const WRITE_STREAM_WAVEFORM: u32 = 4;

/// Channel index of a target-to-host stream.
pub fn read_stream_channel(stream: u32) -> Option<usize> {
    READ_STREAMS.iter().position(|&id| id == stream)
}

/// Sentinel frame count meaning "scan until stopped".
pub const UNBOUNDED_FRAMES: u32 = i32::MAX as u32;

// PCIe bridge registers used by the XDMA backend; not part of the bitfile front panel.

/// Bridge control register.
pub const ADDR_BRIDGE_CONTROL: u32 = 0x0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BridgeControl: u32 {
        const FpgaRun     = 1<<0;
        const FpgaResetN  = 1<<1;
        const Stream0     = 1<<8;
        const Stream1     = 1<<9;
        const Stream2     = 1<<10;
        const Stream3     = 1<<11;
        const Stream4     = 1<<12;
    }
}

impl BridgeControl {
    pub fn stream(stream: u32) -> Self {
        match stream {
            0 => BridgeControl::Stream0,
            1 => BridgeControl::Stream1,
            2 => BridgeControl::Stream2,
            3 => BridgeControl::Stream3,
            4 => BridgeControl::Stream4,
            _ => unreachable!()
        }
    }
}

/// Stream occupancy registers; read streams report words available, the write stream reports
/// free space.
pub const ADDR_BRIDGE_OCCUPANCY: u32 = 0x100;

pub fn bridge_occupancy_addr(stream: u32) -> u32 {
    ADDR_BRIDGE_OCCUPANCY + 4 * stream
}
