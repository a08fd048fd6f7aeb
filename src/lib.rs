mod regs;
mod config;
mod params;
mod averaging;
mod waveform;
mod device;
mod capture;
mod acquisition;

pub mod sys;
pub mod host;

use std::io;

#[derive(Debug)]
pub enum Error {
    NotFound,
    Communication(io::Error),
    DeviceNotIdle { state: u32 },
    WaveformOutOfRange,
    WaveformMemorySizeMismatch { rows_written: usize, rows: usize },
    DataLeftInFifo { channel: usize, remaining: usize },
    NotArmed,
    AlreadyRunning,
    Cancelled,
    Unsupported(&'static str),
    Timeout(&'static str),
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound =>
                write!(f, "device not connected"),
            Self::Communication(io_error) =>
                write!(f, "hardware communication error: {}", io_error),
            Self::DeviceNotIdle { state } =>
                write!(f, "unexpected device state {} (expected idle)", state),
            Self::WaveformOutOfRange =>
                write!(f, "galvo waveform out of range"),
            Self::WaveformMemorySizeMismatch { rows_written, rows } =>
                write!(f, "waveform memory size mismatch after {} of {} rows", rows_written, rows),
            Self::DataLeftInFifo { channel, remaining } =>
                write!(f, "{} samples left in FIFO of channel {} after reading image",
                    remaining, channel),
            Self::NotArmed =>
                write!(f, "acquisition not armed"),
            Self::AlreadyRunning =>
                write!(f, "acquisition already running"),
            Self::Cancelled =>
                write!(f, "acquisition stopped while arming"),
            Self::Unsupported(what) =>
                write!(f, "unsupported operation: {}", what),
            Self::Timeout(what) =>
                write!(f, "timed out {}", what),
            Self::InvalidConfig(message) =>
                write!(f, "invalid configuration: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            &Self::Communication(ref io_error) => Some(io_error),
            _ => None
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::NotFound => // converted from io::Error in first place
                Self::new(io::ErrorKind::NotFound, error),
            Error::Communication(io_error) =>
                io_error,
            Error::Timeout(_) =>
                Self::new(io::ErrorKind::TimedOut, error),
            error =>
                Self::new(io::ErrorKind::Other, error),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            return Error::NotFound
        }
        match error.downcast::<Self>() {
            Ok(error) => error,
            Err(error) => Error::Communication(error),
        }
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use config::{
    Resolution,
    ChannelCount,
    ScanConfig,
    PollPolicy,
};

pub use params::{
    Geometry,
    PixelClock,
    ScanParameters,
    X_RETRACE_LEN,
    Y_RETRACE_LEN,
};

pub use averaging::{
    AveragingPolicy,
    GainSchedule,
    RecursiveFilter,
};

pub use waveform::{
    Waveform,
    GalvoPosition,
};

pub use device::{
    Device,
    Dirty,
    Enable,
};

pub use capture::{
    Frame,
};

pub use acquisition::{
    ScanController,
    Acquisition,
    FrameCount,
    FrameSink,
    ClockSource,
    TriggerSource,
};
