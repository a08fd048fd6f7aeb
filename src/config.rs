//! High-level configuration of a scan in terms of physical qualities.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use crate::averaging::AveragingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Resolution {
    Px256,
    #[default]
    Px512,
    Px1024,
    Px2048,
}

impl Resolution {
    pub const ALL: [Resolution; 4] =
        [Resolution::Px256, Resolution::Px512, Resolution::Px1024, Resolution::Px2048];

    pub fn pixels(self) -> u32 {
        match self {
            Self::Px256  => 256,
            Self::Px512  => 512,
            Self::Px1024 => 1024,
            Self::Px2048 => 2048,
        }
    }
}

impl TryFrom<u32> for Resolution {
    type Error = Error;

    fn try_from(pixels: u32) -> Result<Self> {
        Resolution::ALL.into_iter()
            .find(|resolution| resolution.pixels() == pixels)
            .ok_or_else(|| Error::InvalidConfig(format!("unsupported resolution {}", pixels)))
    }
}

impl From<Resolution> for u32 {
    fn from(resolution: Resolution) -> u32 {
        resolution.pixels()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelCount {
    #[default]
    One,
    Two,
    Three,
    Four,
}

impl ChannelCount {
    pub fn count(self) -> usize {
        match self {
            Self::One   => 1,
            Self::Two   => 2,
            Self::Three => 3,
            Self::Four  => 4,
        }
    }
}

impl TryFrom<u8> for ChannelCount {
    type Error = Error;

    fn try_from(count: u8) -> Result<Self> {
        match count {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            4 => Ok(Self::Four),
            _ => Err(Error::InvalidConfig(format!("unsupported channel count {}", count))),
        }
    }
}

impl From<ChannelCount> for u8 {
    fn from(channels: ChannelCount) -> u8 {
        channels.count() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub resolution: Resolution,
    pub zoom: f64,
    /// Galvo offset in optical degrees, `[x, y]`.
    pub offset: [f64; 2],
    pub pixel_rate_hz: f64,
    /// Undershoot in pixels; compensates the lag between mirror command and mirror position.
    pub line_delay: u32,
    pub channels: ChannelCount,
    pub averaging: AveragingPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            resolution: Default::default(),
            zoom: 1.0,
            offset: [0.0, 0.0],
            pixel_rate_hz: 0.2e6,
            line_delay: 50,
            channels: Default::default(),
            averaging: Default::default(),
        }
    }
}

impl ScanConfig {
    pub const ZOOM_RANGE: (f64, f64) = (1.0, 40.0);
    // Rough correspondence to the galvo sensitivity; not calibrated.
    pub const OFFSET_RANGE: (f64, f64) = (-10.0, 10.0);
    /// Undershoot samples before the active part of every line.
    pub const LINE_DELAY_RANGE: (u32, u32) = (0, 1024);
    pub const PIXEL_RATES_HZ: [f64; 11] = [
        0.05e6, 0.08e6, 0.10e6, 0.12e6, 0.15e6, 0.20e6, 0.25e6, 0.30e6, 0.35e6, 0.40e6, 0.50e6,
    ];

    pub fn validate(&self) -> Result<()> {
        let in_range = |value: f64, (min, max): (f64, f64)| value >= min && value <= max;
        if !in_range(self.zoom, Self::ZOOM_RANGE) {
            return Err(Error::InvalidConfig(format!("zoom {} out of range", self.zoom)))
        }
        for (axis, &offset) in ["x", "y"].iter().zip(self.offset.iter()) {
            if !in_range(offset, Self::OFFSET_RANGE) {
                return Err(Error::InvalidConfig(
                    format!("{} offset {} out of range", axis, offset)))
            }
        }
        let (min_delay, max_delay) = Self::LINE_DELAY_RANGE;
        if self.line_delay < min_delay || self.line_delay > max_delay {
            return Err(Error::InvalidConfig(
                format!("line delay {} out of range", self.line_delay)))
        }
        if !Self::PIXEL_RATES_HZ.iter().any(|&rate| (rate - self.pixel_rate_hz).abs() < 1.0) {
            return Err(Error::InvalidConfig(
                format!("unsupported pixel rate {} Hz", self.pixel_rate_hz)))
        }
        self.averaging.validate()
    }

    /// Magnification relative to the default resolution at unit zoom.
    pub fn magnification(&self) -> f64 {
        self.resolution.pixels() as f64 / Resolution::default().pixels() as f64 * self.zoom
    }
}

/// Timing of the polling loops used to talk to the device, which offers no interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub poll_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Maximum number of polling iterations of each streaming phase; derived from the estimated
    /// frame time if unset.
    pub stall_budget: Option<u32>,
    pub upload_row_interval_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            idle_timeout_ms: 10_000,
            read_timeout_ms: 3_000,
            write_timeout_ms: 10_000,
            stall_budget: None,
            upload_row_interval_ms: 1,
        }
    }
}

impl PollPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn upload_row_interval(&self) -> Duration {
        Duration::from_millis(self.upload_row_interval_ms)
    }

    /// Polling iterations tolerated per streaming phase: twice the frame time, unless overridden.
    pub fn stall_budget(&self, frame_time: Duration) -> u32 {
        match self.stall_budget {
            Some(budget) => budget,
            None => {
                let interval = self.poll_interval().max(Duration::from_millis(1));
                let budget = 2 * frame_time.as_millis() / interval.as_millis();
                (budget as u32).max(1)
            }
        }
    }
}
