//! Frame averaging policy.
//!
//! The device filters every pixel recursively, `filtered[k] = filtered[k-1] + g_k * (raw[k] -
//! filtered[k-1])`, with a gain `g_k` programmed by the host before sub-frame `k` of an averaging
//! cycle. With the default [`GainSchedule::RunningMean`], `g_k = 1/(k+1)`: the first sub-frame
//! passes through unchanged and the last sub-frame of a cycle of `n` holds the mean of all `n`.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainSchedule {
    /// `g_k = 1/(k+1)`; the filtered image is the cumulative mean of the cycle.
    #[default]
    RunningMean,
    /// `g_0 = 1`, `g_k = gain` afterwards; an exponential moving average.
    Fixed(f64),
}

impl GainSchedule {
    /// Gain to program before sub-frame `k` (0-indexed) of an averaging cycle.
    pub fn gain(&self, k: u32) -> f64 {
        match (*self, k) {
            (_, 0) => 1.0,
            (GainSchedule::RunningMean, k) => 1.0 / (k as f64 + 1.0),
            (GainSchedule::Fixed(gain), _) => gain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingPolicy {
    /// Sub-frames per averaging cycle.
    pub frames_to_average: u32,
    /// Deliver every sub-frame as the current estimate, instead of only the last of each cycle.
    pub progressive: bool,
    pub gain: GainSchedule,
}

impl Default for AveragingPolicy {
    fn default() -> Self {
        Self {
            frames_to_average: 1,
            progressive: true,
            gain: Default::default(),
        }
    }
}

impl AveragingPolicy {
    pub const MAX_FRAMES_TO_AVERAGE: u32 = 100;

    pub fn validate(&self) -> Result<()> {
        if !(1..=Self::MAX_FRAMES_TO_AVERAGE).contains(&self.frames_to_average) {
            return Err(Error::InvalidConfig(
                format!("cannot average {} frames", self.frames_to_average)))
        }
        if let GainSchedule::Fixed(gain) = self.gain {
            if !(gain > 0.0 && gain <= 1.0) {
                return Err(Error::InvalidConfig(format!("filter gain {} out of range", gain)))
            }
        }
        Ok(())
    }

    /// Sub-frames read from the device for each delivered output frame.
    pub fn sub_frames_per_output(&self) -> u32 {
        if self.progressive { 1 } else { self.frames_to_average }
    }

    /// Position of output frame `index` within its averaging cycle, for progressive averaging.
    pub fn cycle_position(&self, index: u64) -> u32 {
        (index % self.frames_to_average as u64) as u32
    }
}

/// Converts to the unsigned 16-bit fixed point format used by the device, with `int_bits`
/// integer bits.
pub fn to_fixed16(value: f64, int_bits: u32) -> u16 {
    let frac_bits = 16 - int_bits;
    (value * (1u32 << frac_bits) as f64).round().clamp(0.0, u16::MAX as f64) as u16
}

pub fn from_fixed16(code: u16, int_bits: u32) -> f64 {
    let frac_bits = 16 - int_bits;
    code as f64 / (1u32 << frac_bits) as f64
}

/// Host-side model of the device's recursive filter over one image.
#[derive(Debug, Clone, Default)]
pub struct RecursiveFilter {
    estimate: Vec<f64>,
}

impl RecursiveFilter {
    pub fn new() -> RecursiveFilter {
        RecursiveFilter::default()
    }

    /// Blends `raw` into the estimate with `gain` and returns the rounded estimate.
    pub fn update(&mut self, raw: &[u16], gain: f64) -> Vec<u16> {
        if self.estimate.len() != raw.len() {
            self.estimate = raw.iter().map(|&sample| sample as f64).collect();
        } else {
            for (estimate, &sample) in self.estimate.iter_mut().zip(raw) {
                *estimate += gain * (sample as f64 - *estimate);
            }
        }
        self.estimate.iter()
            .map(|&estimate| estimate.round().clamp(0.0, u16::MAX as f64) as u16)
            .collect()
    }
}
