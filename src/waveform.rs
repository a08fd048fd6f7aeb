//! Galvo drive waveforms for one raster frame.
//!
//! The fast axis (x) sweeps linearly across the active pixels after an undershoot ramp that lets
//! the mirror reach scan velocity, then returns to the start of the next line along a cubic
//! Hermite retrace whose end slopes match the scan slope. The slow axis (y) holds one sample per
//! line and retraces the same way at the end of the frame.

use crate::{Error, Result};
use crate::params::{Geometry, X_RETRACE_LEN, Y_RETRACE_LEN};

/// Galvo command range, in volts.
const FULL_SCALE_VOLTS: f64 = 10.0;
/// Half of the scanned span at unit zoom, in volts.
const SCAN_HALF_SPAN_VOLTS: f64 = 2.5;

/// Galvo position in DAC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GalvoPosition {
    pub x: u16,
    pub y: u16,
}

impl GalvoPosition {
    /// Packs the position into the `x << 16 | y` word used by the waveform memory.
    pub fn packed(self) -> u32 {
        (self.x as u32) << 16 | self.y as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waveform {
    /// One line of fast axis samples, `elements_per_line` long.
    pub x: Vec<u16>,
    /// One sample per line, `elements_per_row` long.
    pub y: Vec<u16>,
}

impl Waveform {
    /// Generates the waveform for `geometry` at `zoom`, shifted by `offset` (`[x, y]`, in volts).
    pub fn generate(geometry: &Geometry, zoom: f64, offset: [f64; 2]) -> Result<Waveform> {
        let half_span = SCAN_HALF_SPAN_VOLTS / zoom;
        let x = galvo_waveform(geometry.resolution, X_RETRACE_LEN, geometry.line_delay,
            offset[0] - half_span, offset[0] + half_span);
        let y = galvo_waveform(geometry.resolution, Y_RETRACE_LEN, 0,
            offset[1] - half_span, offset[1] + half_span);
        debug_assert_eq!(x.len(), geometry.elements_per_line as usize);
        debug_assert_eq!(y.len(), geometry.elements_per_row as usize);
        Ok(Waveform { x: scale(&x)?, y: scale(&y)? })
    }

    /// First sample of the frame; the galvos are parked here before scanning starts.
    pub fn start(&self) -> GalvoPosition {
        GalvoPosition { x: self.x[0], y: self.y[0] }
    }

    /// Samples of row `index`, packed for the waveform memory.
    pub fn packed_row(&self, index: usize, row: &mut Vec<u32>) {
        let y = self.y[index];
        row.clear();
        row.extend(self.x.iter().map(|&x| GalvoPosition { x, y }.packed()));
    }
}

fn galvo_waveform(scan_len: u32, retrace_len: u32, undershoot_len: u32,
                  scan_start: f64, scan_end: f64) -> Vec<f64> {
    let step = (scan_end - scan_start) / scan_len as f64;
    let ramp_start = scan_start - undershoot_len as f64 * step;
    let ramp_len = undershoot_len + scan_len;
    let mut waveform = Vec::with_capacity((ramp_len + retrace_len) as usize);
    waveform.extend((0..ramp_len).map(|i| ramp_start + i as f64 * step));
    let ramp_end = ramp_start + (ramp_len - 1) as f64 * step;
    waveform.extend(spline_interpolate(retrace_len, ramp_end, ramp_start, step, step));
    waveform
}

/// Interior points of a cubic Hermite segment spanning `n + 1` sample intervals between
/// `y_first` and `y_last`, with slopes given per sample.
fn spline_interpolate(n: u32, y_first: f64, y_last: f64,
                      slope_first: f64, slope_last: f64) -> impl Iterator<Item = f64> {
    let span = (n + 1) as f64;
    (1..=n).map(move |i| {
        let t = i as f64 / span;
        let (t2, t3) = (t * t, t * t * t);
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * y_first + h10 * span * slope_first + h01 * y_last + h11 * span * slope_last
    })
}

fn scale(volts: &[f64]) -> Result<Vec<u16>> {
    volts.iter()
        .map(|&volts| {
            if !(-FULL_SCALE_VOLTS..=FULL_SCALE_VOLTS).contains(&volts) {
                return Err(Error::WaveformOutOfRange)
            }
            let code = (volts / FULL_SCALE_VOLTS + 1.0) * (u16::MAX as f64 / 2.0);
            Ok(code.round() as u16)
        })
        .collect()
}
