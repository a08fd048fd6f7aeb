//! Register-level scan parameters derived from a [`ScanConfig`].

use std::time::Duration;

use crate::config::ScanConfig;

/// Fast axis retrace length, in samples.
pub const X_RETRACE_LEN: u32 = 438;
/// Slow axis retrace length, in lines.
pub const Y_RETRACE_LEN: u32 = 128;

/// Frequency of the pixel clock timebase.
pub const CLOCK_BASE_HZ: f64 = 40e6;
/// Pixel clock pulse width is this many ticks shorter than the pixel time.
pub const PULSE_WIDTH_OFFSET_TICKS: i32 = 4;
/// Lines the slow axis spends on frame retrace, as understood by the bitfile.
pub const FRAME_RETRACE_TIME: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub resolution: u32,
    pub line_delay: u32,
    /// Samples per fast axis line: undershoot, active pixels, retrace.
    pub elements_per_line: u32,
    /// Fast axis lines per frame: active lines and slow axis retrace.
    pub elements_per_row: u32,
    /// Waveform memory size, in samples.
    pub total_elements: u32,
    pub total_pixels: u32,
    pub max_dram_address: u32,
}

impl Geometry {
    /// Values saturate at `u32::MAX`; such a geometry fails to upload instead of wrapping.
    pub fn derive(resolution: u32, line_delay: u32) -> Geometry {
        let elements_per_line = line_delay.saturating_add(resolution).saturating_add(X_RETRACE_LEN);
        let elements_per_row = resolution.saturating_add(Y_RETRACE_LEN);
        let total_pixels = resolution.saturating_mul(resolution);
        Geometry {
            resolution,
            line_delay,
            elements_per_line,
            elements_per_row,
            total_elements: elements_per_line.saturating_mul(elements_per_row),
            total_pixels,
            max_dram_address: total_pixels / 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelClock {
    pub pixel_time_ticks: i32,
    pub pulse_width_ticks: i32,
    pub initial_delay: i32,
}

impl PixelClock {
    pub fn derive(pixel_rate_hz: f64) -> PixelClock {
        let pixel_time_ticks = (CLOCK_BASE_HZ / pixel_rate_hz).round() as i32;
        PixelClock {
            pixel_time_ticks,
            pulse_width_ticks: pixel_time_ticks - PULSE_WIDTH_OFFSET_TICKS,
            initial_delay: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParameters {
    pub geometry: Geometry,
    pub clock: PixelClock,
    pub pixel_rate_hz: f64,
}

impl ScanParameters {
    pub fn derive(config: &ScanConfig) -> ScanParameters {
        ScanParameters {
            geometry: Geometry::derive(config.resolution.pixels(), config.line_delay),
            clock: PixelClock::derive(config.pixel_rate_hz),
            pixel_rate_hz: config.pixel_rate_hz,
        }
    }

    /// Time the device needs to scan one frame, retrace included.
    pub fn frame_time(&self) -> Duration {
        let rate = (self.pixel_rate_hz.round() as u64).max(1);
        Duration::from_micros(self.geometry.total_elements as u64 * 1_000_000 / rate)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Resolution;

    #[test]
    fn test_geometry_512() {
        let geometry = Geometry::derive(512, 50);
        assert_eq!(geometry.elements_per_line, 1000);
        assert_eq!(geometry.elements_per_row, 640);
        assert_eq!(geometry.total_elements, 640_000);
        assert_eq!(geometry.total_pixels, 262_144);
        assert_eq!(geometry.max_dram_address, 16_384);
    }

    #[test]
    fn test_geometry_saturates() {
        let geometry = Geometry::derive(2048, 2_000_000);
        assert_eq!(geometry.elements_per_line, 2_002_486);
        assert_eq!(geometry.total_elements, u32::MAX);
        let geometry = Geometry::derive(2048, u32::MAX);
        assert_eq!(geometry.elements_per_line, u32::MAX);
    }

    #[test]
    fn test_pixel_clock() {
        let clock = PixelClock::derive(0.2e6);
        assert_eq!(clock.pixel_time_ticks, 200);
        assert_eq!(clock.pulse_width_ticks, 196);
        let clock = PixelClock::derive(0.12e6);
        assert_eq!(clock.pixel_time_ticks, 333);
    }

    #[test]
    fn test_frame_time() {
        let config = ScanConfig { resolution: Resolution::Px512, ..Default::default() };
        let params = ScanParameters::derive(&config);
        assert_eq!(params.frame_time(), Duration::from_millis(3200));
    }
}
