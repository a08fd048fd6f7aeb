//! Register and stream access to the scan engine.

use std::time::Duration;

use crate::Result;

pub mod library;
pub mod sim;

/// Register/stream interface of the FPGA.
///
/// Registers are addressed by the ids in [`crate::regs`]-style maps and hold 32-bit values.
/// Streams are DMA FIFOs of 32-bit words; target-to-host streams are read, host-to-target
/// streams are written. Every call may fail with a hardware communication error.
pub trait Driver: Send + 'static {
    /// Resets the FPGA to its power-on state.
    fn reset(&self) -> Result<()>;
    /// Starts the FPGA logic after a reset.
    fn run(&self) -> Result<()>;

    fn read_scalar(&self, addr: u32) -> Result<u32>;
    fn write_scalar(&self, addr: u32, value: u32) -> Result<()>;

    fn start_stream(&self, stream: u32) -> Result<()>;
    fn stop_stream(&self, stream: u32) -> Result<()>;

    /// Fills `data` from a target-to-host stream, waiting up to `timeout` for enough words, and
    /// returns the number of words still available afterwards. An empty `data` probes the number
    /// of available words.
    fn read_stream(&self, stream: u32, data: &mut [u32], timeout: Duration) -> Result<usize>;

    /// Writes `data` into a host-to-target stream, waiting up to `timeout` for space, and returns
    /// the remaining free space. An empty `data` probes the free space.
    fn write_stream(&self, stream: u32, data: &[u32], timeout: Duration) -> Result<usize>;

    /// Process-wide setup of the driver library; runs before the first device is opened.
    fn initialize() -> Result<()> where Self: Sized {
        Ok(())
    }

    /// Process-wide teardown of the driver library; runs after the last device is closed.
    fn finalize() -> Result<()> where Self: Sized {
        Ok(())
    }
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
#[path = "linux.rs"]
pub mod imp;

#[cfg(all(target_os = "linux", feature = "hardware"))]
pub use imp::XdmaDriver;
