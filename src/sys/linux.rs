use std::ffi::{CStr, CString};
use std::io;
use std::thread::sleep;
use std::time::{Duration, Instant};

use libc::{c_int, c_void};

use crate::{Error, Result};
use crate::regs::fpga::{self, BridgeControl};

/// Number of target-to-host DMA channels wired to detector streams.
const READ_STREAM_COUNT: u32 = 4;

/// Interval between occupancy polls while waiting on a stream.
const OCCUPANCY_POLL_INTERVAL: Duration = Duration::from_micros(200);

#[derive(Debug)]
struct Fd(c_int);

impl Fd {
    fn open(path: &CStr) -> io::Result<Fd> {
        unsafe {
            let fd = libc::open(path.as_ptr(), libc::O_RDWR);
            if fd == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(Fd(fd))
            }
        }
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) -> io::Result<()> {
        unsafe {
            let bytes_read = libc::pread(self.0, data.as_mut_ptr() as *mut c_void, data.len(),
                offset as libc::off_t);
            if bytes_read < 0 || bytes_read as usize != data.len() {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> io::Result<()> {
        unsafe {
            let bytes_written = libc::pwrite(self.0, data.as_ptr() as *const c_void, data.len(),
                offset as libc::off_t);
            if bytes_written < 0 || bytes_written as usize != data.len() {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            if libc::close(self.0) == -1 {
                log::error!("error closing fd: {}", io::Error::last_os_error())
            }
        }
    }
}

fn node_path(device_path: &str, suffix: &str) -> io::Result<CString> {
    CString::new(format!("{}_{}", device_path, suffix))
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))
}

/// Scan engine behind a Xilinx XDMA PCIe bridge.
///
/// Registers live in the `_user` BAR. Detector stream `n` is DMA channel `c2h_n` and the waveform
/// stream is `h2c_0`; stream occupancy and enables are bridge registers.
#[derive(Debug)]
pub struct XdmaDriver {
    user_fd: Fd,
    c2h_fds: Vec<Fd>,
    h2c_fd: Fd,
}

impl XdmaDriver {
    pub fn new(device_path: &str) -> Result<XdmaDriver> {
        let user_fd = Fd::open(&node_path(device_path, "user")?)?;
        let c2h_fds = (0..READ_STREAM_COUNT)
            .map(|index| Fd::open(&node_path(device_path, &format!("c2h_{}", index))?))
            .collect::<io::Result<Vec<_>>>()?;
        let h2c_fd = Fd::open(&node_path(device_path, "h2c_0")?)?;
        log::debug!("opened XDMA device {}", device_path);
        Ok(XdmaDriver { user_fd, c2h_fds, h2c_fd })
    }

    fn read_user_u32(&self, addr: u32) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.user_fd.read_at(addr as usize, &mut bytes[..])?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_user_u32(&self, addr: u32, data: u32) -> Result<()> {
        Ok(self.user_fd.write_at(addr as usize, &u32::to_le_bytes(data)[..])?)
    }

    fn modify_bridge_control<F: FnOnce(&mut BridgeControl)>(&self, f: F) -> Result<()> {
        let mut value = BridgeControl::from_bits_retain(
            self.read_user_u32(fpga::ADDR_BRIDGE_CONTROL)?);
        f(&mut value);
        log::trace!("bridge control = {:?}", value);
        self.write_user_u32(fpga::ADDR_BRIDGE_CONTROL, value.bits())
    }

    fn occupancy(&self, stream: u32) -> Result<usize> {
        Ok(self.read_user_u32(fpga::bridge_occupancy_addr(stream))? as usize)
    }

    /// Polls the occupancy of `stream` until it reaches `wanted` or `timeout` passes.
    fn wait_occupancy(&self, stream: u32, wanted: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let occupancy = self.occupancy(stream)?;
            if occupancy >= wanted {
                return Ok(occupancy)
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for DMA stream"))
            }
            sleep(OCCUPANCY_POLL_INTERVAL);
        }
    }

    fn c2h_fd(&self, stream: u32) -> Result<&Fd> {
        self.c2h_fds.get(stream as usize)
            .ok_or(Error::Unsupported("not a target-to-host stream"))
    }
}

impl super::Driver for XdmaDriver {
    fn reset(&self) -> Result<()> {
        self.modify_bridge_control(|val| val.remove(BridgeControl::FpgaResetN))?;
        sleep(Duration::from_micros(100));
        self.modify_bridge_control(|val| val.insert(BridgeControl::FpgaResetN))
    }

    fn run(&self) -> Result<()> {
        self.modify_bridge_control(|val| val.insert(BridgeControl::FpgaRun))
    }

    fn read_scalar(&self, addr: u32) -> Result<u32> {
        self.read_user_u32(addr)
    }

    fn write_scalar(&self, addr: u32, value: u32) -> Result<()> {
        self.write_user_u32(addr, value)
    }

    fn start_stream(&self, stream: u32) -> Result<()> {
        self.modify_bridge_control(|val| val.insert(BridgeControl::stream(stream)))
    }

    fn stop_stream(&self, stream: u32) -> Result<()> {
        self.modify_bridge_control(|val| val.remove(BridgeControl::stream(stream)))
    }

    fn read_stream(&self, stream: u32, data: &mut [u32], timeout: Duration) -> Result<usize> {
        let fd = self.c2h_fd(stream)?;
        if data.is_empty() {
            return self.occupancy(stream)
        }
        let available = self.wait_occupancy(stream, data.len(), timeout)?;
        fd.read_at(0, bytemuck::cast_slice_mut(data))?;
        Ok(available - data.len())
    }

    fn write_stream(&self, stream: u32, data: &[u32], timeout: Duration) -> Result<usize> {
        if stream != fpga::WRITE_STREAM_WAVEFORM {
            return Err(Error::Unsupported("not a host-to-target stream"))
        }
        if data.is_empty() {
            return self.occupancy(stream)
        }
        let vacancy = self.wait_occupancy(stream, data.len(), timeout)?;
        self.h2c_fd.write_at(0, bytemuck::cast_slice(data))?;
        Ok(vacancy - data.len())
    }
}
