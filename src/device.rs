use std::time::{Duration, Instant};
use std::thread::sleep;

use bitflags::bitflags;

use crate::{Error, Result};
use crate::averaging::to_fixed16;
use crate::config::{PollPolicy, ScanConfig};
use crate::params::{Geometry, PixelClock, ScanParameters, FRAME_RETRACE_TIME};
use crate::regs::fpga::{self, FpgaState, Handshake};
use crate::sys::Driver;
use crate::sys::library::{DriverLibrary, LibraryHandle};
use crate::waveform::{GalvoPosition, Waveform};

bitflags! {
    /// Parts of the device configuration that no longer match the requested [`ScanConfig`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dirty: u8 {
        /// Any register derived from the configuration.
        const Settings = 1<<0;
        /// The waveform memory and the geometry registers; implies `Settings`.
        const Waveform = 1<<1;
    }
}

impl Dirty {
    pub fn between(old: &ScanConfig, new: &ScanConfig) -> Dirty {
        let mut dirty = Dirty::empty();
        if old != new {
            dirty |= Dirty::Settings;
        }
        if old.resolution != new.resolution || old.zoom != new.zoom ||
                old.offset != new.offset || old.line_delay != new.line_delay {
            dirty |= Dirty::Waveform;
        }
        dirty
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Enable: u8 {
        const Scanner  = 1<<0;
        const Detector = 1<<1;
    }
}

#[derive(Debug)]
pub struct Device<D: Driver> {
    driver: D,
    poll: PollPolicy,
    config: ScanConfig,
    enable: Enable,
    dirty: Dirty,
    start_position: GalvoPosition,
    _library: LibraryHandle,
}

impl<D: Driver> Device<D> {
    pub fn open(driver: D, poll: PollPolicy) -> Result<Device<D>> {
        let library = DriverLibrary::global().open::<D>()?;
        let mut device = Device {
            driver,
            poll,
            config: ScanConfig::default(),
            enable: Enable::all(),
            dirty: Dirty::all(),
            start_position: GalvoPosition::default(),
            _library: library,
        };
        device.start_fpga()?;
        Ok(device)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn poll_policy(&self) -> &PollPolicy {
        &self.poll
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn enable(&self) -> Enable {
        self.enable
    }

    pub fn dirty(&self) -> Dirty {
        self.dirty
    }

    /// Galvo position at the first sample of the uploaded waveform.
    pub fn start_position(&self) -> GalvoPosition {
        self.start_position
    }

    /// Requests `config` and `enable` for the next scan; nothing is written to the device until
    /// [`Device::apply_configuration`].
    pub fn configure(&mut self, config: ScanConfig, enable: Enable) {
        let mut dirty = Dirty::between(&self.config, &config);
        if enable != self.enable {
            dirty |= Dirty::Settings;
        }
        if !dirty.is_empty() {
            log::debug!("configuration changed, dirty = {:?}", dirty);
        }
        self.dirty |= dirty;
        self.config = config;
        self.enable = enable;
    }

    /// Forces a full reconfiguration, waveform upload included, before the next scan.
    pub fn mark_dirty(&mut self) {
        self.dirty = Dirty::all();
    }

    /// Brings the registers and, if needed, the waveform memory in line with the requested
    /// configuration.
    pub fn apply_configuration(&mut self, sub_frames: u32) -> Result<()> {
        if self.dirty.is_empty() {
            log::debug!("configuration up to date");
            return Ok(())
        }
        let reload_waveform = self.dirty.contains(Dirty::Waveform);
        let params = ScanParameters::derive(&self.config);

        log::debug!("setting up new scan");
        if reload_waveform {
            self.start_fpga()?;
            self.wait_till_idle()?;
        }
        self.set_built_in_parameters()?;
        self.set_pixel_parameters(&params.clock)?;
        self.clean_flags()?;
        if reload_waveform {
            self.set_resolution_parameters(&params.geometry)?;
        }
        self.set_task_parameters(sub_frames)?;

        log::debug!("clearing DRAM");
        self.init_scan()?;
        self.wait_till_idle()?;

        if reload_waveform {
            let waveform = Waveform::generate(&params.geometry, self.config.zoom,
                self.config.offset)?;
            let start_position = self.write_waveform(&waveform)?;
            self.wait_till_idle()?;
            self.move_galvos_to(start_position)?;
            self.start_position = start_position;
        }

        self.dirty = Dirty::empty();
        Ok(())
    }

    fn read_scalar(&self, addr: u32) -> Result<u32> {
        let value = self.driver.read_scalar(addr)?;
        log::trace!("read_scalar({:#x}) = {:#x}", addr, value);
        Ok(value)
    }

    fn write_scalar(&mut self, addr: u32, value: u32) -> Result<()> {
        log::trace!("write_scalar({:#x}, {:#x})", addr, value);
        self.driver.write_scalar(addr, value)
    }

    fn write_bool(&mut self, addr: u32, value: bool) -> Result<()> {
        self.write_scalar(addr, value as u32)
    }

    pub fn read_state(&self) -> Result<u32> {
        self.read_scalar(fpga::ADDR_CURRENT_STATE)
    }

    fn write_state(&mut self, state: FpgaState) -> Result<()> {
        log::debug!("write_state({:?})", state);
        self.write_scalar(fpga::ADDR_CURRENT_STATE, state.code())
    }

    /// Resets the FPGA and checks that it came up idle.
    pub fn start_fpga(&mut self) -> Result<()> {
        log::debug!("resetting FPGA");
        self.driver.reset()?;
        log::debug!("starting FPGA");
        self.driver.run()?;
        let state = self.read_state()?;
        if state != FpgaState::Idle.code() {
            log::error!("unexpected state {} after FPGA reset", state);
            return Err(Error::DeviceNotIdle { state })
        }
        Ok(())
    }

    pub fn wait_till_idle(&self) -> Result<()> {
        let deadline = Instant::now() + self.poll.idle_timeout();
        loop {
            if self.read_state()? == FpgaState::Idle.code() {
                return Ok(())
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for idle state"))
            }
            sleep(self.poll.poll_interval());
        }
    }

    pub fn set_built_in_parameters(&mut self) -> Result<()> {
        self.write_scalar(fpga::ADDR_FRAME_RETRACE_TIME, FRAME_RETRACE_TIME)
    }

    pub fn set_pixel_parameters(&mut self, clock: &PixelClock) -> Result<()> {
        log::debug!("set_pixel_parameters({:?})", clock);
        self.write_scalar(fpga::ADDR_PIXEL_TIME_TICK, clock.pixel_time_ticks as u32)?;
        self.write_scalar(fpga::ADDR_PIXEL_CLOCK_PULSE_WIDTH_TICK,
            clock.pulse_width_ticks as u32)?;
        self.write_scalar(fpga::ADDR_PIXEL_PULSE_INITIAL_DELAY, clock.initial_delay as u32)
    }

    pub fn set_resolution_parameters(&mut self, geometry: &Geometry) -> Result<()> {
        log::debug!("set_resolution_parameters({:?})", geometry);
        self.write_scalar(fpga::ADDR_RESOLUTION, geometry.resolution)?;
        self.write_scalar(fpga::ADDR_ELEMENTS_PER_LINE, geometry.elements_per_line)?;
        self.write_scalar(fpga::ADDR_MAX_ADDR, geometry.elements_per_line)?;
        self.write_scalar(fpga::ADDR_TOTAL_ELEMENTS, geometry.total_elements)?;
        self.write_scalar(fpga::ADDR_NUM_ELEMENTS, geometry.total_elements)?;
        self.write_scalar(fpga::ADDR_SAMPLES_PER_FRAME, geometry.total_pixels)?;
        self.write_scalar(fpga::ADDR_MAX_DRAM_ADDRESS, geometry.max_dram_address)?;
        self.write_scalar(fpga::ADDR_NUM_UNDERSHOOT, geometry.line_delay)
    }

    /// Pushes the per-acquisition registers. The filter gain is put under host control and reset
    /// to pass-through; see [`Device::set_filter_gain`].
    pub fn set_task_parameters(&mut self, sub_frames: u32) -> Result<()> {
        log::debug!("set_task_parameters(sub_frames={}, averaging={}, enable={:?})",
            sub_frames, self.config.averaging.frames_to_average, self.enable);
        self.write_scalar(fpga::ADDR_NUMBER_OF_FRAMES, sub_frames)?;
        self.write_scalar(fpga::ADDR_AVERAGING_FACTOR, self.config.averaging.frames_to_average)?;
        self.write_bool(fpga::ADDR_CUSTOMIZED_FILTER_GAIN, true)?;
        self.write_scalar(fpga::ADDR_FILTER_GAIN, to_fixed16(1.0, 1) as u32)?;
        self.write_bool(fpga::ADDR_ENABLE_SCANNER, self.enable.contains(Enable::Scanner))?;
        self.write_bool(fpga::ADDR_ENABLE_DETECTOR, self.enable.contains(Enable::Detector))
    }

    pub fn set_filter_gain(&mut self, gain: f64) -> Result<()> {
        log::trace!("set_filter_gain({})", gain);
        self.write_scalar(fpga::ADDR_FILTER_GAIN, to_fixed16(gain, 1) as u32)
    }

    pub fn clean_flags(&mut self) -> Result<()> {
        for addr in Handshake::all().addrs() {
            self.write_bool(addr, false)?;
        }
        Ok(())
    }

    pub fn init_scan(&mut self) -> Result<()> {
        self.write_state(FpgaState::Init)
    }

    pub fn move_galvos_to(&mut self, position: GalvoPosition) -> Result<()> {
        log::debug!("moving galvos to {:?}", position);
        self.write_scalar(fpga::ADDR_GALVO_SIGNAL, position.packed())
    }

    pub fn start_scan(&mut self) -> Result<()> {
        log::debug!("starting scan");
        self.write_bool(fpga::ADDR_READY_TO_SCAN, true)?;
        self.write_state(FpgaState::Scan)
    }

    pub fn stop_scan(&mut self) -> Result<()> {
        log::debug!("stopping scan");
        self.write_bool(fpga::ADDR_READY_TO_SCAN, false)?;
        self.wait_till_idle()
    }

    /// Uploads `waveform` into the waveform memory, one fast axis line per slow axis sample, and
    /// returns the position of its first sample.
    pub fn write_waveform(&mut self, waveform: &Waveform) -> Result<GalvoPosition> {
        log::debug!("writing waveform");
        self.write_bool(fpga::ADDR_WRITE_DRAM_ENABLE, true)?;
        self.write_bool(fpga::ADDR_WRITE_FRAME_GALVO_SIGNAL, true)?;
        self.write_state(FpgaState::Write)?;

        let write_timeout = self.poll.write_timeout();
        let capacity = self.driver.write_stream(fpga::WRITE_STREAM_WAVEFORM, &[], Duration::ZERO)?;
        log::debug!("waveform stream has room for {} words", capacity);

        let rows = waveform.y.len();
        let mut row = Vec::with_capacity(waveform.x.len());
        let mut full = false;
        for index in 0..rows {
            if full {
                return Err(Error::WaveformMemorySizeMismatch { rows_written: index, rows })
            }
            waveform.packed_row(index, &mut row);
            self.driver.write_stream(fpga::WRITE_STREAM_WAVEFORM, &row, write_timeout)?;
            sleep(self.poll.upload_row_interval());
            full = self.read_scalar(fpga::ADDR_GALVO_SIGNAL_WRITE_DONE)? != 0;
        }
        if !full {
            return Err(Error::WaveformMemorySizeMismatch { rows_written: rows, rows })
        }
        Ok(waveform.start())
    }

    /// Parks the device; the reset closes the shutter.
    pub fn shutdown(&mut self) -> Result<()> {
        self.start_fpga()?;
        self.write_state(FpgaState::Stop)
    }
}
