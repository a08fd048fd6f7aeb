//! Boundary towards the application hosting the scan device.
//!
//! [`ScanDevice`] is object safe, so a host can keep any number of devices as
//! `Box<dyn ScanDevice>` and dispatch to them however it likes.

use bitflags::bitflags;

use crate::{Acquisition, Resolution, Result, ScanConfig, ScanController};
use crate::sys::Driver;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const Clock    = 1<<0;
        const Scanner  = 1<<1;
        const Detector = 1<<2;
    }
}

pub trait ScanDevice: Send + Sync {
    fn model_name(&self) -> &str;
    fn instance_name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;
    fn resolutions(&self) -> &[Resolution];

    /// Width and height of delivered images, in pixels.
    fn image_size(&self) -> (u32, u32);
    fn magnification(&self) -> f64;
    fn channel_count(&self) -> usize;

    fn bytes_per_sample(&self) -> usize {
        2
    }

    fn arm(&self, config: ScanConfig, acquisition: Acquisition) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
    fn wait(&self) -> Result<()>;
}

impl<D: Driver> ScanDevice for ScanController<D> {
    fn model_name(&self) -> &str {
        "galvoscan"
    }

    fn instance_name(&self) -> &str {
        self.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn resolutions(&self) -> &[Resolution] {
        &Resolution::ALL
    }

    fn image_size(&self) -> (u32, u32) {
        let pixels = self.config().resolution.pixels();
        (pixels, pixels)
    }

    fn magnification(&self) -> f64 {
        self.config().magnification()
    }

    fn channel_count(&self) -> usize {
        self.config().channels.count()
    }

    fn arm(&self, config: ScanConfig, acquisition: Acquisition) -> Result<()> {
        ScanController::arm(self, config, acquisition)
    }

    fn start(&self) -> Result<()> {
        ScanController::start(self)
    }

    fn stop(&self) -> Result<()> {
        ScanController::stop(self)
    }

    fn is_running(&self) -> bool {
        ScanController::is_running(self)
    }

    fn wait(&self) -> Result<()> {
        ScanController::wait(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ChannelCount, Frame, FrameCount};
    use crate::device::test::{poll_policy, small_config};
    use crate::sys::sim::Simulator;

    #[test]
    fn test_dynamic_dispatch() {
        let controller = ScanController::open("sim0", Simulator::new(), poll_policy()).unwrap();
        let device: Box<dyn ScanDevice> = Box::new(controller);
        assert_eq!(device.instance_name(), "sim0");
        assert_eq!(device.resolutions().len(), 4);
        assert_eq!(device.bytes_per_sample(), 2);

        let config = ScanConfig { channels: ChannelCount::Three, zoom: 2.0, ..small_config() };
        let acquisition = Acquisition::new(FrameCount::Finite(1),
            |_channel: usize, _frame: Frame| true);
        device.arm(config, acquisition).unwrap();
        assert_eq!(device.image_size(), (256, 256));
        assert_eq!(device.channel_count(), 3);
        assert_eq!(device.magnification(), 1.0);
        device.start().unwrap();
        device.wait().unwrap();
        assert!(!device.is_running());
    }
}
