//! Acquisition control: the arm/start/stop state machine and the worker thread that runs the
//! scan.
//!
//! All flags live in one [`AcquisitionState`] behind one mutex, with a condition variable that is
//! signaled when the worker finishes. Hardware is only touched outside of the state lock, so
//! status queries never wait for a slow register write; the device has its own lock, held by
//! `arm` while configuring and by the worker for the duration of the scan.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::{Error, Result};
use crate::averaging::AveragingPolicy;
use crate::capture::{self, Frame, SubFrame};
use crate::config::{PollPolicy, ScanConfig};
use crate::device::{Device, Enable};
use crate::params::ScanParameters;
use crate::regs::fpga::UNBOUNDED_FRAMES;
use crate::sys::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Software,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCount {
    Finite(u64),
    Unbounded,
}

impl FrameCount {
    fn includes(self, index: u64) -> bool {
        match self {
            FrameCount::Finite(count) => index < count,
            FrameCount::Unbounded => true,
        }
    }

    /// Sub-frames the device has to scan, saturating at the unbounded sentinel.
    pub fn sub_frames(self, policy: &AveragingPolicy) -> u32 {
        match self {
            FrameCount::Finite(count) =>
                count.saturating_mul(policy.sub_frames_per_output() as u64)
                    .min(UNBOUNDED_FRAMES as u64) as u32,
            FrameCount::Unbounded =>
                UNBOUNDED_FRAMES,
        }
    }
}

/// Receiver of delivered frames, called on the worker thread once per channel of every output
/// frame, in channel order. Returning `false` ends the acquisition.
pub trait FrameSink: Send {
    fn on_frame(&mut self, channel: usize, frame: Frame) -> bool;
}

impl<F: FnMut(usize, Frame) -> bool + Send> FrameSink for F {
    fn on_frame(&mut self, channel: usize, frame: Frame) -> bool {
        self(channel, frame)
    }
}

/// What the host asks of one acquisition.
pub struct Acquisition {
    pub frames: FrameCount,
    pub clock: bool,
    pub scanner: bool,
    pub detector: bool,
    pub clock_source: ClockSource,
    pub start_trigger: TriggerSource,
    sink: Box<dyn FrameSink>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("frames", &self.frames)
            .field("clock", &self.clock)
            .field("scanner", &self.scanner)
            .field("detector", &self.detector)
            .field("clock_source", &self.clock_source)
            .field("start_trigger", &self.start_trigger)
            .finish_non_exhaustive()
    }
}

impl Acquisition {
    /// Requests clock, scanner and detector, started by software on the internal clock.
    pub fn new<S: FrameSink + 'static>(frames: FrameCount, sink: S) -> Acquisition {
        Acquisition {
            frames,
            clock: true,
            scanner: true,
            detector: true,
            clock_source: ClockSource::Internal,
            start_trigger: TriggerSource::Software,
            sink: Box::new(sink),
        }
    }

    fn enable(&self) -> Result<Enable> {
        if !self.clock || !self.scanner {
            return Err(Error::Unsupported("acquisition without clock and scanner"))
        }
        if self.start_trigger != TriggerSource::Software {
            return Err(Error::Unsupported("hardware start trigger"))
        }
        if self.clock_source != ClockSource::Internal {
            return Err(Error::Unsupported("external clock"))
        }
        let mut enable = Enable::Scanner;
        if self.detector {
            enable |= Enable::Detector;
        }
        Ok(enable)
    }
}

/// `started` implies `armed`, which implies `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct AcquisitionState {
    running: bool,
    armed: bool,
    started: bool,
    stop_requested: bool,
}

struct Shared<D: Driver> {
    state: Mutex<AcquisitionState>,
    finished: Condvar,
    config: Mutex<ScanConfig>,
    pending: Mutex<Option<Acquisition>>,
    device: Mutex<Device<D>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: Driver> Shared<D> {
    fn state(&self) -> MutexGuard<'_, AcquisitionState> {
        lock(&self.state)
    }

    fn wait_finished<'a>(&self, guard: MutexGuard<'a, AcquisitionState>)
            -> MutexGuard<'a, AcquisitionState> {
        self.finished.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// The only way out of a running acquisition.
    fn finish(&self) {
        *self.state() = AcquisitionState::default();
        self.finished.notify_all();
    }
}

/// Clears the state if configuring the device unwinds before `arm` could.
struct ArmingGuard<'a, D: Driver>(Option<&'a Shared<D>>);

impl<D: Driver> Drop for ArmingGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(shared) = self.0 {
            shared.finish();
        }
    }
}

/// Calls [`Shared::finish`] however the worker exits, panics included.
struct FinishGuard<'a, D: Driver>(&'a Shared<D>);

impl<D: Driver> Drop for FinishGuard<'_, D> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

pub struct ScanController<D: Driver> {
    name: String,
    shared: Arc<Shared<D>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Driver> std::fmt::Debug for ScanController<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("name", &self.name)
            .field("state", &*self.shared.state())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> ScanController<D> {
    pub fn open(name: &str, driver: D, poll: PollPolicy) -> Result<ScanController<D>> {
        let device = Device::open(driver, poll)?;
        log::info!("opened scan device {}", name);
        Ok(ScanController {
            name: name.to_owned(),
            shared: Arc::new(Shared {
                state: Mutex::new(AcquisitionState::default()),
                finished: Condvar::new(),
                config: Mutex::new(*device.config()),
                pending: Mutex::new(None),
                device: Mutex::new(device),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration of the current or most recently armed acquisition.
    pub fn config(&self) -> ScanConfig {
        *lock(&self.shared.config)
    }

    /// Configures the device for `config` and holds `acquisition` until [`ScanController::start`].
    ///
    /// Arming again before starting only replaces the pending acquisition; the device is not
    /// touched, and `config` and the detector request are ignored.
    pub fn arm(&self, config: ScanConfig, mut acquisition: Acquisition) -> Result<()> {
        let enable = acquisition.enable()?;
        {
            let mut state = self.shared.state();
            if state.running && state.armed {
                if state.started {
                    return Err(Error::AlreadyRunning)
                }
                if config != self.config() {
                    log::warn!("already armed; ignoring configuration change");
                }
                let mut pending = lock(&self.shared.pending);
                if let Some(pending) = pending.as_ref() {
                    if pending.detector != acquisition.detector {
                        log::warn!("already armed; ignoring detector enable change");
                        acquisition.detector = pending.detector;
                    }
                }
                log::debug!("already armed");
                *pending = Some(acquisition);
                return Ok(())
            }
            if state.running {
                return Err(Error::AlreadyRunning)
            }
            config.validate()?;
            *state = AcquisitionState { running: true, ..Default::default() };
        }

        let mut arming = ArmingGuard(Some(&self.shared));
        *lock(&self.shared.config) = config;
        let result = {
            let mut device = lock(&self.shared.device);
            device.configure(config, enable);
            device.apply_configuration(acquisition.frames.sub_frames(&config.averaging))
        };
        arming.0 = None;

        let mut state = self.shared.state();
        let result = match result {
            Ok(()) if state.stop_requested => Err(Error::Cancelled),
            result => result,
        };
        match result {
            Ok(()) => {
                state.armed = true;
                *lock(&self.shared.pending) = Some(acquisition);
                log::debug!("armed");
                Ok(())
            }
            Err(error) => {
                log::debug!("arming failed: {}", error);
                *state = AcquisitionState::default();
                self.shared.finished.notify_all();
                Err(error)
            }
        }
    }

    /// Starts the armed acquisition on a worker thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state();
        if !(state.running && state.armed) {
            return Err(Error::NotArmed)
        }
        if state.started {
            return Err(Error::AlreadyRunning)
        }
        let acquisition = lock(&self.shared.pending).take().ok_or(Error::NotArmed)?;
        // the previous worker has already finished
        self.join_worker();
        state.started = true;
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("galvoscan-acquisition".to_owned())
            .spawn(move || run(&shared, acquisition));
        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                Ok(())
            }
            Err(error) => {
                *state = AcquisitionState::default();
                self.shared.finished.notify_all();
                Err(Error::Communication(error))
            }
        }
    }

    /// Requests the acquisition to stop at the next frame boundary and waits until it has.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.state();
        if !state.running {
            return Ok(())
        }
        if state.armed && !state.started {
            log::debug!("disarmed");
            *state = AcquisitionState::default();
            lock(&self.shared.pending).take();
            self.shared.finished.notify_all();
            return Ok(())
        }
        log::debug!("stop requested");
        state.stop_requested = true;
        while state.running {
            state = self.shared.wait_finished(state);
        }
        drop(state);
        self.join_worker();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Waits for a started acquisition to finish. Returns at once if nothing was started.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state();
        while state.running && (state.started || !state.armed) {
            state = self.shared.wait_finished(state);
        }
        drop(state);
        self.join_worker();
        Ok(())
    }

    /// Stops any acquisition and parks the device.
    pub fn close(self) -> Result<()> {
        self.stop()?;
        lock(&self.shared.device).shutdown()?;
        log::info!("closed scan device {}", self.name);
        Ok(())
    }

    fn join_worker(&self) {
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("acquisition thread panicked");
            }
        }
    }
}

impl<D: Driver> Drop for ScanController<D> {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            log::error!("cannot stop acquisition: {}", error);
        }
    }
}

fn run<D: Driver>(shared: &Shared<D>, mut acquisition: Acquisition) {
    let _finish = FinishGuard(shared);
    let mut device = lock(&shared.device);
    if let Err(error) = acquire(shared, &mut device, &mut acquisition) {
        log::error!("error during acquisition: {}", error);
        if let Err(error) = device.stop_scan() {
            log::warn!("cannot stop scan: {}", error);
        }
        device.mark_dirty();
    }
}

fn acquire<D: Driver>(shared: &Shared<D>, device: &mut Device<D>,
                      acquisition: &mut Acquisition) -> Result<()> {
    let config = *device.config();
    let params = ScanParameters::derive(&config);
    let sub_frames = acquisition.frames.sub_frames(&config.averaging);
    let stall_budget = device.poll_policy().stall_budget(params.frame_time());
    log::debug!("estimated frame time {:?}, stall budget {}", params.frame_time(), stall_budget);

    device.set_task_parameters(sub_frames)?;
    device.wait_till_idle()?;
    device.move_galvos_to(device.start_position())?;
    log::info!("starting acquisition of {:?} frames ({} sub-frames, {} averaged)",
        acquisition.frames, sub_frames, config.averaging.frames_to_average);
    device.start_scan()?;

    let mut index = 0;
    while acquisition.frames.includes(index) {
        if shared.state().stop_requested {
            log::info!("acquisition stopped after {} frames", index);
            device.stop_scan()?;
            device.mark_dirty();
            return Ok(())
        }
        if !acquire_frame(device, &mut *acquisition.sink, &config, index, stall_budget)? {
            log::info!("frame {} refused, stopping acquisition", index);
            device.stop_scan()?;
            device.mark_dirty();
            return Ok(())
        }
        index += 1;
    }

    device.stop_scan()?;
    log::info!("acquisition of {} frames done", index);
    Ok(())
}

/// Reads the sub-frames making up output frame `index` and delivers it. Returns `false` if the
/// sink refused a frame.
fn acquire_frame<D: Driver>(device: &mut Device<D>, sink: &mut dyn FrameSink, config: &ScanConfig,
                            index: u64, stall_budget: u32) -> Result<bool> {
    let policy = &config.averaging;
    let cycle = if policy.progressive {
        let position = policy.cycle_position(index);
        position..position + 1
    } else {
        0..policy.frames_to_average
    };
    for sub_frame in cycle {
        device.set_filter_gain(policy.gain.gain(sub_frame))?;
        let request = SubFrame {
            index,
            sub_frame,
            channels: config.channels.count(),
            resolution: config.resolution.pixels(),
            discard: !policy.progressive && sub_frame + 1 != policy.frames_to_average,
            stall_budget,
        };
        for frame in capture::read_sub_frame(device, &request)? {
            if !sink.on_frame(frame.channel, frame) {
                return Ok(false)
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use crate::config::ChannelCount;
    use crate::device::test::{poll_policy, small_config};
    use crate::regs::fpga;
    use crate::sys::sim::Simulator;

    type Delivered = Arc<Mutex<Vec<Frame>>>;

    /// Simulator that panics on writes to one register.
    #[derive(Debug)]
    struct PanickingDriver {
        sim: Simulator,
        panic_on: Arc<Mutex<Option<u32>>>,
    }

    impl Driver for PanickingDriver {
        fn reset(&self) -> Result<()> {
            self.sim.reset()
        }

        fn run(&self) -> Result<()> {
            self.sim.run()
        }

        fn read_scalar(&self, addr: u32) -> Result<u32> {
            self.sim.read_scalar(addr)
        }

        fn write_scalar(&self, addr: u32, value: u32) -> Result<()> {
            let panic_on = *self.panic_on.lock().unwrap();
            if panic_on == Some(addr) {
                panic!("register {:#x} fault", addr);
            }
            self.sim.write_scalar(addr, value)
        }

        fn start_stream(&self, stream: u32) -> Result<()> {
            self.sim.start_stream(stream)
        }

        fn stop_stream(&self, stream: u32) -> Result<()> {
            self.sim.stop_stream(stream)
        }

        fn read_stream(&self, stream: u32, data: &mut [u32], timeout: Duration) -> Result<usize> {
            self.sim.read_stream(stream, data, timeout)
        }

        fn write_stream(&self, stream: u32, data: &[u32], timeout: Duration) -> Result<usize> {
            self.sim.write_stream(stream, data, timeout)
        }
    }

    fn open(sim: &Simulator) -> ScanController<Simulator> {
        ScanController::open("sim0", sim.clone(), poll_policy()).unwrap()
    }

    fn collect(frames: FrameCount) -> (Acquisition, Delivered) {
        let delivered = Delivered::default();
        let sink = delivered.clone();
        let acquisition = Acquisition::new(frames, move |_channel: usize, frame: Frame| {
            sink.lock().unwrap().push(frame);
            true
        });
        (acquisition, delivered)
    }

    fn first_pixels(delivered: &Delivered) -> Vec<(usize, u64, u32, u16)> {
        delivered.lock().unwrap().iter()
            .map(|frame| (frame.channel, frame.index, frame.sub_frame, frame.filtered[0]))
            .collect()
    }

    #[test]
    fn test_arm_start_wait() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, delivered) = collect(FrameCount::Finite(2));
        controller.arm(small_config(), acquisition).unwrap();
        assert!(controller.is_running());
        controller.start().unwrap();
        controller.wait().unwrap();
        assert!(!controller.is_running());
        assert_eq!(first_pixels(&delivered), [(0, 0, 0, 0), (0, 1, 0, 0x100)]);
        assert_eq!(sim.register(fpga::ADDR_NUMBER_OF_FRAMES), 2);
        assert_eq!(sim.register(fpga::ADDR_READY_TO_SCAN), 0);
    }

    #[test]
    fn test_concurrent_stop() {
        let sim = Simulator::new();
        let controller = Arc::new(open(&sim));
        let (acquisition, _delivered) = collect(FrameCount::Unbounded);
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        let stopper = {
            let controller = controller.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                controller.stop().unwrap();
            })
        };
        controller.wait().unwrap();
        stopper.join().unwrap();
        assert!(!controller.is_running());
        assert_eq!(sim.register(fpga::ADDR_NUMBER_OF_FRAMES), UNBOUNDED_FRAMES);
    }

    #[test]
    fn test_stop_before_first_frame() {
        let sim = Simulator::new();
        sim.set_chunk_size(1024);
        let controller = open(&sim);
        let (acquisition, delivered) = collect(FrameCount::Unbounded);
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        assert!(!controller.is_running());
        assert!(sim.sub_frames_produced(0) <= 1);
        assert!(delivered.lock().unwrap().len() <= 1);
    }

    #[test]
    fn test_stop_marks_dirty() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, _delivered) = collect(FrameCount::Unbounded);
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        let (acquisition, _delivered) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        assert_eq!(sim.waveform_uploads(), 2);
    }

    #[test]
    fn test_arm_is_idempotent() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        let writes = sim.write_count();
        let (acquisition, delivered) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        assert_eq!(sim.write_count(), writes);
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_misuse() {
        let sim = Simulator::new();
        let controller = open(&sim);
        assert!(matches!(controller.start(), Err(Error::NotArmed)));
        let (acquisition, _) = collect(FrameCount::Unbounded);
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        assert!(matches!(controller.start(), Err(Error::AlreadyRunning)));
        let (acquisition, _) = collect(FrameCount::Unbounded);
        assert!(matches!(controller.arm(small_config(), acquisition),
            Err(Error::AlreadyRunning)));
        controller.stop().unwrap();
        assert!(matches!(controller.start(), Err(Error::NotArmed)));
    }

    #[test]
    fn test_stop_disarms() {
        let sim = Simulator::new();
        let controller = open(&sim);
        controller.stop().unwrap();
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        controller.stop().unwrap();
        assert!(!controller.is_running());
        assert!(matches!(controller.start(), Err(Error::NotArmed)));
    }

    #[test]
    fn test_progressive_averaging() {
        let sim = Simulator::new()
            .with_pattern(|_channel, sub_frame, _pixel| 100 * (sub_frame as u16 + 1));
        let controller = open(&sim);
        let mut config = small_config();
        config.averaging.frames_to_average = 3;
        config.averaging.progressive = true;
        let (acquisition, delivered) = collect(FrameCount::Finite(3));
        controller.arm(config, acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(first_pixels(&delivered), [(0, 0, 0, 100), (0, 1, 1, 150), (0, 2, 2, 200)]);
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered[2].raw[0], 300);
    }

    #[test]
    fn test_block_averaging() {
        let sim = Simulator::new()
            .with_pattern(|_channel, sub_frame, _pixel| 100 * (sub_frame as u16 + 1));
        let controller = open(&sim);
        let mut config = small_config();
        config.averaging.frames_to_average = 3;
        config.averaging.progressive = false;
        let (acquisition, delivered) = collect(FrameCount::Finite(2));
        controller.arm(config, acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(sim.sub_frames_produced(0), 6);
        assert_eq!(sim.register(fpga::ADDR_NUMBER_OF_FRAMES), 6);
        assert_eq!(first_pixels(&delivered), [(0, 0, 2, 200), (0, 1, 2, 500)]);
    }

    #[test]
    fn test_channel_fan_out() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let config = ScanConfig { channels: ChannelCount::Two, ..small_config() };
        let (acquisition, delivered) = collect(FrameCount::Finite(2));
        controller.arm(config, acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        let channels = delivered.lock().unwrap().iter()
            .map(|frame| frame.channel)
            .collect::<Vec<_>>();
        assert_eq!(channels, [0, 1, 0, 1]);
    }

    #[test]
    fn test_reupload_only_on_geometry_change() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(sim.waveform_uploads(), 1);

        let mut config = small_config();
        config.averaging.frames_to_average = 2;
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(config, acquisition).unwrap();
        assert_eq!(sim.register(fpga::ADDR_AVERAGING_FACTOR), 2);
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(sim.waveform_uploads(), 1);

        let config = ScanConfig { zoom: 2.0, ..config };
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(config, acquisition).unwrap();
        assert_eq!(sim.waveform_uploads(), 2);
        controller.stop().unwrap();
    }

    #[test]
    fn test_refusal_stops_acquisition() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let config = ScanConfig { channels: ChannelCount::Two, ..small_config() };
        let calls = Arc::new(Mutex::new(Vec::new()));
        let acquisition = {
            let calls = calls.clone();
            Acquisition::new(FrameCount::Unbounded, move |channel: usize, _frame: Frame| {
                calls.lock().unwrap().push(channel);
                false
            })
        };
        controller.arm(config, acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert!(!controller.is_running());
        assert_eq!(*calls.lock().unwrap(), [0]);
    }

    #[test]
    fn test_unsupported_requests() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (mut acquisition, _) = collect(FrameCount::Finite(1));
        acquisition.start_trigger = TriggerSource::External;
        assert!(matches!(controller.arm(small_config(), acquisition), Err(Error::Unsupported(_))));
        let (mut acquisition, _) = collect(FrameCount::Finite(1));
        acquisition.clock_source = ClockSource::External;
        assert!(matches!(controller.arm(small_config(), acquisition), Err(Error::Unsupported(_))));
        let (mut acquisition, _) = collect(FrameCount::Finite(1));
        acquisition.scanner = false;
        assert!(matches!(controller.arm(small_config(), acquisition), Err(Error::Unsupported(_))));
        assert!(!controller.is_running());
    }

    #[test]
    fn test_invalid_config() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, _) = collect(FrameCount::Finite(1));
        let config = ScanConfig { zoom: 100.0, ..small_config() };
        assert!(matches!(controller.arm(config, acquisition), Err(Error::InvalidConfig(_))));
        assert!(!controller.is_running());
    }

    #[test]
    fn test_arm_failure_releases_waiters() {
        let sim = Simulator::new();
        let controller = open(&sim);
        sim.set_failing_register(Some(fpga::ADDR_FRAME_RETRACE_TIME));
        let (acquisition, _) = collect(FrameCount::Finite(1));
        assert!(matches!(controller.arm(small_config(), acquisition),
            Err(Error::Communication(_))));
        assert!(!controller.is_running());
        controller.wait().unwrap();
        sim.set_failing_register(None);
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
    }

    #[test]
    fn test_panicking_arm_releases_state() {
        let sim = Simulator::new();
        let panic_on = Arc::new(Mutex::new(None));
        let driver = PanickingDriver { sim: sim.clone(), panic_on: panic_on.clone() };
        let controller = ScanController::open("sim0", driver, poll_policy()).unwrap();
        *panic_on.lock().unwrap() = Some(fpga::ADDR_PIXEL_TIME_TICK);
        let (acquisition, _) = collect(FrameCount::Finite(1));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            controller.arm(small_config(), acquisition)
        }));
        assert!(result.is_err());
        assert!(!controller.is_running());
        controller.wait().unwrap();

        *panic_on.lock().unwrap() = None;
        let (acquisition, delivered) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(sim.register(fpga::ADDR_READY_TO_SCAN), 0);
    }

    #[test]
    fn test_rearm_checks_request() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, delivered) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();

        let (mut acquisition, _) = collect(FrameCount::Finite(1));
        acquisition.start_trigger = TriggerSource::External;
        assert!(matches!(controller.arm(small_config(), acquisition), Err(Error::Unsupported(_))));
        let (mut acquisition, _) = collect(FrameCount::Finite(1));
        acquisition.clock_source = ClockSource::External;
        assert!(matches!(controller.arm(small_config(), acquisition), Err(Error::Unsupported(_))));
        assert!(controller.is_running());

        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rearm_keeps_detector_enable() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (acquisition, _) = collect(FrameCount::Finite(1));
        controller.arm(small_config(), acquisition).unwrap();
        let (mut acquisition, delivered) = collect(FrameCount::Finite(1));
        acquisition.detector = false;
        controller.arm(small_config(), acquisition).unwrap();
        assert_eq!(sim.register(fpga::ADDR_ENABLE_DETECTOR), 1);
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(sim.sub_frames_produced(0), 1);
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_loop_error_ends_acquisition() {
        let sim = Simulator::new();
        sim.set_extra_samples(1);
        let controller = open(&sim);
        let (acquisition, delivered) = collect(FrameCount::Unbounded);
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert!(!controller.is_running());
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(sim.register(fpga::ADDR_READY_TO_SCAN), 0);
    }

    #[test]
    fn test_detector_not_requested() {
        let sim = Simulator::new();
        let controller = open(&sim);
        let (mut acquisition, delivered) = collect(FrameCount::Finite(1));
        acquisition.detector = false;
        controller.arm(small_config(), acquisition).unwrap();
        controller.start().unwrap();
        controller.wait().unwrap();
        assert_eq!(sim.register(fpga::ADDR_ENABLE_DETECTOR), 0);
        assert_eq!(sim.sub_frames_produced(0), 0);
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sub_frames() {
        let policy = AveragingPolicy { frames_to_average: 4, progressive: false, ..Default::default() };
        assert_eq!(FrameCount::Finite(3).sub_frames(&policy), 12);
        assert_eq!(FrameCount::Finite(u64::MAX).sub_frames(&policy), UNBOUNDED_FRAMES);
        assert_eq!(FrameCount::Unbounded.sub_frames(&policy), UNBOUNDED_FRAMES);
        let policy = AveragingPolicy { frames_to_average: 4, progressive: true, ..Default::default() };
        assert_eq!(FrameCount::Finite(3).sub_frames(&policy), 3);
    }
}
