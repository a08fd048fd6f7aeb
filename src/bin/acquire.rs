use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;

use galvoscan::{Acquisition, Error, Frame, FrameCount, PollPolicy, ScanConfig, ScanController};
use galvoscan::host::ScanDevice;
use galvoscan::sys::sim::Simulator;

/// Acquire images from a galvo scanning microscope and save them as raw 16-bit files.
#[derive(Parser, Debug)]
#[command(name = "galvoscan-acquire", version)]
struct Cli {
    /// TOML file with `[scan]` and `[poll]` tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path prefix of the XDMA device nodes
    #[arg(long, default_value = "/dev/xdma0")]
    device: String,

    /// Use the built-in simulator instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Number of frames to acquire; 0 scans until stopped
    #[arg(short, long, default_value_t = 1)]
    frames: u64,

    /// Stop the acquisition after this many seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Directory receiving one `frameNNNNN_chN.raw` file per delivered channel
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    scan: ScanConfig,
    poll: PollPolicy,
}

impl ConfigFile {
    fn load(path: &Path) -> galvoscan::Result<ConfigFile> {
        let text = std::fs::read_to_string(path)
            .map_err(|error| Error::InvalidConfig(format!("{}: {}", path.display(), error)))?;
        toml::from_str(&text)
            .map_err(|error| Error::InvalidConfig(format!("{}: {}", path.display(), error)))
    }
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
fn open_hardware(path: &str, poll: PollPolicy) -> galvoscan::Result<Box<dyn ScanDevice>> {
    let driver = galvoscan::sys::XdmaDriver::new(path)?;
    Ok(Box::new(ScanController::open(path, driver, poll)?))
}

#[cfg(not(all(target_os = "linux", feature = "hardware")))]
fn open_hardware(_path: &str, _poll: PollPolicy) -> galvoscan::Result<Box<dyn ScanDevice>> {
    Err(Error::Unsupported("hardware backend not built; use --simulate"))
}

fn open_device(cli: &Cli, poll: PollPolicy) -> galvoscan::Result<Box<dyn ScanDevice>> {
    if cli.simulate {
        Ok(Box::new(ScanController::open("simulator", Simulator::new(), poll)?))
    } else {
        open_hardware(&cli.device, poll)
    }
}

fn save_frame(output: &Path, frame: &Frame) -> std::io::Result<PathBuf> {
    let path = output.join(format!("frame{:05}_ch{}.raw", frame.index, frame.channel));
    std::fs::write(&path, bytemuck::cast_slice::<u16, u8>(&frame.filtered))?;
    Ok(path)
}

fn main() -> galvoscan::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    std::fs::create_dir_all(&cli.output)?;

    let device = open_device(&cli, file.poll)?;
    let frames = match cli.frames {
        0 => FrameCount::Unbounded,
        count => FrameCount::Finite(count),
    };
    let output = cli.output.clone();
    let acquisition = Acquisition::new(frames, move |_channel: usize, frame: Frame| {
        match save_frame(&output, &frame) {
            Ok(path) => {
                log::info!("saved {}", path.display());
                true
            }
            Err(error) => {
                log::error!("cannot save frame {}: {}", frame.index, error);
                false
            }
        }
    });

    device.arm(file.scan, acquisition)?;
    let (width, height) = device.image_size();
    println!("acquiring {:?} frames of {}x{} pixels, {} channel(s), from {}",
        frames, width, height, device.channel_count(), device.instance_name());
    device.start()?;

    if let Some(seconds) = cli.duration {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        while device.is_running() && Instant::now() < deadline {
            sleep(Duration::from_millis(50));
        }
        device.stop()?;
    }
    device.wait()?;
    println!("done");
    Ok(())
}
