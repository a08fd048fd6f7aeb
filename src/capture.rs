//! Frame streamer.
//!
//! Every detector channel has its own target-to-host stream. A sub-frame is read from all enabled
//! channels in lock-step: first wait until every stream has produced something, then drain each
//! stream into a fixed-size buffer. The device offers no completion signal, so both phases poll
//! with a bounded number of iterations and carry on with partial data when the budget runs out.

use std::thread::sleep;
use std::time::Duration;

use crate::{Error, Result};
use crate::device::{Device, Enable};
use crate::regs::fpga;
use crate::sys::Driver;

/// One channel of one delivered image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: usize,
    /// Index of the output frame within the acquisition.
    pub index: u64,
    /// Position of the sub-frame within its averaging cycle.
    pub sub_frame: u32,
    pub resolution: u32,
    /// Unfiltered samples, row-major.
    pub raw: Vec<u16>,
    /// Samples after the device's recursive filter, row-major.
    pub filtered: Vec<u16>,
}

impl Frame {
    fn from_words(channel: usize, index: u64, sub_frame: u32, resolution: u32,
                  words: &[u32]) -> Frame {
        Frame {
            channel,
            index,
            sub_frame,
            resolution,
            raw: words.iter().map(|&word| word as u16).collect(),
            filtered: words.iter().map(|&word| (word >> 16) as u16).collect(),
        }
    }
}

/// Which sub-frame to read and what to do with it.
#[derive(Debug, Clone, Copy)]
pub struct SubFrame {
    pub index: u64,
    pub sub_frame: u32,
    pub channels: usize,
    pub resolution: u32,
    /// Read the sub-frame but do not assemble frames from it.
    pub discard: bool,
    /// Polling iterations allowed per phase.
    pub stall_budget: u32,
}

#[derive(Debug)]
struct ChannelBuffer {
    channel: usize,
    stream: u32,
    words: Vec<u32>,
    filled: usize,
    /// Words left in the stream after the last read.
    remaining: usize,
    percent: Option<usize>,
}

impl ChannelBuffer {
    fn new(channel: usize, capacity: usize) -> ChannelBuffer {
        ChannelBuffer {
            channel,
            stream: fpga::READ_STREAMS[channel],
            words: vec![0; capacity],
            filled: 0,
            remaining: 0,
            percent: None,
        }
    }

    fn is_full(&self) -> bool {
        self.filled == self.words.len()
    }

    fn probe<D: Driver>(&self, driver: &D, timeout: Duration) -> Result<usize> {
        driver.read_stream(self.stream, &mut [], timeout)
    }

    fn log_progress(&mut self) {
        let percent = self.filled * 100 / self.words.len();
        if self.percent.map_or(true, |previous| percent > previous) {
            log::debug!("read channel {} {}%", self.channel, percent);
            self.percent = Some(percent);
        }
    }

    /// Reads whatever the stream has available, up to the end of the buffer.
    fn read_available<D: Driver>(&mut self, driver: &D, timeout: Duration) -> Result<()> {
        let available = self.probe(driver, timeout)?;
        let count = available.min(self.words.len() - self.filled);
        if count == 0 {
            return Ok(())
        }
        assert!(self.filled + count <= self.words.len(),
            "read of {} words overflows channel {} buffer", count, self.channel);
        let chunk = &mut self.words[self.filled..self.filled + count];
        self.remaining = driver.read_stream(self.stream, chunk, timeout)?;
        self.filled += count;
        log::trace!("channel {}: read {} words, {} left in stream",
            self.channel, count, self.remaining);
        Ok(())
    }
}

fn stop_streams<D: Driver>(driver: &D, buffers: &[ChannelBuffer]) -> Result<()> {
    for buffer in buffers {
        driver.stop_stream(buffer.stream)?;
    }
    Ok(())
}

/// Fill-wait and drain phases; the caller stops the streams however this returns.
fn stream_channels<D: Driver>(device: &Device<D>, buffers: &mut [ChannelBuffer],
                              stall_budget: u32) -> Result<()> {
    let driver = device.driver();
    let poll = device.poll_policy();
    for buffer in buffers.iter() {
        driver.start_stream(buffer.stream)?;
    }

    let mut iterations = 0;
    loop {
        let mut ready = true;
        for buffer in buffers.iter() {
            ready &= buffer.probe(driver, Duration::ZERO)? > 0;
        }
        if ready {
            break
        }
        iterations += 1;
        if iterations > stall_budget {
            log::warn!("scan timeout");
            break
        }
        sleep(poll.poll_interval());
    }

    let mut iterations = 0;
    while !buffers.iter().all(ChannelBuffer::is_full) {
        iterations += 1;
        if iterations > stall_budget {
            log::warn!("read image timeout");
            break
        }
        for buffer in buffers.iter_mut().filter(|buffer| !buffer.is_full()) {
            buffer.log_progress();
            buffer.read_available(driver, poll.read_timeout())?;
        }
        if !buffers.iter().all(ChannelBuffer::is_full) {
            sleep(poll.poll_interval());
        }
    }
    Ok(())
}

/// Reads one sub-frame from the first `request.channels` detector streams.
pub fn read_sub_frame<D: Driver>(device: &Device<D>, request: &SubFrame) -> Result<Vec<Frame>> {
    let pixels = (request.resolution * request.resolution) as usize;
    let mut buffers = (0..request.channels)
        .map(|channel| ChannelBuffer::new(channel, pixels))
        .collect::<Vec<_>>();

    if device.enable().contains(Enable::Detector) {
        log::debug!("reading sub-frame {} of frame {}", request.sub_frame, request.index);
        let streamed = stream_channels(device, &mut buffers, request.stall_budget);
        let stopped = stop_streams(device.driver(), &buffers);
        streamed?;
        stopped?;
        if let Some(buffer) = buffers.iter().find(|buffer| buffer.remaining > 0) {
            return Err(Error::DataLeftInFifo {
                channel: buffer.channel,
                remaining: buffer.remaining,
            })
        }
    }

    if request.discard {
        return Ok(Vec::new())
    }
    Ok(buffers.iter()
        .map(|buffer| Frame::from_words(buffer.channel, request.index, request.sub_frame,
            request.resolution, &buffer.words))
        .collect())
}
