pub mod pump;
pub mod threaded;

use serde::Deserialize;

pub use pump::{AudioPump, AudioSink, AudioSource};
pub use threaded::ThreadedDeviceIO;

pub const DIRECTION_READ: u32 = 1;
pub const DIRECTION_WRITE: u32 = 2;
pub const DIRECTION_DUPLEX: u32 = DIRECTION_READ | DIRECTION_WRITE;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    pub device: String,
    pub sample_rate: i32,
    /// Bytes per fragment; also the chunk size of both queues.
    pub fragment_size: usize,
    pub fragment_count: usize,
    pub channels: i32,
    /// Bitmask of [`DIRECTION_READ`] and [`DIRECTION_WRITE`].
    pub direction: u32,
    pub bits: i32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            device: "/dev/dsp".to_string(),
            sample_rate: 44100,
            fragment_size: 1024,
            fragment_count: 3,
            channels: 2,
            direction: DIRECTION_WRITE,
            bits: 16,
        }
    }
}

impl AudioParams {
    pub fn reads(&self) -> bool {
        self.direction & DIRECTION_READ != 0
    }

    pub fn writes(&self) -> bool {
        self.direction & DIRECTION_WRITE != 0
    }

    pub fn direction_name(&self) -> &'static str {
        match (self.reads(), self.writes()) {
            (true, true) => "duplex",
            (true, false) => "capture",
            (false, true) => "playback",
            (false, false) => "none",
        }
    }
}

/// Blocking sound device. Both halves are used concurrently from the reader
/// and writer threads, hence `&self`.
pub trait Device: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&self, buf: &[u8]) -> std::io::Result<usize>;
}

#[cfg(unix)]
pub struct OssDevice {
    dsp: arts_oss::Dsp,
}

#[cfg(unix)]
impl OssDevice {
    pub fn open(params: &AudioParams) -> std::io::Result<Self> {
        let request = arts_oss::DspRequest {
            path: params.device.clone(),
            rate: params.sample_rate,
            channels: params.channels,
            bits: params.bits,
            fragment_size: params.fragment_size as i32,
            fragment_count: params.fragment_count as i32,
            direction: params.direction,
        };
        let dsp = arts_oss::Dsp::open(&request)?;
        tracing::debug!(
            "{}: {} Hz, {} channels, fragments {}x{}",
            params.device,
            dsp.rate,
            dsp.channels,
            dsp.fragment_count,
            dsp.fragment_size
        );
        Ok(Self { dsp })
    }
}

#[cfg(unix)]
impl Device for OssDevice {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut &self.dsp.dsp, buf)
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::Write::write(&mut &self.dsp.dsp, buf)
    }
}
