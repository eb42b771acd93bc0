//! The half-duplex audio peripheral and the roles that may own it.

use std::time::Duration;

use alsa::pcm::PCM;
use serde::{Deserialize, Serialize};

use super::alsa_device;
use crate::{Error, Result};

/// A role that can request exclusive use of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusRole {
    Capture,
    Playback,
}

/// Current holder of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BusOwner {
    #[default]
    Free,
    Capture,
    Playback,
}

impl From<BusRole> for BusOwner {
    fn from(role: BusRole) -> Self {
        match role {
            BusRole::Capture => BusOwner::Capture,
            BusRole::Playback => BusOwner::Playback,
        }
    }
}

/// Data direction the peripheral is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Everything the peripheral needs to (re)configure itself for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralSettings {
    pub direction: Direction,
    pub device: String,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub channels: u32,
}

/// Bus configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Width of the raw capture container (32 on I2S MEMS microphones)
    pub capture_bits: u32,
    pub playback_bits: u32,
    /// Upper bound for a single blocking read
    pub read_timeout_ms: u64,
    /// Upper bound for a single blocking write
    pub write_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            sample_rate: 16000,
            channels: 1,
            capture_bits: 32,
            playback_bits: 16,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
        }
    }
}

impl BusConfig {
    pub fn settings_for(&self, role: BusRole) -> PeripheralSettings {
        match role {
            BusRole::Capture => PeripheralSettings {
                direction: Direction::Input,
                device: self.capture_device.clone(),
                sample_rate: self.sample_rate,
                bits_per_sample: self.capture_bits,
                channels: self.channels,
            },
            BusRole::Playback => PeripheralSettings {
                direction: Direction::Output,
                device: self.playback_device.clone(),
                sample_rate: self.sample_rate,
                bits_per_sample: self.playback_bits,
                channels: self.channels,
            },
        }
    }

    /// Bytes per second of 16-bit PCM at the bus rate and channel count.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels * 2
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// The physical audio interface. Only [`super::BusArbitrator`] calls these.
pub trait AudioBus: Send {
    /// Tear down any previous configuration and configure for `settings`.
    fn configure(&mut self, settings: &PeripheralSettings) -> Result<()>;

    /// Tear down the current configuration. Must be safe to call repeatedly.
    fn shutdown(&mut self);

    /// Read raw capture samples, waiting at most `timeout`. Returns samples read.
    fn read(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize>;

    /// Write 16-bit little-endian PCM bytes. Returns bytes accepted.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;
}

/// Max consecutive XRUN recoveries before the rest of a write is dropped.
const MAX_WRITE_RECOVERIES: u32 = 3;

/// ALSA-backed bus: the PCM is re-opened in the requested direction on every
/// ownership change.
#[derive(Default)]
pub struct AlsaBus {
    pcm: Option<(PCM, Direction, u32)>,
}

impl AlsaBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBus for AlsaBus {
    fn configure(&mut self, settings: &PeripheralSettings) -> Result<()> {
        self.shutdown();
        let (pcm, negotiated) =
            alsa_device::open(settings).map_err(|e| Error::Peripheral(format!("{:#}", e)))?;
        self.pcm = Some((pcm, settings.direction, negotiated.channels));
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some((pcm, direction, _)) = self.pcm.take() {
            if direction == Direction::Output {
                if let Err(e) = pcm.drain() {
                    log::debug!("ALSA drain on shutdown failed: {}", e);
                }
            } else if let Err(e) = pcm.drop() {
                log::debug!("ALSA drop on shutdown failed: {}", e);
            }
            log::info!("ALSA {:?} device closed", direction);
        }
    }

    fn read(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize> {
        let Some((pcm, Direction::Input, channels)) = self.pcm.as_ref() else {
            return Err(Error::Peripheral("capture device not configured".into()));
        };
        let channels = (*channels).max(1) as usize;

        let ready = pcm.wait(Some(timeout.as_millis() as u32))?;
        if !ready {
            return Err(Error::Timeout("capture samples"));
        }

        let io = pcm.io_i32()?;
        match io.readi(buf) {
            Ok(frames) => Ok(frames * channels),
            Err(e) => {
                // 触发 ALSA 硬件恢复状态机，下一轮再读
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare()?;
                Err(e.into())
            }
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let Some((pcm, Direction::Output, channels)) = self.pcm.as_ref() else {
            return Err(Error::Peripheral("playback device not configured".into()));
        };
        let channels = (*channels).max(1) as usize;

        let samples: Vec<i16> = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        let io = pcm.io_i16()?;
        let total_frames = samples.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            // 设备卡死时不能无限阻塞，总线锁还在我们手里
            if !pcm.wait(Some(timeout.as_millis() as u32))? {
                if frames_written == 0 {
                    return Err(Error::Timeout("playback space"));
                }
                log::warn!(
                    "ALSA playback stalled, dropping {} unwritten frames",
                    total_frames - frames_written
                );
                break;
            }
            let offset = frames_written * channels;
            match io.writei(&samples[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare()?;

                    if retry_count >= MAX_WRITE_RECOVERIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }

        Ok(frames_written * channels * 2)
    }
}
