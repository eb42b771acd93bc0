//! audio - Half-duplex bus arbitration, capture, command recording and playback
//!
//! A single ALSA-backed peripheral serves either capture or playback at a
//! time. [`BusArbitrator`] decides who holds it; the [`AudioSystem`] worker
//! thread is the only code that moves it between roles.

mod alsa_device;
mod arbitrator;
mod audio_system;
pub mod bus;
pub mod capture;
pub mod pcm;
pub mod playback;
pub mod recorder;
pub mod ring_buffer;

#[cfg(test)]
pub(crate) mod testing;

pub use arbitrator::BusArbitrator;
pub use audio_system::{
    AudioConfig, AudioServices, AudioStatus, AudioSystem, AudioWorker, PlaybackControls,
};
pub use bus::{AlsaBus, AudioBus, BusConfig, BusOwner, BusRole, Direction, PeripheralSettings};
pub use capture::{CaptureBuffers, CaptureConfig, CapturePipeline, WakeConfig};
pub use playback::{
    ByteStream, CancelHandle, GainControl, PlaybackConfig, PlaybackEngine, PlaybackOutcome,
    PlaybackSource,
};
pub use recorder::{CommandRecorder, RecorderConfig, RecorderState, SilenceGate, StopReason};
pub use ring_buffer::{CaptureRing, Snapshot};
