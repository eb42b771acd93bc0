//! Chunked playback onto the shared bus with gain, cooperative cancellation
//! and an end-of-stream silence pad.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use super::arbitrator::BusArbitrator;
use super::bus::BusRole;
use super::pcm;
use super::recorder::ms_to_bytes;
use crate::audio_bridge::ToneKind;
use crate::{Error, Result};

pub const MAX_GAIN: f32 = 2.0;

/// Granularity of the post-write completion wait.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// How often a stalled stream wait re-checks for cancellation.
const STREAM_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Bytes per bus write; also the cancellation granularity
    pub chunk_bytes: usize,
    /// Initial gain, clamped to [0, 2]
    pub gain: f32,
    pub silence_pad_ms: u64,
    /// Added to the estimated remaining playout time
    pub settle_margin_ms: u64,
    /// Max wait for the next piece of a streamed source
    pub stream_timeout_ms: u64,
    pub synthesis_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 2048,
            gain: 1.0,
            silence_pad_ms: 100,
            settle_margin_ms: 200,
            stream_timeout_ms: 10000,
            synthesis_timeout_ms: 15000,
        }
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Audio to play: a complete buffer or a stream of PCM pieces.
pub enum PlaybackSource {
    Buffer(Bytes),
    Stream(ByteStream),
}

impl PlaybackSource {
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self::Stream(Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(Ok),
        )))
    }
}

impl fmt::Debug for PlaybackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed { bytes: usize },
    Cancelled { bytes: usize },
}

impl PlaybackOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Runtime-adjustable gain, shared between the engine and its controllers.
#[derive(Debug, Clone)]
pub struct GainControl(Arc<AtomicU32>);

impl GainControl {
    pub fn new(gain: f32) -> Self {
        let control = Self(Arc::new(AtomicU32::new(1.0f32.to_bits())));
        control.set(gain);
        control
    }

    /// Set the gain, clamped to [0, 2]. Returns the applied value.
    pub fn set(&self, gain: f32) -> f32 {
        let gain = if gain.is_nan() { 1.0 } else { gain.clamp(0.0, MAX_GAIN) };
        self.0.store(gain.to_bits(), Ordering::Relaxed);
        gain
    }

    /// Map a [0, 1] volume onto the gain range.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let volume = if volume.is_nan() { 0.5 } else { volume.clamp(0.0, 1.0) };
        self.set(volume * MAX_GAIN)
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Cooperative stop request, honoured at the next chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PlaybackEngine {
    arbitrator: Arc<BusArbitrator>,
    config: PlaybackConfig,
    gain: GainControl,
    cancel: CancelHandle,
    speaking: Arc<AtomicBool>,
}

impl PlaybackEngine {
    pub fn new(arbitrator: Arc<BusArbitrator>, config: PlaybackConfig) -> Self {
        let gain = GainControl::new(config.gain);
        Self {
            arbitrator,
            config,
            gain,
            cancel: CancelHandle::default(),
            speaking: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn gain_control(&self) -> GainControl {
        self.gain.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub(crate) fn speaking_flag(&self) -> Arc<AtomicBool> {
        self.speaking.clone()
    }

    pub fn set_gain(&self, gain: f32) -> f32 {
        self.gain.set(gain)
    }

    pub fn set_volume(&self, volume: f32) -> f32 {
        self.gain.set_volume(volume)
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Play a complete buffer. The caller's bytes are never modified.
    pub fn play(&self, pcm: &[u8]) -> Result<PlaybackOutcome> {
        self.run(|writer| {
            for chunk in pcm.chunks(self.config.chunk_bytes.max(2)) {
                if !writer.write(chunk)? {
                    return Ok(());
                }
            }
            Ok(())
        })
    }

    pub fn play_tone(&self, kind: ToneKind) -> Result<PlaybackOutcome> {
        let tone = pcm::tone(
            kind.frequency_hz(),
            kind.duration_ms(),
            self.arbitrator.config().sample_rate,
        );
        self.play(&tone)
    }

    /// Play a buffered or streamed source. Stream pieces are awaited on
    /// `handle` from the calling (non-async) thread.
    pub fn play_source(&self, source: PlaybackSource, handle: &Handle) -> Result<PlaybackOutcome> {
        match source {
            PlaybackSource::Buffer(bytes) => self.play(&bytes),
            PlaybackSource::Stream(mut stream) => {
                let wait = Duration::from_millis(self.config.stream_timeout_ms);
                self.run(|writer| {
                    loop {
                        // 分片等待，合成卡住时取消也能及时生效
                        let waiting = Instant::now();
                        let next = loop {
                            if writer.cancelled() {
                                return Ok(());
                            }
                            let slice = STREAM_POLL.min(wait.saturating_sub(waiting.elapsed()));
                            let polled = handle.block_on(async {
                                tokio::time::timeout(slice, stream.next()).await
                            });
                            match polled {
                                Ok(next) => break next,
                                Err(_) if waiting.elapsed() < wait => continue,
                                Err(_) => {
                                    log::warn!("Playback stream stalled for {:?}, ending early", wait);
                                    return Ok(());
                                }
                            }
                        };
                        let piece = match next {
                            Some(Ok(piece)) => piece,
                            Some(Err(e)) => {
                                log::warn!("Playback stream error, ending early: {}", e);
                                return Ok(());
                            }
                            None => return Ok(()),
                        };
                        for chunk in piece.chunks(self.config.chunk_bytes.max(2)) {
                            if !writer.write(chunk)? {
                                return Ok(());
                            }
                        }
                    }
                })
            }
        }
    }

    fn acquire(&self) -> Result<bool> {
        if self.arbitrator.has_access(BusRole::Playback) {
            return Ok(false);
        }
        if self.arbitrator.request(BusRole::Playback) {
            return Ok(true);
        }

        // 上一个持有者可能没有正常释放，强制回收一次再重试
        log::warn!(
            "Playback could not acquire bus from {:?}, forcing release",
            self.arbitrator.current_owner()
        );
        self.arbitrator.force_release();
        if self.arbitrator.request(BusRole::Playback) {
            Ok(true)
        } else {
            Err(Error::BusBusy(self.arbitrator.current_owner()))
        }
    }

    fn run<F>(&self, feed: F) -> Result<PlaybackOutcome>
    where
        F: FnOnce(&mut ChunkWriter<'_>) -> Result<()>,
    {
        self.cancel.reset();
        let acquired = self.acquire()?;
        self.speaking.store(true, Ordering::SeqCst);

        let mut writer = ChunkWriter {
            arbitrator: &self.arbitrator,
            cancel: &self.cancel,
            gain: &self.gain,
            timeout: self.arbitrator.config().write_timeout(),
            carry: None,
            written: 0,
            scratch: Vec::with_capacity(self.config.chunk_bytes + 1),
        };
        let started = Instant::now();
        let fed = feed(&mut writer);

        let outcome = match fed {
            Ok(()) if writer.cancelled() => {
                log::info!("Playback cancelled after {} bytes", writer.written);
                Ok(PlaybackOutcome::Cancelled { bytes: writer.written })
            }
            Ok(()) => {
                let bytes = writer.written;
                self.finish(&writer, started);
                if writer.cancelled() {
                    log::info!("Playback cancelled while draining, {} bytes written", bytes);
                    Ok(PlaybackOutcome::Cancelled { bytes })
                } else {
                    log::info!("Playback completed: {} bytes", bytes);
                    Ok(PlaybackOutcome::Completed { bytes })
                }
            }
            Err(e) => Err(e),
        };

        if acquired {
            self.arbitrator.release(BusRole::Playback);
        }
        self.speaking.store(false, Ordering::SeqCst);
        outcome
    }

    /// Silence pad, then wait out whatever the hardware still has queued.
    fn finish(&self, writer: &ChunkWriter<'_>, started: Instant) {
        let byte_rate = self.arbitrator.config().byte_rate();
        let pad = vec![0u8; ms_to_bytes(self.config.silence_pad_ms, byte_rate)];
        if !pad.is_empty() {
            if let Err(e) = self.arbitrator.write(BusRole::Playback, &pad, writer.timeout) {
                log::warn!("Failed to write silence pad: {}", e);
            }
        }

        let played = writer.written + pad.len();
        let estimated = Duration::from_millis(played as u64 * 1000 / byte_rate.max(1) as u64);
        let remaining = estimated.saturating_sub(started.elapsed())
            + Duration::from_millis(self.config.settle_margin_ms);

        let deadline = Instant::now() + remaining;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}

struct ChunkWriter<'a> {
    arbitrator: &'a BusArbitrator,
    cancel: &'a CancelHandle,
    gain: &'a GainControl,
    timeout: Duration,
    carry: Option<u8>,
    written: usize,
    scratch: Vec<u8>,
}

impl ChunkWriter<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write one chunk. Returns `false` once cancellation has been requested,
    /// in which case nothing was written.
    fn write(&mut self, chunk: &[u8]) -> Result<bool> {
        if self.cancelled() {
            return Ok(false);
        }

        // Stream pieces may split a sample; hold the odd byte for the next chunk.
        self.scratch.clear();
        self.scratch.extend(self.carry.take());
        self.scratch.extend_from_slice(chunk);
        if self.scratch.len() % 2 == 1 {
            self.carry = self.scratch.pop();
        }
        if self.scratch.is_empty() {
            return Ok(true);
        }

        // 每个分块重新读取增益，音量调整在播放中途生效
        let gain = self.gain.get();
        if gain != 1.0 {
            pcm::apply_gain(&mut self.scratch, gain);
        }

        match self.arbitrator.write(BusRole::Playback, &self.scratch, self.timeout) {
            Ok(n) => self.written += n,
            Err(e @ Error::NotOwner(_)) => return Err(e),
            Err(e) => log::warn!("Playback write failed: {}", e),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::bus::{BusConfig, BusOwner, Direction};
    use crate::audio::testing::{BusCall, MockBus};

    fn quiet_config() -> PlaybackConfig {
        PlaybackConfig {
            chunk_bytes: 4,
            silence_pad_ms: 0,
            settle_margin_ms: 0,
            ..PlaybackConfig::default()
        }
    }

    fn engine(config: PlaybackConfig) -> (PlaybackEngine, Arc<BusArbitrator>, MockBus) {
        let bus = MockBus::new();
        let arb = Arc::new(BusArbitrator::new(Box::new(bus.clone()), BusConfig::default()));
        (PlaybackEngine::new(arb.clone(), config), arb, bus)
    }

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn writes_in_chunks_and_releases() {
        let (engine, arb, bus) = engine(quiet_config());
        let pcm = bytes(&[1, 2, 3, 4, 5]);

        let outcome = engine.play(&pcm).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed { bytes: 10 });
        assert_eq!(bus.writes(), vec![pcm[0..4].to_vec(), pcm[4..8].to_vec(), pcm[8..10].to_vec()]);
        assert_eq!(arb.current_owner(), BusOwner::Free);
        assert_eq!(bus.configured_directions(), vec![Direction::Output]);
        assert!(!engine.is_speaking());
    }

    #[test]
    fn cancel_stops_at_next_chunk_boundary() {
        let (engine, arb, bus) = engine(quiet_config());
        let cancel = engine.cancel_handle();
        bus.on_write(move |n| {
            if n == 2 {
                cancel.cancel();
            }
        });

        let pcm = bytes(&[7; 40]);
        let outcome = engine.play(&pcm).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Cancelled { bytes: 8 });
        assert!(!outcome.is_completed());
        assert_eq!(bus.writes().len(), 2);
        assert_eq!(arb.current_owner(), BusOwner::Free);
    }

    #[test]
    fn cancel_before_play_does_not_leak_into_next_playback() {
        let (engine, _arb, _bus) = engine(quiet_config());
        engine.cancel();
        assert!(engine.play(&bytes(&[1, 2])).unwrap().is_completed());
    }

    #[test]
    fn gain_applies_to_private_copy() {
        let (engine, _arb, bus) = engine(quiet_config());
        engine.set_gain(2.0);
        let pcm = bytes(&[100, -100, 20000, -20000]);
        let original = pcm.clone();

        engine.play(&pcm).unwrap();
        assert_eq!(pcm, original);
        assert_eq!(bus.written_bytes(), bytes(&[200, -200, i16::MAX, i16::MIN]));
    }

    #[test]
    fn gain_and_volume_are_clamped() {
        let (engine, _arb, _bus) = engine(quiet_config());
        assert_eq!(engine.set_gain(3.5), 2.0);
        assert_eq!(engine.set_gain(-1.0), 0.0);
        assert_eq!(engine.set_volume(0.25), 0.5);
        assert_eq!(engine.set_volume(4.0), 2.0);
        assert_eq!(engine.gain(), 2.0);
    }

    #[test]
    fn stuck_owner_is_force_released_once() {
        let (engine, arb, bus) = engine(quiet_config());
        assert!(arb.request(BusRole::Capture));

        let outcome = engine.play(&bytes(&[1, 2])).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(
            bus.configured_directions(),
            vec![Direction::Input, Direction::Output]
        );
        assert_eq!(arb.current_owner(), BusOwner::Free);
    }

    #[test]
    fn unrecoverable_bus_reports_busy() {
        let (engine, arb, bus) = engine(quiet_config());
        bus.fail_configure(true);
        assert!(matches!(engine.play(&bytes(&[1])), Err(Error::BusBusy(BusOwner::Free))));
        assert_eq!(arb.current_owner(), BusOwner::Free);
        assert!(!engine.is_speaking());
    }

    #[test]
    fn already_held_bus_is_not_released() {
        let (engine, arb, _bus) = engine(quiet_config());
        assert!(arb.request(BusRole::Playback));
        engine.play(&bytes(&[1, 2])).unwrap();
        assert_eq!(arb.current_owner(), BusOwner::Playback);
    }

    #[test]
    fn silence_pad_follows_last_chunk() {
        let config = PlaybackConfig {
            chunk_bytes: 2048,
            silence_pad_ms: 100,
            settle_margin_ms: 0,
            ..PlaybackConfig::default()
        };
        let (engine, _arb, bus) = engine(config);
        engine.play(&bytes(&[5; 100])).unwrap();

        let writes = bus.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], vec![0u8; 3200]);
    }

    #[test]
    fn streamed_source_keeps_sample_alignment() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (engine, _arb, bus) = engine(quiet_config());
        let pcm = bytes(&[1000, -1000, 3000, -3000, 5]);
        engine.set_gain(0.5);

        // odd-sized pieces split samples across stream items
        let source = PlaybackSource::from_chunks(pcm.chunks(3).map(Bytes::copy_from_slice).collect());
        let outcome = engine.play_source(source, rt.handle()).unwrap();

        assert_eq!(outcome, PlaybackOutcome::Completed { bytes: 10 });
        assert_eq!(bus.written_bytes(), bytes(&[500, -500, 1500, -1500, 2]));
        assert!(bus.calls().iter().all(|c| !matches!(c, BusCall::Write(n) if n % 2 == 1)));
    }

    #[test]
    fn gain_change_reaches_playback_in_progress() {
        let (engine, _arb, bus) = engine(quiet_config());
        let gain = engine.gain_control();
        bus.on_write(move |n| {
            if n == 1 {
                gain.set(2.0);
            }
        });

        engine.play(&bytes(&[100; 4])).unwrap();
        assert_eq!(bus.writes(), vec![bytes(&[100, 100]), bytes(&[200, 200])]);
    }

    #[test]
    fn stalled_device_does_not_hold_playback() {
        let (engine, arb, bus) = engine(quiet_config());
        bus.stall_writes(true);

        let started = Instant::now();
        let outcome = engine.play(&bytes(&[9; 8])).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed { bytes: 0 });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(arb.current_owner(), BusOwner::Free);
    }

    #[test]
    fn cancel_interrupts_stalled_stream() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (engine, arb, _bus) = engine(quiet_config());
        let cancel = engine.cancel_handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });

        let source = PlaybackSource::Stream(Box::pin(futures_util::stream::pending::<Result<Bytes>>()));
        let started = Instant::now();
        let outcome = engine.play_source(source, rt.handle()).unwrap();
        canceller.join().unwrap();

        assert_eq!(outcome, PlaybackOutcome::Cancelled { bytes: 0 });
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(arb.current_owner(), BusOwner::Free);
    }

    #[test]
    fn cancel_during_drain_is_reported() {
        let config = PlaybackConfig {
            chunk_bytes: 2048,
            silence_pad_ms: 100,
            settle_margin_ms: 5000,
            ..PlaybackConfig::default()
        };
        let (engine, _arb, bus) = engine(config);
        let cancel = engine.cancel_handle();
        // the second write is the silence pad
        bus.on_write(move |n| {
            if n == 2 {
                cancel.cancel();
            }
        });

        let started = Instant::now();
        let outcome = engine.play(&bytes(&[3; 10])).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Cancelled { bytes: 20 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
