//! Per-block capture processing and wake-word search scheduling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use super::arbitrator::{BusArbitrator, lock};
use super::bus::BusRole;
use super::pcm::SampleConverter;
use super::recorder::{CommandRecorder, RecorderConfig, StopReason};
use super::ring_buffer::{CaptureRing, Snapshot};
use crate::Result;
use crate::services::{WakeMatch, WakePhrase, WakeWordSearch, accept_hit};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Raw samples per bus read
    pub block_samples: usize,
    /// Right shift from the capture container down to 16 bits
    pub sample_shift: u32,
    pub digital_gain: f32,
    /// Seconds of audio kept for wake search
    pub ring_seconds: u32,
    /// The ring sequence advances once per this many bytes
    pub sequence_quantum_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            block_samples: 1024,
            sample_shift: 14,
            digital_gain: 1.0,
            ring_seconds: 3,
            sequence_quantum_bytes: 16000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    pub phrases: Vec<WakePhrase>,
    /// Minimum gap between two searches
    pub search_interval_ms: u64,
    pub min_search_bytes: usize,
    pub search_timeout_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrases: vec![WakePhrase {
                phrase: "halo".to_string(),
                threshold: 0.6,
            }],
            search_interval_ms: 1500,
            min_search_bytes: 16000,
            search_timeout_ms: 10000,
        }
    }
}

/// Capture-side buffers, each behind its own lock. Locks are only held for
/// copies and index updates, never across bus calls.
#[derive(Debug)]
pub struct CaptureBuffers {
    pub ring: Mutex<CaptureRing>,
    pub recorder: Mutex<CommandRecorder>,
}

impl CaptureBuffers {
    pub fn new(capture: &CaptureConfig, recorder: RecorderConfig, byte_rate: u32) -> Self {
        let capacity = capture.ring_seconds as usize * byte_rate as usize;
        Self {
            ring: Mutex::new(CaptureRing::new(capacity, capture.sequence_quantum_bytes)),
            recorder: Mutex::new(CommandRecorder::new(recorder, byte_rate)),
        }
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.recorder).is_recording()
    }
}

pub struct CapturePipeline {
    wake: WakeConfig,
    converter: SampleConverter,
    buffers: Arc<CaptureBuffers>,
    search: Arc<dyn WakeWordSearch>,
    raw: Vec<i32>,
    block: Vec<u8>,
    pending: Option<oneshot::Receiver<Option<WakeMatch>>>,
    last_search: Option<Instant>,
}

impl CapturePipeline {
    pub fn new(
        config: CaptureConfig,
        wake: WakeConfig,
        buffers: Arc<CaptureBuffers>,
        search: Arc<dyn WakeWordSearch>,
    ) -> Self {
        let converter = SampleConverter {
            shift: config.sample_shift,
            gain: config.digital_gain,
        };
        Self {
            raw: vec![0; config.block_samples.max(1)],
            block: Vec::with_capacity(config.block_samples * 2),
            wake,
            converter,
            buffers,
            search,
            pending: None,
            last_search: None,
        }
    }

    pub fn buffers(&self) -> &Arc<CaptureBuffers> {
        &self.buffers
    }

    pub fn is_searching(&self) -> bool {
        self.pending.is_some()
    }

    /// Read one block from the bus and feed it through. Returns bytes added.
    pub fn capture_block(&mut self, arbitrator: &BusArbitrator) -> Result<usize> {
        let timeout = arbitrator.config().read_timeout();
        let n = arbitrator.read(BusRole::Capture, &mut self.raw, timeout)?;
        let raw = std::mem::take(&mut self.raw);
        let added = self.ingest(&raw[..n]);
        self.raw = raw;
        Ok(added)
    }

    /// Convert raw samples and append them to the ring and, when recording,
    /// to the command buffer.
    pub fn ingest(&mut self, raw: &[i32]) -> usize {
        self.block.clear();
        self.converter.convert_block(raw, &mut self.block);

        lock(&self.buffers.ring).append(&self.block);
        lock(&self.buffers.recorder).append(&self.block);
        self.block.len()
    }

    pub fn start_recording(&mut self, now: Instant) -> bool {
        // 录音期间不做唤醒检测，丢掉正在进行的搜索
        self.pending = None;
        lock(&self.buffers.ring).clear();
        lock(&self.buffers.recorder).start(now)
    }

    pub fn stop_recording(&mut self, reason: StopReason) -> Option<Vec<u8>> {
        let (was_recording, pcm) = {
            let mut recorder = lock(&self.buffers.recorder);
            (recorder.is_recording(), recorder.finish(reason))
        };
        if was_recording {
            self.discard_command_audio();
        }
        pcm
    }

    /// Returns the finished command audio once a stop condition fires.
    pub fn poll_recorder(&mut self, now: Instant) -> Option<Vec<u8>> {
        let pcm = {
            let mut recorder = lock(&self.buffers.recorder);
            let reason = recorder.poll(now)?;
            recorder.finish(reason)
        };
        self.discard_command_audio();
        pcm
    }

    // 命令音频也进了环形缓冲，不清掉的话下一次唤醒检测会搜到命令本身
    fn discard_command_audio(&mut self) {
        lock(&self.buffers.ring).clear();
    }

    /// Collect a finished search or start a new one. An accepted match starts
    /// recording and is returned.
    pub fn poll_wake(&mut self, now: Instant, handle: &Handle) -> Option<WakeMatch> {
        if self.buffers.is_recording() {
            self.pending = None;
            return None;
        }

        if let Some(rx) = self.pending.as_mut() {
            match rx.try_recv() {
                Ok(Some(found)) => {
                    self.pending = None;
                    log::info!(
                        "Wake word \"{}\" detected (confidence {:.2} >= {:.2})",
                        found.phrase,
                        found.confidence,
                        found.threshold
                    );
                    if !self.start_recording(now) {
                        return None;
                    }
                    return Some(found);
                }
                Ok(None) | Err(TryRecvError::Closed) => self.pending = None,
                Err(TryRecvError::Empty) => return None,
            }
        }

        let interval = Duration::from_millis(self.wake.search_interval_ms);
        if let Some(last) = self.last_search {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }

        let snapshot = lock(&self.buffers.ring).snapshot(self.wake.min_search_bytes);
        let pcm = match snapshot {
            Snapshot::Audio { pcm, sequence } => {
                log::debug!("Searching {} bytes of audio (sequence {})", pcm.len(), sequence);
                pcm
            }
            Snapshot::TooShort { available } => {
                log::debug!(
                    "Only {} of {} bytes buffered, skipping wake search",
                    available,
                    self.wake.min_search_bytes
                );
                return None;
            }
            Snapshot::Unchanged => return None,
        };

        self.last_search = Some(now);
        self.pending = Some(self.spawn_search(pcm, handle));
        None
    }

    fn spawn_search(&self, pcm: Vec<u8>, handle: &Handle) -> oneshot::Receiver<Option<WakeMatch>> {
        let (tx, rx) = oneshot::channel();
        let search = self.search.clone();
        let phrases = self.wake.phrases.clone();
        let limit = Duration::from_millis(self.wake.search_timeout_ms);

        handle.spawn(async move {
            let found = match tokio::time::timeout(limit, search.search(pcm, &phrases)).await {
                Ok(Ok(hits)) => accept_hit(&hits, &phrases),
                Ok(Err(e)) => {
                    log::warn!("Wake word search failed: {}", e);
                    None
                }
                Err(_) => {
                    log::warn!("Wake word search timed out after {:?}", limit);
                    None
                }
            };
            // The receiver is gone if recording started meanwhile.
            let _ = tx.send(found);
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::MockSearch;

    const BYTE_RATE: u32 = 32000;

    fn pipeline(search: Arc<MockSearch>) -> CapturePipeline {
        let capture = CaptureConfig::default();
        let buffers = Arc::new(CaptureBuffers::new(&capture, RecorderConfig::default(), BYTE_RATE));
        let wake = WakeConfig {
            search_interval_ms: 0,
            ..WakeConfig::default()
        };
        CapturePipeline::new(capture, wake, buffers, search)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    /// Raw 32-bit container samples that convert to `value`.
    fn raw(value: i16, samples: usize) -> Vec<i32> {
        vec![(value as i32) << 14; samples]
    }

    fn wait_for_match(p: &mut CapturePipeline, handle: &Handle) -> Option<WakeMatch> {
        for _ in 0..200 {
            if let Some(m) = p.poll_wake(Instant::now(), handle) {
                return Some(m);
            }
            if !p.is_searching() {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn ingest_feeds_ring_and_active_recorder() {
        let mut p = pipeline(Arc::new(MockSearch::default()));
        assert_eq!(p.ingest(&raw(100, 500)), 1000);
        assert_eq!(lock(&p.buffers().ring).len(), 1000);
        assert_eq!(lock(&p.buffers().recorder).cursor(), 0);

        assert!(p.start_recording(Instant::now()));
        p.ingest(&raw(100, 500));
        assert_eq!(lock(&p.buffers().recorder).cursor(), 1000);
    }

    #[test]
    fn short_capture_makes_no_search_call() {
        let rt = runtime();
        let search = Arc::new(MockSearch::with_hit("halo", 0.9));
        let mut p = pipeline(search.clone());

        p.ingest(&raw(100, 4000));
        assert_eq!(p.poll_wake(Instant::now(), rt.handle()), None);
        assert!(!p.is_searching());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(search.calls(), 0);
    }

    #[test]
    fn accepted_match_starts_recording() {
        let rt = runtime();
        let search = Arc::new(MockSearch::with_hit("halo", 0.75));
        let mut p = pipeline(search.clone());

        p.ingest(&raw(100, 8000));
        let found = wait_for_match(&mut p, rt.handle());

        assert_eq!(found.map(|m| m.confidence), Some(0.75));
        assert_eq!(search.calls(), 1);
        let recorder = lock(&p.buffers().recorder);
        assert!(recorder.is_recording());
        assert!(!recorder.baseline_ready());
        assert_eq!(recorder.cursor(), 0);
        drop(recorder);
        assert!(lock(&p.buffers().ring).is_empty());
    }

    #[test]
    fn below_threshold_is_ignored() {
        let rt = runtime();
        let search = Arc::new(MockSearch::with_hit("halo", 0.4));
        let mut p = pipeline(search.clone());

        p.ingest(&raw(100, 8000));
        assert_eq!(wait_for_match(&mut p, rt.handle()), None);
        assert_eq!(search.calls(), 1);
        assert!(!p.buffers().is_recording());
    }

    #[test]
    fn no_search_while_recording() {
        let rt = runtime();
        let search = Arc::new(MockSearch::with_hit("halo", 0.9));
        let mut p = pipeline(search.clone());
        assert!(p.start_recording(Instant::now()));

        p.ingest(&raw(100, 16000));
        assert_eq!(p.poll_wake(Instant::now(), rt.handle()), None);
        assert!(!p.is_searching());
        assert_eq!(search.calls(), 0);
    }

    #[test]
    fn finished_command_is_not_searched_for_wake_word() {
        let rt = runtime();
        let search = Arc::new(MockSearch::with_hit("halo", 0.9));
        let mut p = pipeline(search.clone());
        assert!(p.start_recording(Instant::now()));

        p.ingest(&raw(100, 16000));
        assert!(p.stop_recording(StopReason::Requested).is_some());
        assert!(lock(&p.buffers().ring).is_empty());

        assert_eq!(p.poll_wake(Instant::now(), rt.handle()), None);
        assert!(!p.is_searching());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(search.calls(), 0);
    }

    #[test]
    fn stop_without_recording_keeps_wake_audio() {
        let mut p = pipeline(Arc::new(MockSearch::default()));
        p.ingest(&raw(100, 500));
        assert_eq!(p.stop_recording(StopReason::Requested), None);
        assert_eq!(lock(&p.buffers().ring).len(), 1000);
    }

    #[test]
    fn unchanged_audio_is_searched_once() {
        let rt = runtime();
        let search = Arc::new(MockSearch::default());
        let mut p = pipeline(search.clone());

        p.ingest(&raw(100, 8000));
        assert_eq!(wait_for_match(&mut p, rt.handle()), None);
        assert_eq!(p.poll_wake(Instant::now(), rt.handle()), None);
        assert!(!p.is_searching());
        assert_eq!(search.calls(), 1);
    }

    #[test]
    fn search_interval_is_respected() {
        let rt = runtime();
        let search = Arc::new(MockSearch::default());
        let capture = CaptureConfig::default();
        let buffers = Arc::new(CaptureBuffers::new(&capture, RecorderConfig::default(), BYTE_RATE));
        let mut p = CapturePipeline::new(capture, WakeConfig::default(), buffers, search.clone());

        let t0 = Instant::now();
        p.ingest(&raw(100, 8000));
        assert_eq!(p.poll_wake(t0, rt.handle()), None);
        while p.is_searching() {
            std::thread::sleep(Duration::from_millis(5));
            p.poll_wake(t0, rt.handle());
        }

        p.ingest(&raw(100, 8000));
        p.poll_wake(t0 + Duration::from_millis(100), rt.handle());
        assert!(!p.is_searching());
        p.poll_wake(t0 + Duration::from_millis(1500), rt.handle());
        assert!(p.is_searching());
    }
}
