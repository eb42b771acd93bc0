//! Scripted bus and service doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::arbitrator::lock;
use super::bus::{AudioBus, Direction, PeripheralSettings};
use super::playback::PlaybackSource;
use crate::services::{PhraseHit, SpeechSynthesizer, Transcriber, WakePhrase, WakeWordSearch};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Configure(Direction),
    Shutdown,
    Read(usize),
    Write(usize),
}

type WriteHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct MockState {
    calls: Vec<BusCall>,
    configured: Option<Direction>,
    fail_configure: bool,
    stall_writes: bool,
    reads: VecDeque<Vec<i32>>,
    writes: Vec<Vec<u8>>,
    on_write: Option<WriteHook>,
}

/// In-memory bus. Clones share state so a test can keep a handle after
/// boxing one into the arbitrator.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<BusCall> {
        lock(&self.state).calls.clone()
    }

    pub fn configured_directions(&self) -> Vec<Direction> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|c| match c {
                BusCall::Configure(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    pub fn fail_configure(&self, fail: bool) {
        lock(&self.state).fail_configure = fail;
    }

    /// Make every write time out as a wedged output device would.
    pub fn stall_writes(&self, stall: bool) {
        lock(&self.state).stall_writes = stall;
    }

    /// Queue raw samples for the next read. Reads with nothing queued time out.
    pub fn push_read(&self, samples: Vec<i32>) {
        lock(&self.state).reads.push_back(samples);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.state).writes.concat()
    }

    /// Called with the 1-based write count after every write.
    pub fn on_write(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        lock(&self.state).on_write = Some(Arc::new(hook));
    }
}

impl AudioBus for MockBus {
    fn configure(&mut self, settings: &PeripheralSettings) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(BusCall::Configure(settings.direction));
        if state.fail_configure {
            return Err(Error::Peripheral("mock configure failure".into()));
        }
        state.configured = Some(settings.direction);
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(BusCall::Shutdown);
        state.configured = None;
    }

    fn read(&mut self, buf: &mut [i32], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        if state.configured != Some(Direction::Input) {
            return Err(Error::Peripheral("capture device not configured".into()));
        }
        let Some(samples) = state.reads.pop_front() else {
            return Err(Error::Timeout("capture samples"));
        };
        let n = samples.len().min(buf.len());
        buf[..n].copy_from_slice(&samples[..n]);
        state.calls.push(BusCall::Read(n));
        Ok(n)
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        let (count, hook) = {
            let mut state = lock(&self.state);
            if state.configured != Some(Direction::Output) {
                return Err(Error::Peripheral("playback device not configured".into()));
            }
            if state.stall_writes {
                return Err(Error::Timeout("playback space"));
            }
            state.calls.push(BusCall::Write(data.len()));
            state.writes.push(data.to_vec());
            (state.writes.len(), state.on_write.clone())
        };
        if let Some(hook) = hook {
            hook(count);
        }
        Ok(data.len())
    }
}

/// Search double returning fixed hits.
#[derive(Default)]
pub struct MockSearch {
    hits: Mutex<Vec<PhraseHit>>,
    calls: AtomicUsize,
}

impl MockSearch {
    pub fn with_hit(phrase: &str, confidence: f32) -> Self {
        Self {
            hits: Mutex::new(vec![PhraseHit {
                phrase: phrase.into(),
                confidence,
            }]),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeWordSearch for MockSearch {
    async fn search(&self, _pcm: Vec<u8>, _phrases: &[WakePhrase]) -> Result<Vec<PhraseHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.hits).clone())
    }
}

/// Transcriber double returning a fixed text and remembering input sizes.
#[derive(Default)]
pub struct MockTranscriber {
    text: String,
    received: Mutex<Vec<usize>>,
}

impl MockTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.into(),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<usize> {
        lock(&self.received).clone()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, pcm: Vec<u8>) -> Result<String> {
        lock(&self.received).push(pcm.len());
        Ok(self.text.clone())
    }
}

/// Synthesizer double. Streams `pcm` in `chunk` sized pieces when `chunk` is set.
pub struct MockSynth {
    pcm: Vec<u8>,
    chunk: Option<usize>,
    requests: Mutex<Vec<String>>,
}

impl MockSynth {
    pub fn buffered(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            chunk: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn streamed(pcm: Vec<u8>, chunk: usize) -> Self {
        Self {
            pcm,
            chunk: Some(chunk),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynth {
    async fn synthesize(&self, text: &str) -> Result<PlaybackSource> {
        lock(&self.requests).push(text.to_string());
        Ok(match self.chunk {
            None => PlaybackSource::Buffer(Bytes::from(self.pcm.clone())),
            Some(size) => PlaybackSource::from_chunks(
                self.pcm
                    .chunks(size.max(1))
                    .map(Bytes::copy_from_slice)
                    .collect(),
            ),
        })
    }
}
