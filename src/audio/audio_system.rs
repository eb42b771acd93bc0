//! The audio worker: owns every bus interaction and runs capture, command
//! recording and playback on a dedicated OS thread.
//!
//! Uses std::thread (NOT a tokio task) so blocking bus I/O never stalls the
//! async side. Remote service calls are spawned onto the tokio runtime through
//! a `Handle`; their results come back over the event queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use super::arbitrator::BusArbitrator;
use super::bus::{AudioBus, BusConfig, BusOwner, BusRole};
use super::capture::{CaptureBuffers, CaptureConfig, CapturePipeline, WakeConfig};
use super::playback::{CancelHandle, GainControl, PlaybackConfig, PlaybackEngine, PlaybackOutcome};
use super::recorder::{RecorderConfig, StopReason};
use crate::audio_bridge::{AudioCommand, AudioEvent, CommandReceiver, EventSender, TranscriptionResult};
use crate::services::{SpeechSynthesizer, Transcriber, WakeWordSearch};
use crate::{Error, Result};

/// Consecutive failed capture acquisitions before the worker reports itself degraded.
const DEGRADED_AFTER: u32 = 5;
/// Acquisition retry period once degraded.
const DEGRADED_RETRY: Duration = Duration::from_secs(1);
/// Pause when capture could not get the bus this iteration.
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Audio system configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    pub bus: BusConfig,
    pub capture: CaptureConfig,
    pub wake: WakeConfig,
    pub recorder: RecorderConfig,
    pub playback: PlaybackConfig,
}

/// Remote collaborators used by the worker.
#[derive(Clone)]
pub struct AudioServices {
    pub search: Arc<dyn WakeWordSearch>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Read-only view of the worker's state for the host.
#[derive(Clone)]
pub struct AudioStatus {
    arbitrator: Arc<BusArbitrator>,
    buffers: Arc<CaptureBuffers>,
    speaking: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
}

impl AudioStatus {
    pub fn is_recording(&self) -> bool {
        self.buffers.is_recording()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// True while capture cannot get the bus.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn bus_owner(&self) -> BusOwner {
        self.arbitrator.current_owner()
    }
}

/// Handles that act on playback immediately, bypassing the command queue.
#[derive(Debug, Clone)]
pub struct PlaybackControls {
    pub gain: GainControl,
    pub cancel: CancelHandle,
}

pub struct AudioWorker {
    arbitrator: Arc<BusArbitrator>,
    capture: CapturePipeline,
    playback: PlaybackEngine,
    services: AudioServices,
    recorder: RecorderConfig,
    commands: CommandReceiver,
    events: EventSender,
    handle: Handle,
    failed_acquires: u32,
    last_acquire: Option<Instant>,
    degraded: Arc<AtomicBool>,
}

impl AudioWorker {
    pub fn new(
        config: AudioConfig,
        bus: Box<dyn AudioBus>,
        services: AudioServices,
        commands: CommandReceiver,
        events: EventSender,
        handle: Handle,
    ) -> Self {
        let byte_rate = config.bus.byte_rate();
        let arbitrator = Arc::new(BusArbitrator::new(bus, config.bus));
        let buffers = Arc::new(CaptureBuffers::new(
            &config.capture,
            config.recorder.clone(),
            byte_rate,
        ));
        let capture = CapturePipeline::new(
            config.capture,
            config.wake,
            buffers,
            services.search.clone(),
        );
        let playback = PlaybackEngine::new(arbitrator.clone(), config.playback);

        Self {
            arbitrator,
            capture,
            playback,
            services,
            recorder: config.recorder,
            commands,
            events,
            handle,
            failed_acquires: 0,
            last_acquire: None,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> AudioStatus {
        AudioStatus {
            arbitrator: self.arbitrator.clone(),
            buffers: self.capture.buffers().clone(),
            speaking: self.playback.speaking_flag(),
            degraded: self.degraded.clone(),
        }
    }

    pub fn playback_controls(&self) -> PlaybackControls {
        PlaybackControls {
            gain: self.playback.gain_control(),
            cancel: self.playback.cancel_handle(),
        }
    }

    /// Run until `running` is cleared, then give the bus back.
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!("Audio worker started");
        while running.load(Ordering::Relaxed) {
            if !self.step() {
                thread::sleep(IDLE_BACKOFF);
            }
        }
        self.arbitrator.force_release();
        log::info!("Audio worker stopped");
    }

    /// One loop iteration. Returns `false` when capture had no bus.
    pub fn step(&mut self) -> bool {
        // 先处理控制命令，避免被连续采集饿死
        while let Some(command) = self.commands.poll() {
            self.handle_command(command);
        }

        if !self.ensure_capture() {
            return false;
        }

        match self.capture.capture_block(&self.arbitrator) {
            Ok(_) => {}
            Err(Error::Timeout(what)) => log::debug!("No {} within read timeout", what),
            Err(e) => log::warn!("Capture read failed: {}", e),
        }

        let now = Instant::now();
        if let Some(pcm) = self.capture.poll_recorder(now) {
            self.spawn_transcription(pcm);
        }
        if let Some(found) = self.capture.poll_wake(now, &self.handle) {
            if let Err(e) = self.events.publish(AudioEvent::WakeWord(found)) {
                log::warn!("Dropped wake word event: {}", e);
            }
        }
        true
    }

    fn handle_command(&mut self, command: AudioCommand) {
        log::debug!("Audio command: {:?}", command);
        match command {
            AudioCommand::SpeakText(text) => self.speak(&text),
            AudioCommand::PlayTone(kind) => {
                self.with_playback(|engine, _| engine.play_tone(kind));
            }
            AudioCommand::StartRecording => {
                self.capture.start_recording(Instant::now());
            }
            AudioCommand::StopRecordingAndProcess => {
                if let Some(pcm) = self.capture.stop_recording(StopReason::Requested) {
                    self.spawn_transcription(pcm);
                }
            }
        }
    }

    fn speak(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let limit = Duration::from_millis(self.playback.config().synthesis_timeout_ms);
        let synthesizer = self.services.synthesizer.clone();
        // timeout 必须在运行时上下文里创建，本线程不是 tokio 线程
        let synthesized = self
            .handle
            .block_on(async { tokio::time::timeout(limit, synthesizer.synthesize(text)).await });
        let source = match synthesized {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => {
                log::warn!("Speech synthesis failed: {}", e);
                return;
            }
            Err(_) => {
                log::warn!("Speech synthesis timed out after {:?}", limit);
                return;
            }
        };
        self.with_playback(move |engine, handle| engine.play_source(source, handle));
    }

    /// The only path that moves the bus between capture and playback:
    /// release capture if held, play, then restore capture.
    fn with_playback<F>(&mut self, play: F)
    where
        F: FnOnce(&PlaybackEngine, &Handle) -> Result<PlaybackOutcome>,
    {
        let had_capture = self.arbitrator.has_access(BusRole::Capture);
        if had_capture {
            self.arbitrator.release(BusRole::Capture);
        }

        match play(&self.playback, &self.handle) {
            Ok(outcome) => log::debug!("Playback finished: {:?}", outcome),
            Err(e) => log::warn!("Playback failed: {}", e),
        }

        if had_capture && !self.arbitrator.request(BusRole::Capture) {
            log::warn!("Could not restore capture after playback");
        }
    }

    fn ensure_capture(&mut self) -> bool {
        if self.arbitrator.has_access(BusRole::Capture) {
            return true;
        }

        let now = Instant::now();
        if self.degraded.load(Ordering::SeqCst) {
            if let Some(last) = self.last_acquire {
                if now.saturating_duration_since(last) < DEGRADED_RETRY {
                    return false;
                }
            }
        }
        self.last_acquire = Some(now);

        if self.arbitrator.request(BusRole::Capture) {
            if self.degraded.swap(false, Ordering::SeqCst) {
                log::info!("Capture recovered after {} failed attempts", self.failed_acquires);
            }
            self.failed_acquires = 0;
            return true;
        }

        self.failed_acquires += 1;
        if self.failed_acquires >= DEGRADED_AFTER && !self.degraded.swap(true, Ordering::SeqCst) {
            log::error!(
                "Capture could not acquire the bus {} times, running degraded",
                self.failed_acquires
            );
        }
        false
    }

    fn spawn_transcription(&self, pcm: Vec<u8>) {
        let transcriber = self.services.transcriber.clone();
        let events = self.events.clone();
        let limit = Duration::from_millis(self.recorder.transcribe_timeout_ms);

        self.handle.spawn(async move {
            let text = match tokio::time::timeout(limit, transcriber.transcribe(pcm)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    log::warn!("Transcription failed: {}", e);
                    return;
                }
                Err(_) => {
                    log::warn!("Transcription timed out after {:?}", limit);
                    return;
                }
            };

            let result = TranscriptionResult::new(text);
            if result.is_empty() {
                log::info!("Transcription returned no speech");
                return;
            }
            log::info!("Transcription: {}", result.text());
            if let Err(e) = events.publish(AudioEvent::Transcription(result)) {
                log::warn!("Dropped transcription result: {}", e);
            }
        });
    }
}

/// Owns the audio worker thread.
pub struct AudioSystem {
    running: Arc<AtomicBool>,
    worker_handle: Option<JoinHandle<()>>,
    status: AudioStatus,
    controls: PlaybackControls,
}

impl AudioSystem {
    /// Start the audio worker.
    ///
    /// * `bus`      - The peripheral, normally [`super::AlsaBus`]
    /// * `commands` - Control -> audio queue
    /// * `events`   - Audio -> control queue
    /// * `handle`   - Runtime that runs remote service calls
    pub fn start(
        config: AudioConfig,
        bus: Box<dyn AudioBus>,
        services: AudioServices,
        commands: CommandReceiver,
        events: EventSender,
        handle: Handle,
    ) -> Result<Self> {
        log::info!(
            "AudioSystem starting: capture \"{}\", playback \"{}\", rate {}Hz, ch {}",
            config.bus.capture_device,
            config.bus.playback_device,
            config.bus.sample_rate,
            config.bus.channels,
        );

        let mut worker = AudioWorker::new(config, bus, services, commands, events, handle);
        let status = worker.status();
        let controls = worker.playback_controls();
        let running = Arc::new(AtomicBool::new(true));

        let worker_handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-worker".into())
                .spawn(move || worker.run(&running))?
        };

        Ok(Self {
            running,
            worker_handle: Some(worker_handle),
            status,
            controls,
        })
    }

    pub fn status(&self) -> AudioStatus {
        self.status.clone()
    }

    pub fn controls(&self) -> PlaybackControls {
        self.controls.clone()
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.worker_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop();
    }
}
