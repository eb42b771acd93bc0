//! Command recording after a wake word or manual trigger.
//!
//! `Idle -> Recording -> Idle`. While recording, a baseline RMS is taken once
//! after warm-up; after the minimum recording time the trailing window is
//! compared against `baseline * factor + offset` every check interval, and
//! recording ends after enough consecutive quiet checks or the hard maximum.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::pcm;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Hard upper bound on a single command, also sizes the buffer
    pub max_seconds: u32,
    /// Delay before the baseline is measured
    pub warmup_ms: u64,
    /// No silence checks before this much audio
    pub min_recording_ms: u64,
    pub check_interval_ms: u64,
    /// Trailing window measured on each check
    pub silence_window_ms: u64,
    /// Leading window used for the baseline
    pub baseline_window_ms: u64,
    /// K in `baseline * K + C`
    pub silence_factor: f32,
    /// C in `baseline * K + C`
    pub silence_offset: f32,
    pub required_silent_checks: u32,
    /// Shorter recordings are treated as false triggers
    pub min_command_ms: u64,
    pub transcribe_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_seconds: 15,
            warmup_ms: 500,
            min_recording_ms: 3000,
            check_interval_ms: 200,
            silence_window_ms: 1000,
            baseline_window_ms: 500,
            silence_factor: 1.2,
            silence_offset: 50.0,
            required_silent_checks: 3,
            min_command_ms: 500,
            transcribe_timeout_ms: 15000,
        }
    }
}

/// Byte count of `ms` of 16-bit audio, rounded down to a whole sample.
pub(crate) fn ms_to_bytes(ms: u64, byte_rate: u32) -> usize {
    ((ms * byte_rate as u64 / 1000) as usize) & !1
}

/// Hysteresis over successive RMS measurements.
#[derive(Debug, Clone)]
pub struct SilenceGate {
    factor: f32,
    offset: f32,
    required: u32,
    baseline: Option<f32>,
    consecutive: u32,
}

impl SilenceGate {
    pub fn new(factor: f32, offset: f32, required: u32) -> Self {
        Self {
            factor,
            offset,
            required: required.max(1),
            baseline: None,
            consecutive: 0,
        }
    }

    pub fn set_baseline(&mut self, rms: f32) {
        self.baseline = Some(rms);
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }

    pub fn threshold(&self) -> Option<f32> {
        self.baseline.map(|b| b * self.factor + self.offset)
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Feed one measurement. Returns `true` when the required number of
    /// consecutive quiet measurements has been reached.
    pub fn observe(&mut self, rms: f32) -> bool {
        let Some(threshold) = self.threshold() else {
            return false;
        };
        if rms < threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.consecutive >= self.required
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.consecutive = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Silence,
    Timeout,
    /// `StopRecordingAndProcess` from the host
    Requested,
}

#[derive(Debug)]
pub struct CommandRecorder {
    config: RecorderConfig,
    byte_rate: u32,
    limit: usize,
    buf: Vec<u8>,
    state: RecorderState,
    started: Option<Instant>,
    last_check: Option<Instant>,
    gate: SilenceGate,
}

impl CommandRecorder {
    pub fn new(config: RecorderConfig, byte_rate: u32) -> Self {
        let limit = config.max_seconds as usize * byte_rate as usize;
        let gate = SilenceGate::new(
            config.silence_factor,
            config.silence_offset,
            config.required_silent_checks,
        );
        Self {
            config,
            byte_rate,
            limit,
            buf: Vec::new(),
            state: RecorderState::Idle,
            started: None,
            last_check: None,
            gate,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn cursor(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    pub fn baseline_ready(&self) -> bool {
        self.gate.baseline().is_some()
    }

    pub fn baseline_rms(&self) -> Option<f32> {
        self.gate.baseline()
    }

    pub fn consecutive_silent_checks(&self) -> u32 {
        self.gate.consecutive()
    }

    /// Enter `Recording`, discarding anything previously held. Returns
    /// `false` if the buffer could not be allocated.
    pub fn start(&mut self, now: Instant) -> bool {
        self.buf.clear();
        if let Err(e) = self.buf.try_reserve_exact(self.limit) {
            log::error!("Failed to allocate {} byte recording buffer: {}", self.limit, e);
            self.state = RecorderState::Idle;
            return false;
        }
        if self.state == RecorderState::Recording {
            log::info!("Recording restarted");
        }
        self.gate.reset();
        self.started = Some(now);
        self.last_check = None;
        self.state = RecorderState::Recording;
        log::info!(
            "Recording started (max {}s, {} bytes)",
            self.config.max_seconds,
            self.limit
        );
        true
    }

    /// Append captured PCM. Bytes beyond capacity are dropped.
    pub fn append(&mut self, data: &[u8]) {
        if self.state != RecorderState::Recording {
            return;
        }
        let room = self.limit.saturating_sub(self.buf.len());
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
    }

    /// Evaluate stop conditions at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<StopReason> {
        if self.state != RecorderState::Recording {
            return None;
        }
        let started = self.started?;
        let elapsed = now.saturating_duration_since(started);

        if elapsed >= Duration::from_secs(self.config.max_seconds as u64) {
            log::info!("Recording reached {}s limit", self.config.max_seconds);
            return Some(StopReason::Timeout);
        }

        if !self.baseline_ready() && elapsed >= Duration::from_millis(self.config.warmup_ms) {
            let window = ms_to_bytes(self.config.baseline_window_ms, self.byte_rate);
            let head = &self.buf[..window.min(self.buf.len())];
            if !head.is_empty() {
                let baseline = pcm::rms(head);
                self.gate.set_baseline(baseline);
                log::info!(
                    "Baseline RMS {:.1}, silence threshold {:.1}",
                    baseline,
                    self.gate.threshold().unwrap_or_default()
                );
            }
        }

        if !self.baseline_ready() || elapsed < Duration::from_millis(self.config.min_recording_ms) {
            return None;
        }

        let interval = Duration::from_millis(self.config.check_interval_ms);
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        self.last_check = Some(now);

        let window = ms_to_bytes(self.config.silence_window_ms, self.byte_rate);
        let tail = &self.buf[self.buf.len().saturating_sub(window)..];
        let current = pcm::rms(tail);
        let stop = self.gate.observe(current);
        log::debug!(
            "Silence check: rms {:.1}, quiet checks {}/{}",
            current,
            self.gate.consecutive(),
            self.config.required_silent_checks
        );

        if stop {
            log::info!("Silence detected after {} ms", elapsed.as_millis());
            Some(StopReason::Silence)
        } else {
            None
        }
    }

    /// Leave `Recording` and hand out the captured command, or `None` if it is
    /// too short to be a real utterance.
    pub fn finish(&mut self, reason: StopReason) -> Option<Vec<u8>> {
        if self.state != RecorderState::Recording {
            return None;
        }
        self.state = RecorderState::Idle;
        self.started = None;
        self.last_check = None;

        let len = self.buf.len();
        let min = ms_to_bytes(self.config.min_command_ms, self.byte_rate);
        let duration_ms = len as u64 * 1000 / self.byte_rate.max(1) as u64;

        if len < min {
            log::info!(
                "Recording stopped ({:?}) after {} ms, too short, discarded",
                reason,
                duration_ms
            );
            self.buf.clear();
            return None;
        }

        let (silent, clipped) = pcm::quality(&self.buf);
        log::info!(
            "Recording stopped ({:?}): {} bytes, {} ms, {:.1}% near-silent, {:.1}% clipped",
            reason,
            len,
            duration_ms,
            silent,
            clipped
        );

        let out = self.buf.clone();
        self.buf.clear();
        Some(out)
    }
}
