//! Bounded, non-blocking queues between the control worker and the audio
//! worker. A full queue drops the message and reports it to the sender.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::services::WakeMatch;
use crate::{Error, Result};

pub const COMMAND_QUEUE_CAPACITY: usize = 5;
pub const EVENT_QUEUE_CAPACITY: usize = 5;

/// Transcripts longer than this are cut at a char boundary.
pub const MAX_TRANSCRIPTION_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneKind {
    Confirm,
    Acknowledge,
    Error,
}

impl ToneKind {
    pub fn frequency_hz(self) -> f32 {
        match self {
            ToneKind::Confirm => 880.0,
            ToneKind::Acknowledge => 660.0,
            ToneKind::Error => 330.0,
        }
    }

    pub fn duration_ms(self) -> u32 {
        match self {
            ToneKind::Confirm => 120,
            ToneKind::Acknowledge => 80,
            ToneKind::Error => 250,
        }
    }
}

/// Control -> audio.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioCommand {
    SpeakText(String),
    PlayTone(ToneKind),
    StartRecording,
    StopRecordingAndProcess,
}

/// A transcribed command. Empty means "nothing actionable".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranscriptionResult {
    text: String,
}

impl TranscriptionResult {
    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into().trim().to_string();
        if text.len() > MAX_TRANSCRIPTION_BYTES {
            let mut end = MAX_TRANSCRIPTION_BYTES;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        Self { text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Audio -> control.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    WakeWord(WakeMatch),
    Transcription(TranscriptionResult),
}

fn try_send<T>(tx: &mpsc::Sender<T>, item: T) -> Result<()> {
    tx.try_send(item).map_err(|e| match e {
        TrySendError::Full(_) => Error::QueueFull,
        TrySendError::Closed(_) => Error::QueueClosed,
    })
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<AudioCommand>,
}

impl CommandSender {
    /// Queue a command without waiting. Fails with `QueueFull` when the audio
    /// worker is behind; the command is dropped.
    pub fn enqueue(&self, command: AudioCommand) -> Result<()> {
        try_send(&self.tx, command)
    }

    /// Commands waiting to be drained.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<AudioCommand>,
}

impl CommandReceiver {
    /// Zero-wait poll.
    pub fn poll(&mut self) -> Option<AudioCommand> {
        match self.rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<AudioEvent>,
}

impl EventSender {
    pub fn publish(&self, event: AudioEvent) -> Result<()> {
        try_send(&self.tx, event)
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<AudioEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<AudioEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AudioEvent> {
        self.rx.try_recv().ok()
    }
}

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    (CommandSender { tx }, CommandReceiver { rx })
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}
