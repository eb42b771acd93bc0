use async_trait::async_trait;

use crate::audio::PlaybackControls;
use crate::audio_bridge::{AudioCommand, AudioEvent, CommandSender, ToneKind};
use crate::control_bridge::HostRequest;

/// Application logic that acts on a transcribed command. An optional reply is
/// spoken back to the user.
#[async_trait]
pub trait CommandDispatcher: Send {
    async fn dispatch(&mut self, command: &str) -> Option<String>;
}

/// Logs commands and never replies.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl CommandDispatcher for LoggingDispatcher {
    async fn dispatch(&mut self, command: &str) -> Option<String> {
        log::info!("Command: {}", command);
        None
    }
}

/// The control worker: turns audio events and host requests into audio
/// commands. Never blocks on the audio worker.
pub struct CoreController {
    commands: CommandSender,
    controls: PlaybackControls,
    dispatcher: Box<dyn CommandDispatcher>,
    confirm_tone: bool,
}

impl CoreController {
    pub fn new(
        commands: CommandSender,
        controls: PlaybackControls,
        dispatcher: Box<dyn CommandDispatcher>,
        confirm_tone: bool,
    ) -> Self {
        Self {
            commands,
            controls,
            dispatcher,
            confirm_tone,
        }
    }

    fn enqueue(&self, command: AudioCommand) {
        if let Err(e) = self.commands.enqueue(command.clone()) {
            log::warn!("Dropped {:?}: {}", command, e);
        }
    }

    pub async fn handle_audio_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::WakeWord(found) => {
                log::info!("Wake word \"{}\" ({:.2})", found.phrase, found.confidence);
                if self.confirm_tone {
                    self.enqueue(AudioCommand::PlayTone(ToneKind::Confirm));
                }
            }
            AudioEvent::Transcription(result) => {
                if result.is_empty() {
                    log::debug!("Empty transcription ignored");
                    return;
                }
                if let Some(reply) = self.dispatcher.dispatch(result.text()).await {
                    if !reply.trim().is_empty() {
                        self.enqueue(AudioCommand::SpeakText(reply));
                    }
                }
            }
        }
    }

    pub fn handle_host_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::Speak(text) => self.enqueue(AudioCommand::SpeakText(text)),
            HostRequest::Tone(kind) => self.enqueue(AudioCommand::PlayTone(kind)),
            HostRequest::Record => self.enqueue(AudioCommand::StartRecording),
            HostRequest::Stop => self.enqueue(AudioCommand::StopRecordingAndProcess),
            // 直接作用于播放句柄，播放过程中也能立即生效
            HostRequest::Cancel => self.controls.cancel.cancel(),
            HostRequest::Volume(v) => {
                let gain = self.controls.gain.set_volume(v);
                log::info!("Volume {:.2} -> gain {:.2}", v, gain);
            }
            HostRequest::Gain(g) => {
                let gain = self.controls.gain.set(g);
                log::info!("Gain set to {:.2}", gain);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CancelHandle, GainControl};
    use crate::audio_bridge::{COMMAND_QUEUE_CAPACITY, CommandReceiver, TranscriptionResult, command_channel};
    use crate::services::WakeMatch;

    struct Echo;

    #[async_trait]
    impl CommandDispatcher for Echo {
        async fn dispatch(&mut self, command: &str) -> Option<String> {
            Some(format!("you said {}", command))
        }
    }

    fn controller(dispatcher: Box<dyn CommandDispatcher>) -> (CoreController, CommandReceiver, PlaybackControls) {
        let (tx, rx) = command_channel();
        let controls = PlaybackControls {
            gain: GainControl::new(1.0),
            cancel: CancelHandle::default(),
        };
        (CoreController::new(tx, controls.clone(), dispatcher, true), rx, controls)
    }

    fn wake() -> AudioEvent {
        AudioEvent::WakeWord(WakeMatch {
            phrase: "halo".into(),
            confidence: 0.75,
            threshold: 0.6,
        })
    }

    #[tokio::test]
    async fn wake_word_queues_confirmation_tone() {
        let (mut c, mut rx, _) = controller(Box::new(LoggingDispatcher));
        c.handle_audio_event(wake()).await;
        assert_eq!(rx.poll(), Some(AudioCommand::PlayTone(ToneKind::Confirm)));
    }

    #[tokio::test]
    async fn confirmation_tone_can_be_disabled() {
        let (mut c, mut rx, _) = controller(Box::new(LoggingDispatcher));
        c.confirm_tone = false;
        c.handle_audio_event(wake()).await;
        assert_eq!(rx.poll(), None);
    }

    #[tokio::test]
    async fn dispatcher_reply_is_spoken() {
        let (mut c, mut rx, _) = controller(Box::new(Echo));
        c.handle_audio_event(AudioEvent::Transcription(TranscriptionResult::new("what time is it")))
            .await;
        assert_eq!(
            rx.poll(),
            Some(AudioCommand::SpeakText("you said what time is it".into()))
        );
    }

    #[tokio::test]
    async fn empty_transcription_is_ignored() {
        let (mut c, mut rx, _) = controller(Box::new(Echo));
        c.handle_audio_event(AudioEvent::Transcription(TranscriptionResult::new("  ")))
            .await;
        assert_eq!(rx.poll(), None);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (mut c, mut rx, _) = controller(Box::new(LoggingDispatcher));
        for _ in 0..COMMAND_QUEUE_CAPACITY + 2 {
            c.handle_audio_event(wake()).await;
        }
        let mut drained = 0;
        while rx.poll().is_some() {
            drained += 1;
        }
        assert_eq!(drained, COMMAND_QUEUE_CAPACITY);
    }

    #[test]
    fn host_requests_map_to_commands_and_controls() {
        let (mut c, mut rx, controls) = controller(Box::new(LoggingDispatcher));

        c.handle_host_request(HostRequest::Speak("hi".into()));
        c.handle_host_request(HostRequest::Record);
        c.handle_host_request(HostRequest::Stop);
        assert_eq!(rx.poll(), Some(AudioCommand::SpeakText("hi".into())));
        assert_eq!(rx.poll(), Some(AudioCommand::StartRecording));
        assert_eq!(rx.poll(), Some(AudioCommand::StopRecordingAndProcess));

        c.handle_host_request(HostRequest::Volume(0.25));
        assert_eq!(controls.gain.get(), 0.5);
        c.handle_host_request(HostRequest::Gain(5.0));
        assert_eq!(controls.gain.get(), 2.0);

        c.handle_host_request(HostRequest::Cancel);
        assert!(controls.cancel.is_cancelled());
        assert_eq!(rx.poll(), None);
    }
}
