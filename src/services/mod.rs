//! Remote service contracts consumed by the audio worker.
//!
//! Implementations must be `Send + Sync` so they can be shared as
//! `Arc<dyn ...>` and called from spawned tasks.

pub mod deepgram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::audio::PlaybackSource;

pub use deepgram::DeepgramClient;

/// A trigger phrase and the confidence a hit needs to be accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakePhrase {
    pub phrase: String,
    pub threshold: f32,
}

/// One phrase hit reported by the search service.
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseHit {
    pub phrase: String,
    pub confidence: f32,
}

/// An accepted wake-word detection.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeMatch {
    pub phrase: String,
    pub confidence: f32,
    pub threshold: f32,
}

/// Pick the strongest hit whose confidence reaches its phrase's threshold.
/// Phrase comparison is case-insensitive; hits for unknown phrases are ignored.
pub fn accept_hit(hits: &[PhraseHit], phrases: &[WakePhrase]) -> Option<WakeMatch> {
    hits.iter()
        .filter_map(|hit| {
            let target = phrases
                .iter()
                .find(|p| p.phrase.eq_ignore_ascii_case(hit.phrase.trim()))?;
            (hit.confidence >= target.threshold).then(|| WakeMatch {
                phrase: target.phrase.clone(),
                confidence: hit.confidence,
                threshold: target.threshold,
            })
        })
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Acoustic search for a fixed list of phrases in a PCM buffer.
#[async_trait]
pub trait WakeWordSearch: Send + Sync {
    /// `pcm` is 16-bit little-endian mono at the bus rate.
    async fn search(&self, pcm: Vec<u8>, phrases: &[WakePhrase]) -> Result<Vec<PhraseHit>>;
}

/// Free-form speech to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns the best transcript, empty when nothing was recognised.
    async fn transcribe(&self, pcm: Vec<u8>) -> Result<String>;
}

/// Text to 16-bit PCM at the bus rate, either buffered or streamed.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<PlaybackSource>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrases() -> Vec<WakePhrase> {
        vec![
            WakePhrase { phrase: "halo".into(), threshold: 0.6 },
            WakePhrase { phrase: "hey halo".into(), threshold: 0.8 },
        ]
    }

    fn hit(phrase: &str, confidence: f32) -> PhraseHit {
        PhraseHit { phrase: phrase.into(), confidence }
    }

    #[test]
    fn accepts_hit_above_threshold() {
        let m = accept_hit(&[hit("halo", 0.75)], &phrases());
        assert_eq!(
            m,
            Some(WakeMatch { phrase: "halo".into(), confidence: 0.75, threshold: 0.6 })
        );
    }

    #[test]
    fn exact_threshold_is_accepted_and_below_is_rejected() {
        assert!(accept_hit(&[hit("halo", 0.6)], &phrases()).is_some());
        assert!(accept_hit(&[hit("halo", 0.59)], &phrases()).is_none());
    }

    #[test]
    fn thresholds_are_per_phrase() {
        assert!(accept_hit(&[hit("hey halo", 0.7)], &phrases()).is_none());
        assert!(accept_hit(&[hit("HEY HALO", 0.85)], &phrases()).is_some());
    }

    #[test]
    fn strongest_accepted_hit_wins() {
        let hits = [hit("halo", 0.65), hit("hey halo", 0.9), hit("other", 0.99)];
        let m = accept_hit(&hits, &phrases());
        assert_eq!(m.map(|m| m.phrase), Some("hey halo".to_string()));
    }
}
