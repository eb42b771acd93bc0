//! HTTP client for the hosted speech service: phrase search, transcription
//! and streamed synthesis.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{PhraseHit, SpeechSynthesizer, Transcriber, WakePhrase, WakeWordSearch};
use crate::audio::PlaybackSource;
use crate::audio::pcm;
use crate::protocol::{ListenResponse, SpeakRequest};
use crate::{Error, Result};

/// Uploads shorter than this are not worth a round trip.
pub const MIN_UPLOAD_BYTES: usize = 1000;

const LISTEN_MODEL: &str = "nova-2";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: String,
    /// BCP-47 tag, e.g. "en-US"
    pub language: String,
    pub request_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepgram.com".to_string(),
            api_key: String::new(),
            language: "en-US".to_string(),
            request_timeout_ms: 10000,
        }
    }
}

pub struct DeepgramClient {
    client: Client,
    config: ServiceConfig,
    sample_rate: u32,
}

impl DeepgramClient {
    pub fn new(config: ServiceConfig, sample_rate: u32) -> Result<Self> {
        if config.api_key.is_empty() {
            log::warn!("Speech service API key is empty, requests will be rejected");
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            sample_rate,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|e| Error::Service(format!("invalid service URL {}: {}", raw, e)))
    }

    fn add_language(&self, url: &mut Url) {
        let language = self.config.language.trim();
        if !language.is_empty() && language != "en-US" {
            url.query_pairs_mut().append_pair("language", language);
        }
    }

    pub fn search_url(&self, phrases: &[WakePhrase]) -> Result<Url> {
        let mut url = self.endpoint("v1/listen")?;
        url.query_pairs_mut().append_pair("model", LISTEN_MODEL);
        for p in phrases {
            url.query_pairs_mut().append_pair("search", &p.phrase);
        }
        self.add_language(&mut url);
        Ok(url)
    }

    pub fn transcribe_url(&self) -> Result<Url> {
        let mut url = self.endpoint("v1/listen")?;
        url.query_pairs_mut()
            .append_pair("model", LISTEN_MODEL)
            .append_pair("smart_format", "true");
        self.add_language(&mut url);
        Ok(url)
    }

    pub fn speak_url(&self) -> Result<Url> {
        let mut url = self.endpoint("v1/speak")?;
        url.query_pairs_mut()
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("model", voice_for(&self.config.language));
        Ok(url)
    }

    async fn listen(&self, url: Url, pcm: &[u8]) -> Result<ListenResponse> {
        let wav = pcm::to_wav(pcm, self.sample_rate, 1)?;
        log::debug!("POST {} ({} bytes of WAV)", url, wav.len());

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .header("Content-Type", "audio/wav")
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .body(wav)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Service(format!("HTTP {}: {}", status, body)));
        }
        Ok(resp.json::<ListenResponse>().await?)
    }
}

/// Synthesis voice for a language tag or name; English when unknown.
pub fn voice_for(language: &str) -> &'static str {
    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match primary.as_str() {
        "es" | "spanish" => "aura-asteria-es",
        "fr" | "french" => "aura-asteria-fr",
        "de" | "german" => "aura-asteria-de",
        "pt" | "portuguese" => "aura-asteria-pt",
        "it" | "italian" => "aura-asteria-it",
        _ => "aura-asteria-en",
    }
}

#[async_trait]
impl WakeWordSearch for DeepgramClient {
    async fn search(&self, pcm: Vec<u8>, phrases: &[WakePhrase]) -> Result<Vec<PhraseHit>> {
        if pcm.len() < MIN_UPLOAD_BYTES || phrases.is_empty() {
            log::debug!("Skipping wake search: {} bytes", pcm.len());
            return Ok(Vec::new());
        }
        let resp = self.listen(self.search_url(phrases)?, &pcm).await?;

        let hits = resp
            .searches()
            .iter()
            .flat_map(|s| {
                s.hits.iter().map(move |h| {
                    log::debug!(
                        "Search hit for '{}': confidence {:.3}, {:.1}-{:.1}s, '{}'",
                        s.query,
                        h.confidence,
                        h.start,
                        h.end,
                        h.snippet
                    );
                    PhraseHit {
                        phrase: s.query.clone(),
                        confidence: h.confidence,
                    }
                })
            })
            .collect();
        Ok(hits)
    }
}

#[async_trait]
impl Transcriber for DeepgramClient {
    async fn transcribe(&self, pcm: Vec<u8>) -> Result<String> {
        if pcm.len() < MIN_UPLOAD_BYTES {
            log::debug!("Skipping transcription: {} bytes", pcm.len());
            return Ok(String::new());
        }
        let resp = self.listen(self.transcribe_url()?, &pcm).await?;
        Ok(resp.transcript().trim().to_string())
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramClient {
    async fn synthesize(&self, text: &str) -> Result<PlaybackSource> {
        let url = self.speak_url()?;
        log::info!("Synthesizing \"{}\" via {}", text, url);

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&SpeakRequest { text })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Service(format!("HTTP {}: {}", status, body)));
        }

        let stream = resp.bytes_stream().map(|piece| piece.map_err(Error::from));
        Ok(PlaybackSource::Stream(Box::pin(stream)))
    }
}
