//! JSON shapes exchanged with the speech service.

use serde::{Deserialize, Serialize};

/// `POST /v1/listen` response. Only the fields we read are modelled.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ListenResponse {
    #[serde(default)]
    pub results: ListenResults,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ListenResults {
    #[serde(default)]
    pub channels: Vec<ListenChannel>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ListenChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
    #[serde(default)]
    pub search: Vec<SearchResult>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SearchResult {
    pub query: String,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SearchHit {
    pub confidence: f32,
    #[serde(default)]
    pub start: f32,
    #[serde(default)]
    pub end: f32,
    #[serde(default)]
    pub snippet: String,
}

impl ListenResponse {
    /// Best transcript of the first channel, empty when absent.
    pub fn transcript(&self) -> &str {
        self.results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.as_str())
            .unwrap_or("")
    }

    /// Search results of the first channel.
    pub fn searches(&self) -> &[SearchResult] {
        self.results
            .channels
            .first()
            .map(|c| c.search.as_slice())
            .unwrap_or(&[])
    }
}

/// `POST /v1/speak` body.
#[derive(Serialize, Debug, Clone)]
pub struct SpeakRequest<'a> {
    pub text: &'a str,
}
