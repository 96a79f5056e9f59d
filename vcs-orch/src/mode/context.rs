//! Playback context lookup
//!
//! Answers "what is the listener playing, and from which collection?" for the
//! conversion-mode loop.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("vcstream/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// What the listener is playing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackContext {
    /// Collection (playlist/album) id the track is being played from
    pub collection_id: String,
    pub track_name: String,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Playback API error {0}")]
    Status(u16),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait PlaybackContextSource: Send + Sync {
    /// `Ok(None)` when nothing is playing or the track has no collection
    async fn current_context(&self, access_token: &str) -> Result<Option<PlaybackContext>, ContextError>;
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    context: Option<ContextObject>,
    item: Option<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct ContextObject {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    name: String,
}

/// Last `:`-separated segment of a `spotify:playlist:<id>` URI
fn collection_id_from_uri(uri: &str) -> Option<&str> {
    uri.rsplit(':').next().filter(|id| !id.is_empty())
}

/// Spotify Web API "currently playing" client
pub struct SpotifyContextSource {
    http_client: reqwest::Client,
    api_base: String,
}

impl SpotifyContextSource {
    pub fn new(api_base: impl Into<String>) -> Result<Self, ContextError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ContextError::Network(e.to_string()))?;
        let api_base: String = api_base.into();

        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PlaybackContextSource for SpotifyContextSource {
    async fn current_context(&self, access_token: &str) -> Result<Option<PlaybackContext>, ContextError> {
        let url = format!("{}/v1/me/player/currently-playing", self.api_base);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ContextError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            tracing::warn!(status_code = status.as_u16(), "Playback API request failed");
            return Err(ContextError::Status(status.as_u16()));
        }

        let body: CurrentlyPlaying = response
            .json()
            .await
            .map_err(|e| ContextError::Parse(e.to_string()))?;

        Ok(parse_currently_playing(body))
    }
}

fn parse_currently_playing(body: CurrentlyPlaying) -> Option<PlaybackContext> {
    let context = body.context?;
    let item = body.item?;
    let collection_id = collection_id_from_uri(&context.uri)?.to_string();
    Some(PlaybackContext {
        collection_id,
        track_name: item.name,
    })
}
