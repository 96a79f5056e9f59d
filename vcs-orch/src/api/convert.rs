//! Conversion endpoint
//!
//! POST /convert runs the whole pipeline synchronously and answers with the
//! combined WAV. The request holds its connection for the full scheduler
//! turnaround; conversion progress is also published on `/events`.

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::pipeline::SourceTrack;
use crate::AppState;

/// POST /convert request
#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    #[serde(default)]
    pub singer: String,
    /// Name of a track already staged in the remote input directory
    #[serde(default)]
    pub song: String,
}

/// POST /convert
pub async fn convert(
    State(state): State<AppState>,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Response> {
    let singer = request.singer.trim();
    let song = request.song.trim();
    if singer.is_empty() || song.is_empty() {
        return Err(ApiError::BadRequest(
            "Both singer and song are required".to_string(),
        ));
    }

    let lease = state.lease_session().await?;
    info!(singer = %singer, song = %song, shared = !lease.is_owned(), "Conversion requested");

    let result = state
        .coordinator
        .run_detailed(lease.session(), SourceTrack::Staged(song.to_string()), singer)
        .await;
    lease.release().await;

    let (local_path, run) = match result {
        Ok(done) => done,
        Err(e) => {
            warn!("Conversion failed: {}", e);
            state.record_error(e.to_string()).await;
            return Err(e.into());
        }
    };

    let bytes = tokio::fs::read(&local_path).await?;
    let file_name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}_{}.wav", run.singer_name, run.track_name));

    Ok((
        [
            (header::CONTENT_TYPE, "audio/wav".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
            (header::HeaderName::from_static("x-run-id"), run.run_id.to_string()),
        ],
        bytes,
    )
        .into_response())
}

pub fn convert_routes() -> Router<AppState> {
    Router::new().route("/convert", post(convert))
}
