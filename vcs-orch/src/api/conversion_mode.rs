//! Conversion mode endpoints
//!
//! GET /conversion_mode, POST /conversion_mode

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::mode::ModeStatus;
use crate::AppState;

/// POST /conversion_mode request
#[derive(Debug, Deserialize)]
pub struct ConversionModeRequest {
    #[serde(default)]
    pub on: bool,
    /// Playback API bearer token; required when turning on
    #[serde(default)]
    pub access_token: Option<String>,
    /// Target voice model; required when turning on
    #[serde(default)]
    pub singer: Option<String>,
}

/// POST /conversion_mode response
#[derive(Debug, Serialize)]
pub struct ConversionModeResponse {
    pub on: bool,
    /// False when the request did not change anything
    pub changed: bool,
    pub status: ModeStatus,
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is required to enable conversion mode", field)))
}

/// GET /conversion_mode
pub async fn get_conversion_mode(State(state): State<AppState>) -> Json<ModeStatus> {
    Json(state.mode.status().await)
}

/// POST /conversion_mode
pub async fn set_conversion_mode(
    State(state): State<AppState>,
    Json(request): Json<ConversionModeRequest>,
) -> ApiResult<Json<ConversionModeResponse>> {
    let changed = if request.on {
        let access_token = required(request.access_token, "access_token")?;
        let singer = required(request.singer, "singer")?;
        match state.mode.enable(&access_token, &singer).await {
            Ok(started) => started,
            Err(e) => {
                state.record_error(e.to_string()).await;
                return Err(e.into());
            }
        }
    } else {
        state.mode.disable().await
    };

    let status = state.mode.status().await;
    Ok(Json(ConversionModeResponse {
        on: status.active,
        changed,
        status,
    }))
}

pub fn conversion_mode_routes() -> Router<AppState> {
    Router::new().route(
        "/conversion_mode",
        get(get_conversion_mode).post(set_conversion_mode),
    )
}
