//! Singer registry endpoints
//!
//! GET /singers, POST /singers, DELETE /singers/:name

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::registry::{SingerRecord, TrainingSubmission};
use crate::AppState;

/// GET /singers query parameters
#[derive(Debug, Default, Deserialize)]
pub struct ListSingersQuery {
    /// Substring filter on the singer name
    #[serde(default)]
    pub query: String,
    /// Re-check training artifacts on the remote host before listing
    #[serde(default)]
    pub refresh: bool,
}

/// POST /singers request
#[derive(Debug, Deserialize)]
pub struct RegisterSingerRequest {
    pub name: String,
}

/// GET /singers
pub async fn list_singers(
    State(state): State<AppState>,
    Query(params): Query<ListSingersQuery>,
) -> ApiResult<Json<Vec<SingerRecord>>> {
    if params.refresh {
        let lease = state.lease_session().await?;
        let refreshed = state.registry.refresh_statuses(lease.session()).await;
        lease.release().await;
        let finished = refreshed?;
        if !finished.is_empty() {
            info!("Training finished for: {}", finished.join(", "));
        }
    }

    let records = state.registry.list().await?;
    let filtered = records
        .into_iter()
        .filter(|r| r.name.contains(params.query.as_str()))
        .collect();
    Ok(Json(filtered))
}

/// POST /singers
///
/// Registers the singer and submits its training jobs. Training audio must
/// already be uploaded as a `target`. Re-registering an existing singer
/// submits nothing and answers 200 instead of 201.
pub async fn register_singer(
    State(state): State<AppState>,
    Json(request): Json<RegisterSingerRequest>,
) -> ApiResult<(StatusCode, Json<TrainingSubmission>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Singer name is required".to_string()));
    }

    let lease = state.lease_session().await?;
    let result = state
        .registry
        .begin_training(lease.session(), &state.submitter, request.name.trim())
        .await;
    lease.release().await;

    let submission = match result {
        Ok(submission) => submission,
        Err(e) => {
            state.record_error(e.to_string()).await;
            return Err(e.into());
        }
    };

    let status = if submission.jobs.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(submission)))
}

/// DELETE /singers/:name
pub async fn delete_singer(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if state.registry.remove(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Singer not registered: {}", name)))
    }
}

pub fn singer_routes() -> Router<AppState> {
    Router::new()
        .route("/singers", get(list_singers).post(register_singer))
        .route("/singers/:name", delete(delete_singer))
}
