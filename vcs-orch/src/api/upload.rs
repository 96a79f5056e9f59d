//! Audio upload endpoint
//!
//! `source` uploads are staged as `<base>/input/<name>.wav` for later
//! conversion. `target` uploads are training material and land in
//! `<base>/train_input/<name>/`.

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::pipeline::sanitize_name;
use crate::remote::shell_quote;
use crate::AppState;

/// Upload size ceiling (audio files are large)
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Source,
    Target,
}

impl UploadKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "source" => Some(UploadKind::Source),
            "target" => Some(UploadKind::Target),
            _ => None,
        }
    }

    fn dir_name(&self) -> &'static str {
        match self {
            UploadKind::Source => "source",
            UploadKind::Target => "target",
        }
    }
}

/// POST /upload_audio response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub kind: UploadKind,
    pub name: String,
    pub remote_path: String,
    pub bytes: usize,
}

/// POST /upload_audio (multipart: `type`, `name`, `file`)
pub async fn upload_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut kind = None;
    let mut name = None;
    let mut data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "type" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                kind = Some(UploadKind::parse(&text).ok_or_else(|| {
                    ApiError::BadRequest("type must be 'source' or 'target'".to_string())
                })?);
            }
            "name" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                name = Some(text);
            }
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                data = Some(bytes);
            }
            _ => {}
        }
    }

    let kind = kind.ok_or_else(|| ApiError::BadRequest("Missing field: type".to_string()))?;
    let data = data.ok_or_else(|| ApiError::BadRequest("Missing field: file".to_string()))?;
    let name = sanitize_name(&name.unwrap_or_default());
    if name.is_empty() {
        return Err(ApiError::BadRequest("Missing field: name".to_string()));
    }

    let local_dir: PathBuf = state.config.server.upload_dir.join(kind.dir_name());
    tokio::fs::create_dir_all(&local_dir).await?;
    let local_path = local_dir.join(format!("{}.wav", name));
    tokio::fs::write(&local_path, &data).await?;

    let layout = state.coordinator.layout();
    let (remote_dir, remote_path) = match kind {
        UploadKind::Source => (layout.input_dir(), layout.input(&name)),
        UploadKind::Target => {
            let dir = layout.train_input_dir(&name);
            let path = format!("{}/{}.wav", dir, name);
            (dir, path)
        }
    };

    let lease = state.lease_session().await?;
    let transfer = async {
        lease
            .session()
            .execute(&format!("mkdir -p {}", shell_quote(&remote_dir)))
            .await?;
        lease.session().upload_file(&local_path, &remote_path).await
    }
    .await;
    lease.release().await;
    transfer?;

    info!(kind = ?kind, name = %name, remote = %remote_path, bytes = data.len(), "Audio uploaded");

    Ok(Json(UploadResponse {
        kind,
        name,
        remote_path,
        bytes: data.len(),
    }))
}

pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/upload_audio", post(upload_audio))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
