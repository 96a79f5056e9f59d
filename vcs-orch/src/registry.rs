//! Singer registry
//!
//! Tracks every target voice model from `training` to `done`.
//!
//! # Persistence
//! A JSON document holding an ordered list of `{name, status}` records. The
//! file is the source of truth: every read reloads it and every mutation
//! rewrites it in full (temp file + rename). There is no in-memory cache, so
//! edits made to the file by other tools are picked up on the next read.
//!
//! # Status transitions
//! `training → done` only, once both the model weights and the retrieval
//! index exist on the remote host. A `done` record never returns to `training`.

use crate::pipeline::sanitize_name;
use crate::remote::{RemoteError, RemoteSession};
use crate::scheduler::{artifact_exists, Job, JobSpec, JobSubmitter, SubmissionError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vcs_common::config::RemoteConfig;
use vcs_common::events::{EventBus, VcsEvent};

/// Training lifecycle of one voice model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SingerStatus {
    Training,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingerRecord {
    pub name: String,
    pub status: SingerStatus,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid singer name: {0:?}")]
    InvalidName(String),

    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry document is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote operation failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Training submission failed: {0}")]
    Submission(#[from] SubmissionError),
}

/// Result of `begin_training`
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSubmission {
    pub record: SingerRecord,
    /// Empty when the singer was already registered
    pub jobs: Vec<Job>,
}

/// Remote artifact locations and training scripts
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    pub weights_dir: String,
    pub index_dir: String,
    pub separate_train_script: String,
    pub train_script: String,
}

impl TrainingLayout {
    pub fn from_config(remote: &RemoteConfig) -> Self {
        Self {
            weights_dir: remote.weights_dir.trim_end_matches('/').to_string(),
            index_dir: remote.index_dir.trim_end_matches('/').to_string(),
            separate_train_script: remote.scripts.separate_train.clone(),
            train_script: remote.scripts.train.clone(),
        }
    }

    pub fn weights_path(&self, name: &str) -> String {
        format!("{}/{}.pth", self.weights_dir, name)
    }

    pub fn index_path(&self, name: &str) -> String {
        format!("{}/{}.index", self.index_dir, name)
    }
}

/// Durable singer registry
pub struct SingerRegistry {
    path: PathBuf,
    layout: TrainingLayout,
    event_bus: EventBus,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl SingerRegistry {
    pub fn new(path: impl Into<PathBuf>, layout: TrainingLayout, event_bus: EventBus) -> Self {
        Self {
            path: path.into(),
            layout,
            event_bus,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(name: &str) -> Result<String, RegistryError> {
        let clean = sanitize_name(name);
        if clean.is_empty() || clean != name.trim() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        Ok(clean)
    }

    /// Read the whole document. A missing file is an empty registry.
    async fn load(&self) -> Result<Vec<SingerRecord>, RegistryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the whole document atomically
    async fn persist(&self, records: &[SingerRecord]) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Registry persisted ({} records) to {}", records.len(), self.path.display());
        Ok(())
    }

    /// All records in insertion order, freshly loaded
    pub async fn list(&self) -> Result<Vec<SingerRecord>, RegistryError> {
        self.load().await
    }

    pub async fn get(&self, name: &str) -> Result<Option<SingerRecord>, RegistryError> {
        Ok(self.load().await?.into_iter().find(|r| r.name == name))
    }

    /// Insert `name` as `training` unless already present
    ///
    /// Returns `true` if a record was inserted.
    pub async fn add(&self, name: &str) -> Result<bool, RegistryError> {
        let name = Self::validate(name)?;
        let _lock = self.write_lock.lock().await;

        let mut records = self.load().await?;
        if records.iter().any(|r| r.name == name) {
            debug!(singer = %name, "Singer already registered");
            return Ok(false);
        }
        records.push(SingerRecord {
            name: name.clone(),
            status: SingerStatus::Training,
        });
        self.persist(&records).await?;
        info!(singer = %name, "Singer registered (training)");
        Ok(true)
    }

    /// Returns `true` if a record was removed
    pub async fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let _lock = self.write_lock.lock().await;

        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| r.name != name);
        if records.len() == before {
            return Ok(false);
        }
        self.persist(&records).await?;
        info!(singer = %name, "Singer removed");
        Ok(true)
    }

    /// Flip `training` records whose weights and index both exist to `done`
    ///
    /// Persists only when at least one record changed. Returns the names
    /// that became `done`.
    pub async fn refresh_statuses(&self, session: &dyn RemoteSession) -> Result<Vec<String>, RegistryError> {
        let _lock = self.write_lock.lock().await;

        let mut records = self.load().await?;
        let mut finished = Vec::new();

        for record in records.iter_mut().filter(|r| r.status == SingerStatus::Training) {
            let weights = artifact_exists(session, &self.layout.weights_path(&record.name)).await?;
            if !weights {
                continue;
            }
            let index = artifact_exists(session, &self.layout.index_path(&record.name)).await?;
            if index {
                record.status = SingerStatus::Done;
                finished.push(record.name.clone());
            }
        }

        if !finished.is_empty() {
            self.persist(&records).await?;
            for name in &finished {
                info!(singer = %name, "Singer training finished");
                self.event_bus.emit_lossy(VcsEvent::SingerReady {
                    name: name.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
        Ok(finished)
    }

    /// Register `name` and enqueue its training chain
    ///
    /// Submits `separate_train <name>` and then `train <name>` after it. A
    /// singer that is already registered is returned as-is with no new jobs.
    /// If either submission fails the new record is removed again, so the
    /// singer can be retried.
    pub async fn begin_training(
        &self,
        session: &dyn RemoteSession,
        submitter: &JobSubmitter,
        name: &str,
    ) -> Result<TrainingSubmission, RegistryError> {
        let name = Self::validate(name)?;

        if !self.add(&name).await? {
            let record = self.get(&name).await?.unwrap_or(SingerRecord {
                name: name.clone(),
                status: SingerStatus::Training,
            });
            return Ok(TrainingSubmission {
                record,
                jobs: Vec::new(),
            });
        }

        let jobs = match self.submit_training(session, submitter, &name).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(singer = %name, "Training submission failed, unregistering: {}", e);
                self.remove(&name).await?;
                return Err(e.into());
            }
        };

        Ok(TrainingSubmission {
            record: SingerRecord {
                name,
                status: SingerStatus::Training,
            },
            jobs,
        })
    }

    async fn submit_training(
        &self,
        session: &dyn RemoteSession,
        submitter: &JobSubmitter,
        name: &str,
    ) -> Result<Vec<Job>, SubmissionError> {
        let separate = submitter
            .submit(
                session,
                &JobSpec::new(&self.layout.separate_train_script).arg(name),
                None,
            )
            .await?;
        let train = submitter
            .submit(
                session,
                &JobSpec::new(&self.layout.train_script).arg(name),
                Some(separate.job_id),
            )
            .await?;
        info!(singer = %name, separate_job = %separate.job_id, train_job = %train.job_id, "Training submitted");
        Ok(vec![separate, train])
    }
}
