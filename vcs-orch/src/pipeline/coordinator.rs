//! Pipeline coordinator
//!
//! # Stage progression
//! UPLOAD (local sources only) → SEPARATE → INFER → COMBINE → AWAIT + DOWNLOAD → CLEANUP
//!
//! Each scheduler stage is submitted with `--dependency=afterok:<previous>`,
//! so all three compute jobs are enqueued back to back and the scheduler
//! enforces ordering. The coordinator only blocks once, on the combined
//! artifact. Cleanup is best-effort: it is submitted after the download and
//! its failure never changes the result.
//!
//! Runs are not persisted. Two runs for the same `(singer, track)` would
//! write the same remote paths, so a second concurrent run for that key is
//! refused with `PipelineError::AlreadyRunning`.

use crate::pipeline::layout::{sanitize_name, RemoteLayout, RemotePaths};
use crate::remote::{RemoteError, RemoteSession};
use crate::scheduler::{CompletionWatcher, JobId, JobSpec, JobSubmitter, SubmissionError, WatchError};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;
use vcs_common::config::ScriptNames;
use vcs_common::events::{EventBus, VcsEvent};

/// Scheduler stages, in submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Split the source into vocal and instrumental stems
    Separate,
    /// Re-synthesize the vocal stem with the target voice model
    Infer,
    /// Overlay the converted vocal on the instrumental
    Combine,
    /// Reclaim remote scratch space
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Separate => "separate",
            Stage::Infer => "infer",
            Stage::Combine => "combine",
            Stage::Cleanup => "cleanup",
        }
    }
}

/// Where the source audio comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTrack {
    /// Local file, uploaded to the remote input directory first
    Local(PathBuf),
    /// Track already staged in the remote input directory, by name
    Staged(String),
}

impl SourceTrack {
    /// Sanitized track name used in every remote path
    pub fn track_name(&self) -> String {
        match self {
            SourceTrack::Local(path) => sanitize_name(
                &path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
            SourceTrack::Staged(name) => sanitize_name(name),
        }
    }

    pub fn needs_upload(&self) -> bool {
        matches!(self, SourceTrack::Local(_))
    }
}

/// One conversion request
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub singer_name: String,
    pub track_name: String,
    #[serde(skip)]
    pub source: SourceTrack,
    pub remote_paths: RemotePaths,
    pub stage_jobs: Vec<(Stage, JobId)>,
}

impl PipelineRun {
    fn last_job(&self) -> Option<JobId> {
        self.stage_jobs.last().map(|(_, id)| *id)
    }
}

/// Pipeline failures, reported to the caller as one descriptive error
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline input: {0}")]
    InvalidInput(String),

    #[error("A conversion of '{track}' with '{singer}' is already running")]
    AlreadyRunning { singer: String, track: String },

    #[error("Remote operation failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Stage {stage} submission failed: {source}")]
    Submission {
        stage: &'static str,
        #[source]
        source: SubmissionError,
    },

    #[error("Pipeline timed out: {0}")]
    Timeout(WatchError),

    #[error("Local I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WatchError> for PipelineError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::SessionLost { source, .. } => PipelineError::Remote(source),
            timeout => PipelineError::Timeout(timeout),
        }
    }
}

/// Something that can turn a source track into a converted local file
///
/// Implemented by `PipelineCoordinator`; the conversion-mode controller
/// depends on this seam rather than the concrete coordinator.
#[async_trait]
pub trait ConversionRunner: Send + Sync {
    async fn run(
        &self,
        session: &dyn RemoteSession,
        source: SourceTrack,
        singer: &str,
    ) -> Result<PathBuf, PipelineError>;
}

/// Removes its key from the in-flight set when dropped
struct RunGuard<'a> {
    in_flight: &'a Mutex<HashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.key);
    }
}

/// Sequences the conversion stages on the batch scheduler
pub struct PipelineCoordinator {
    submitter: JobSubmitter,
    watcher: CompletionWatcher,
    layout: RemoteLayout,
    scripts: ScriptNames,
    output_dir: PathBuf,
    event_bus: EventBus,
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl PipelineCoordinator {
    pub fn new(
        submitter: JobSubmitter,
        watcher: CompletionWatcher,
        layout: RemoteLayout,
        scripts: ScriptNames,
        output_dir: PathBuf,
        event_bus: EventBus,
    ) -> Self {
        Self {
            submitter,
            watcher,
            layout,
            scripts,
            output_dir,
            event_bus,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn claim(&self, singer: &str, track: &str) -> Result<RunGuard<'_>, PipelineError> {
        let key = (singer.to_string(), track.to_string());
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(key.clone()) {
            return Err(PipelineError::AlreadyRunning {
                singer: key.0,
                track: key.1,
            });
        }
        Ok(RunGuard {
            in_flight: &self.in_flight,
            key,
        })
    }

    async fn submit_stage(
        &self,
        session: &dyn RemoteSession,
        run: &mut PipelineRun,
        stage: Stage,
        spec: JobSpec,
    ) -> Result<JobId, PipelineError> {
        let depends_on = run.last_job();
        let job = self
            .submitter
            .submit(session, &spec, depends_on)
            .await
            .map_err(|source| PipelineError::Submission {
                stage: stage.as_str(),
                source,
            })?;

        run.stage_jobs.push((stage, job.job_id));
        self.event_bus.emit_lossy(VcsEvent::StageSubmitted {
            run_id: run.run_id,
            stage: stage.as_str().to_string(),
            job_id: job.job_id.0,
            depends_on: depends_on.map(|j| j.0),
            timestamp: Utc::now(),
        });
        Ok(job.job_id)
    }

    async fn execute(
        &self,
        session: &dyn RemoteSession,
        run: &mut PipelineRun,
    ) -> Result<PathBuf, PipelineError> {
        if let SourceTrack::Local(local) = &run.source {
            info!(run_id = %run.run_id, "Uploading {} -> {}", local.display(), run.remote_paths.input);
            session.upload_file(local, &run.remote_paths.input).await?;
        }

        let singer = run.singer_name.clone();
        self.submit_stage(session, run, Stage::Separate, JobSpec::new(&self.scripts.separate))
            .await?;
        self.submit_stage(
            session,
            run,
            Stage::Infer,
            JobSpec::new(&self.scripts.infer).arg(&singer),
        )
        .await?;
        let combine_job = self
            .submit_stage(
                session,
                run,
                Stage::Combine,
                JobSpec::new(&self.scripts.combine).arg(&singer),
            )
            .await?;

        self.watcher
            .await_artifact(session, &run.remote_paths.combined)
            .await?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let file_name = format!("{}_{}.wav", run.singer_name, run.track_name);
        let local_output = self.output_dir.join(file_name);
        let delete_after = if run.source.needs_upload() {
            vec![run.remote_paths.input.clone()]
        } else {
            Vec::new()
        };
        session
            .download_file(&run.remote_paths.combined, &local_output, &delete_after)
            .await?;
        info!(run_id = %run.run_id, "Downloaded {}", local_output.display());

        self.submit_cleanup(session, run, combine_job).await;

        Ok(local_output)
    }

    /// Best-effort; failures are logged and swallowed
    async fn submit_cleanup(&self, session: &dyn RemoteSession, run: &mut PipelineRun, combine_job: JobId) {
        let spec = JobSpec::new(&self.scripts.cleanup);
        match self.submitter.submit(session, &spec, Some(combine_job)).await {
            Ok(job) => {
                run.stage_jobs.push((Stage::Cleanup, job.job_id));
                self.event_bus.emit_lossy(VcsEvent::StageSubmitted {
                    run_id: run.run_id,
                    stage: Stage::Cleanup.as_str().to_string(),
                    job_id: job.job_id.0,
                    depends_on: Some(combine_job.0),
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                warn!(run_id = %run.run_id, "Cleanup submission failed (ignored): {}", e);
            }
        }
    }

    /// Run the full pipeline and return the full `PipelineRun` record
    pub async fn run_detailed(
        &self,
        session: &dyn RemoteSession,
        source: SourceTrack,
        singer: &str,
    ) -> Result<(PathBuf, PipelineRun), PipelineError> {
        let singer = sanitize_name(singer);
        let track = source.track_name();
        if singer.is_empty() {
            return Err(PipelineError::InvalidInput("singer name is empty".to_string()));
        }
        if track.is_empty() {
            return Err(PipelineError::InvalidInput("track name is empty".to_string()));
        }

        let _guard = self.claim(&singer, &track)?;

        let mut run = PipelineRun {
            run_id: Uuid::new_v4(),
            remote_paths: self.layout.paths_for(&singer, &track),
            singer_name: singer,
            track_name: track,
            source,
            stage_jobs: Vec::new(),
        };

        info!(run_id = %run.run_id, singer = %run.singer_name, track = %run.track_name, "Pipeline run started");
        self.event_bus.emit_lossy(VcsEvent::PipelineStarted {
            run_id: run.run_id,
            singer: run.singer_name.clone(),
            track: run.track_name.clone(),
            timestamp: Utc::now(),
        });

        match self.execute(session, &mut run).await {
            Ok(path) => {
                self.event_bus.emit_lossy(VcsEvent::PipelineCompleted {
                    run_id: run.run_id,
                    local_path: path.display().to_string(),
                    timestamp: Utc::now(),
                });
                info!(run_id = %run.run_id, "Pipeline run completed");
                Ok((path, run))
            }
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Pipeline run failed");
                self.event_bus.emit_lossy(VcsEvent::PipelineFailed {
                    run_id: run.run_id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ConversionRunner for PipelineCoordinator {
    async fn run(
        &self,
        session: &dyn RemoteSession,
        source: SourceTrack,
        singer: &str,
    ) -> Result<PathBuf, PipelineError> {
        self.run_detailed(session, source, singer)
            .await
            .map(|(path, _)| path)
    }
}
