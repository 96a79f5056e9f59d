//! Shared test doubles for vcs-orch integration tests
//!
//! `MockSession` stands in for the SSH connection and a Slurm-like scheduler:
//! - `sbatch` command lines get incrementing "Submitted batch job N" replies
//! - `test -f <path>` reports a path present once it was checked N times
//! - downloads write a small WAV-looking payload to the local path

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vcs_common::config::TomlConfig;
use vcs_orch::mode::{ContextError, PlaybackContext, PlaybackContextSource};
use vcs_orch::pipeline::{ConversionRunner, PipelineError, SourceTrack};
use vcs_orch::remote::{ExecOutput, RemoteError, RemoteSession, SessionConnector};

pub const DOWNLOAD_PAYLOAD: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    pub remote: String,
    pub local: PathBuf,
    pub deleted: Vec<String>,
}

#[derive(Default)]
struct MockState {
    commands: Vec<String>,
    uploads: Vec<(PathBuf, String)>,
    downloads: Vec<DownloadRecord>,
    next_job: u64,
    checks: HashMap<String, u32>,
    /// path -> number of absent checks before it appears
    appear_after: HashMap<String, u32>,
    sbatch_stderr: String,
    /// script fragment -> stderr returned instead of an acknowledgment
    rejections: Vec<(String, String)>,
    closes: u32,
    /// once closed, every operation fails with `RemoteError::Closed`
    strict_close: bool,
}

#[derive(Default)]
pub struct MockSession {
    state: Mutex<MockState>,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `path` is absent for `absent_checks` checks, then present
    pub fn artifact_after(&self, path: &str, absent_checks: u32) {
        self.lock().appear_after.insert(path.to_string(), absent_checks);
    }

    pub fn artifact_present(&self, path: &str) {
        self.artifact_after(path, 0);
    }

    /// Extra stderr on every successful sbatch
    pub fn sbatch_stderr(&self, stderr: &str) {
        self.lock().sbatch_stderr = stderr.to_string();
    }

    /// Submissions mentioning `script` fail with `stderr`
    pub fn reject_script(&self, script: &str, stderr: &str) {
        self.lock()
            .rejections
            .push((script.to_string(), stderr.to_string()));
    }

    /// Behave like a real connection after `close`
    pub fn reject_after_close(&self) {
        self.lock().strict_close = true;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn sbatch_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains("sbatch"))
            .collect()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.lock().uploads.clone()
    }

    pub fn downloads(&self) -> Vec<DownloadRecord> {
        self.lock().downloads.clone()
    }

    pub fn checks_for(&self, path: &str) -> u32 {
        self.lock().checks.get(path).copied().unwrap_or(0)
    }

    pub fn close_count(&self) -> u32 {
        self.lock().closes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn ensure_open(&self) -> Result<(), RemoteError> {
        let state = self.lock();
        if state.strict_close && state.closes > 0 {
            return Err(RemoteError::Closed);
        }
        Ok(())
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        self.ensure_open()?;
        if !local_path.exists() {
            return Err(RemoteError::Transfer(format!("{} missing", local_path.display())));
        }
        self.lock()
            .uploads
            .push((local_path.to_path_buf(), remote_path.to_string()));
        Ok(())
    }

    async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        delete_remote_after: &[String],
    ) -> Result<(), RemoteError> {
        self.ensure_open()?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RemoteError::Transfer(e.to_string()))?;
        }
        std::fs::write(local_path, DOWNLOAD_PAYLOAD).map_err(|e| RemoteError::Transfer(e.to_string()))?;
        self.lock().downloads.push(DownloadRecord {
            remote: remote_path.to_string(),
            local: local_path.to_path_buf(),
            deleted: delete_remote_after.to_vec(),
        });
        Ok(())
    }

    async fn execute(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.commands.push(command.to_string());

        if let Some(rest) = command.strip_prefix("test -f ") {
            let path = unquote(rest.trim_end_matches(" && echo done"));
            let count = state.checks.entry(path.clone()).or_insert(0);
            *count += 1;
            let seen = *count;
            let present = state
                .appear_after
                .get(&path)
                .is_some_and(|absent| seen > *absent);
            return Ok(ExecOutput {
                stdout: if present { "done\n".to_string() } else { String::new() },
                stderr: String::new(),
                exit_status: if present { 0 } else { 1 },
            });
        }

        if command.contains("sbatch") {
            if let Some((_, stderr)) = state
                .rejections
                .iter()
                .find(|(script, _)| command.contains(script.as_str()))
            {
                return Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: stderr.clone(),
                    exit_status: 1,
                });
            }
            state.next_job += 1;
            return Ok(ExecOutput {
                stdout: format!("Submitted batch job {}\n", state.next_job),
                stderr: state.sbatch_stderr.clone(),
                exit_status: 0,
            });
        }

        Ok(ExecOutput::default())
    }

    async fn close(&self) {
        self.lock().closes += 1;
    }
}

/// Hands out the same `MockSession` on every open
pub struct MockConnector {
    pub session: Arc<MockSession>,
    pub opens: AtomicUsize,
    pub fail: bool,
}

impl MockConnector {
    pub fn new(session: Arc<MockSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            opens: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            session: MockSession::new(),
            opens: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn open(&self) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        if self.fail {
            return Err(RemoteError::Connect("connection refused".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let session: Arc<dyn RemoteSession> = self.session.clone();
        Ok(session)
    }
}

/// Takes `delay` to connect, then hands out the same `MockSession`
pub struct SlowConnector {
    pub session: Arc<MockSession>,
    pub delay: Duration,
    pub opens: AtomicUsize,
}

impl SlowConnector {
    pub fn new(session: Arc<MockSession>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            session,
            delay,
            opens: AtomicUsize::new(0),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for SlowConnector {
    async fn open(&self) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let session: Arc<dyn RemoteSession> = self.session.clone();
        Ok(session)
    }
}

/// Always reports the same playback context
pub struct FixedContext {
    pub context: Option<PlaybackContext>,
    pub calls: AtomicUsize,
}

impl FixedContext {
    pub fn playing(collection_id: &str, track_name: &str) -> Arc<Self> {
        Arc::new(Self {
            context: Some(PlaybackContext {
                collection_id: collection_id.to_string(),
                track_name: track_name.to_string(),
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn idle() -> Arc<Self> {
        Arc::new(Self {
            context: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackContextSource for FixedContext {
    async fn current_context(&self, _access_token: &str) -> Result<Option<PlaybackContext>, ContextError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.context.clone())
    }
}

/// Records conversion requests instead of running them
#[derive(Default)]
pub struct RecordingRunner {
    pub runs: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn runs(&self) -> Vec<(String, String)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversionRunner for RecordingRunner {
    async fn run(
        &self,
        _session: &dyn RemoteSession,
        source: SourceTrack,
        singer: &str,
    ) -> Result<PathBuf, PipelineError> {
        let track = source.track_name();
        self.runs.lock().unwrap().push((singer.to_string(), track.clone()));
        Ok(PathBuf::from(format!("output/{}_{}.wav", singer, track)))
    }
}

/// Config rooted in `dir`, with remote paths under `/r` and `/run`
pub fn test_config(dir: &Path) -> TomlConfig {
    let mut config = TomlConfig::default();
    config.server.upload_dir = dir.join("uploads");
    config.remote.base_dir = "/r".to_string();
    config.remote.run_dir = "/run".to_string();
    config.remote.conda_sh = "/opt/conda/etc/profile.d/conda.sh".to_string();
    config.remote.weights_dir = "/r/weights".to_string();
    config.remote.index_dir = "/r/indexes".to_string();
    config.pipeline.poll_interval_secs = 1;
    config.pipeline.completion_timeout_secs = 30;
    config.pipeline.output_dir = dir.join("output");
    config.registry.path = dir.join("singers.json");
    config.mode.poll_interval_secs = 1;
    config.mode.watched_collections = vec!["watched".to_string()];
    config
}

/// Starts every run and never finishes it
#[derive(Default)]
pub struct StalledRunner {
    pub started: AtomicUsize,
    /// runs whose future was dropped before completing
    pub dropped: AtomicUsize,
}

impl StalledRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropCounter<'a>(&'a AtomicUsize);

impl Drop for DropCounter<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversionRunner for StalledRunner {
    async fn run(
        &self,
        _session: &dyn RemoteSession,
        _source: SourceTrack,
        _singer: &str,
    ) -> Result<PathBuf, PipelineError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _counter = DropCounter(&self.dropped);
        std::future::pending::<Result<PathBuf, PipelineError>>().await
    }
}
