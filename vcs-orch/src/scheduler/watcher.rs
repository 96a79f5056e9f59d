//! Completion detection by artifact presence
//!
//! The scheduler has no callback channel, so a job counts as finished once
//! the file it produces exists. The watcher re-checks with `test -f` on a
//! fixed interval. With no deadline it waits indefinitely; with a deadline it
//! gives up with `WatchError::Timeout`. A failed check is retried on the next
//! tick unless the session is gone, which ends the wait at once.

use crate::remote::{shell_quote, RemoteError, RemoteSession};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Watch failures
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Timed out after {waited:?} waiting for {path}")]
    Timeout { path: String, waited: Duration },

    /// The session can no longer run checks
    #[error("Lost remote session while waiting for {path}: {source}")]
    SessionLost {
        path: String,
        #[source]
        source: RemoteError,
    },
}

/// Single existence check for a remote regular file
pub async fn artifact_exists(session: &dyn RemoteSession, path: &str) -> Result<bool, RemoteError> {
    let command = format!("test -f {} && echo done", shell_quote(path));
    let output = session.execute(&command).await?;
    Ok(output.stdout.trim() == "done")
}

/// Blocks until a remote artifact appears
#[derive(Debug, Clone)]
pub struct CompletionWatcher {
    poll_interval: Duration,
    deadline: Option<Duration>,
}

impl CompletionWatcher {
    /// `deadline = None` waits indefinitely
    pub fn new(poll_interval: Duration, deadline: Option<Duration>) -> Self {
        Self {
            poll_interval,
            deadline,
        }
    }

    /// Build from config seconds; `timeout_secs == 0` means no deadline
    pub fn from_secs(poll_interval_secs: u64, timeout_secs: u64) -> Self {
        let deadline = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        Self::new(Duration::from_secs(poll_interval_secs.max(1)), deadline)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Wait for `path` to exist
    ///
    /// Checks immediately, then once per poll interval. Returns the number of
    /// checks performed: a path absent for N checks returns `N + 1`.
    pub async fn await_artifact(
        &self,
        session: &dyn RemoteSession,
        path: &str,
    ) -> Result<u32, WatchError> {
        let started = Instant::now();
        let mut checks: u32 = 0;
        info!(path = %path, interval = ?self.poll_interval, deadline = ?self.deadline, "Waiting for artifact");

        loop {
            checks += 1;
            match artifact_exists(session, path).await {
                Ok(true) => {
                    info!(path = %path, checks, elapsed = ?started.elapsed(), "Artifact present");
                    return Ok(checks);
                }
                Ok(false) => {}
                Err(source @ (RemoteError::Closed | RemoteError::Connect(_))) => {
                    warn!(path = %path, checks, "Session unusable, giving up: {}", source);
                    return Err(WatchError::SessionLost {
                        path: path.to_string(),
                        source,
                    });
                }
                Err(e) => warn!(path = %path, checks, "Existence check failed: {}", e),
            }

            if let Some(limit) = self.deadline {
                let waited = started.elapsed();
                if waited >= limit {
                    warn!(path = %path, checks, "Gave up waiting for artifact");
                    return Err(WatchError::Timeout {
                        path: path.to_string(),
                        waited,
                    });
                }
            }

            debug!(path = %path, checks, "Artifact not present yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
