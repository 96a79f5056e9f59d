//! Remote session abstraction
//!
//! A `RemoteSession` is one authenticated shell + file-transfer connection to
//! the compute cluster. The conversion-mode controller keeps one open across
//! many requests as a `SharedSession`, while one-shot HTTP handlers open and
//! close their own through a `SessionLease`.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod ssh;

pub use ssh::{SshConnector, SshSession};

/// Remote session failures
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Session could not be established (network, handshake, authentication)
    #[error("Connect error: {0}")]
    Connect(String),

    /// Upload, download, or remote delete failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Expected remote artifact is absent
    #[error("Remote file not found: {0}")]
    NotFound(String),

    /// Remote command could not be run
    #[error("Exec error: {0}")]
    Exec(String),

    /// Operation attempted after `close`
    #[error("Session closed")]
    Closed,
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// One authenticated remote connection
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Copy a local file to `remote_path`
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError>;

    /// Copy `remote_path` to `local_path`, then delete each of `delete_remote_after`
    ///
    /// Fails with `NotFound` if `remote_path` does not exist.
    async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        delete_remote_after: &[String],
    ) -> Result<(), RemoteError>;

    /// Run a shell command and capture its output
    async fn execute(&self, command: &str) -> Result<ExecOutput, RemoteError>;

    /// Release the connection. Calling it more than once is a no-op.
    async fn close(&self);
}

/// Opens new remote sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

/// A session with several holders
///
/// Every holder keeps its own `Arc<SharedSession>` and gives it back with
/// `release`. The connection is closed by whichever holder releases last, so
/// no holder can close it under another.
pub struct SharedSession {
    session: Arc<dyn RemoteSession>,
}

impl SharedSession {
    pub fn new(session: Arc<dyn RemoteSession>) -> Arc<Self> {
        Arc::new(Self { session })
    }

    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    /// Give up this handle; returns `true` if it was the last one and the
    /// session was closed
    pub async fn release(self: Arc<Self>) -> bool {
        match Arc::into_inner(self) {
            Some(last) => {
                debug!("Last holder released shared session");
                last.session.close().await;
                true
            }
            None => false,
        }
    }
}

/// A session borrowed for one request
///
/// `Shared` leases hold one handle on a `SharedSession`; `Owned` sessions were
/// opened for this request. Both are given back with `release`.
pub enum SessionLease {
    Shared(Arc<SharedSession>),
    Owned(Arc<dyn RemoteSession>),
}

impl SessionLease {
    /// Reuse `shared` if present, otherwise open a fresh session
    pub async fn acquire(
        shared: Option<Arc<SharedSession>>,
        connector: &dyn SessionConnector,
    ) -> Result<Self, RemoteError> {
        match shared {
            Some(session) => {
                debug!("Reusing shared remote session");
                Ok(SessionLease::Shared(session))
            }
            None => {
                debug!("Opening one-shot remote session");
                Ok(SessionLease::Owned(connector.open().await?))
            }
        }
    }

    pub fn session(&self) -> &dyn RemoteSession {
        match self {
            SessionLease::Shared(s) => s.session(),
            SessionLease::Owned(s) => s.as_ref(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, SessionLease::Owned(_))
    }

    /// Close an owned session, or drop this lease's hold on a shared one
    pub async fn release(self) {
        match self {
            SessionLease::Shared(shared) => {
                shared.release().await;
            }
            SessionLease::Owned(session) => session.close().await,
        }
    }
}

/// Quote a value for a POSIX shell command line
///
/// Values made only of `[A-Za-z0-9_./:=-]` pass through unchanged; anything
/// else is wrapped in single quotes.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '=' | '-'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}
