//! SSH-backed remote session
//!
//! libssh2 is blocking, so every operation runs on `spawn_blocking` with the
//! session behind a std mutex. Operations on one session are serialized.
//!
//! Host keys are not verified: unknown keys are accepted and only their
//! SHA-256 fingerprint is logged.

use super::{ExecOutput, RemoteError, RemoteSession, SessionConnector};
use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, HashType, Session};
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use vcs_common::config::SshCredentials;

/// libssh2 status for "no such file" on SFTP operations
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Pause between output reads when neither stream had data
const DRAIN_IDLE: Duration = Duration::from_millis(10);

/// Opens `SshSession`s from configured credentials
pub struct SshConnector {
    credentials: SshCredentials,
}

impl SshConnector {
    pub fn new(credentials: SshCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn open(&self) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let credentials = self.credentials.clone();
        let session = tokio::task::spawn_blocking(move || SshSession::connect(&credentials))
            .await
            .map_err(|e| RemoteError::Connect(format!("connect task failed: {}", e)))??;
        Ok(Arc::new(session))
    }
}

/// One SSH connection with exec and SFTP
pub struct SshSession {
    inner: Arc<Mutex<Option<Session>>>,
    label: String,
}

impl SshSession {
    /// Connect and authenticate (blocking)
    pub fn connect(credentials: &SshCredentials) -> Result<Self, RemoteError> {
        let label = format!("{}@{}:{}", credentials.user, credentials.host, credentials.port);
        debug!("Connecting to {}", label);

        let tcp = TcpStream::connect((credentials.host.as_str(), credentials.port))
            .map_err(|e| RemoteError::Connect(format!("{}: {}", label, e)))?;

        let mut session =
            Session::new().map_err(|e| RemoteError::Connect(format!("{}: {}", label, e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| RemoteError::Connect(format!("handshake with {}: {}", label, e)))?;

        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            let fingerprint: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
            warn!(host = %credentials.host, fingerprint = %fingerprint, "Accepting host key without verification");
        }

        session
            .userauth_password(&credentials.user, &credentials.password)
            .map_err(|e| RemoteError::Connect(format!("authentication for {}: {}", label, e)))?;
        if !session.authenticated() {
            return Err(RemoteError::Connect(format!("authentication for {} rejected", label)));
        }

        info!("SSH session established: {}", label);
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(session))),
            label,
        })
    }

    /// Run `op` against the live session on the blocking pool
    async fn with_session<T, F>(&self, on_failure: fn(String) -> RemoteError, op: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, RemoteError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| on_failure("session lock poisoned".to_string()))?;
            let session = guard.as_ref().ok_or(RemoteError::Closed)?;
            op(session)
        })
        .await
        .map_err(|e| on_failure(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let local: PathBuf = local_path.to_path_buf();
        let remote = remote_path.to_string();
        debug!("Uploading {} -> {}", local.display(), remote);

        self.with_session(RemoteError::Transfer, move |session| {
            let sftp = session
                .sftp()
                .map_err(|e| RemoteError::Transfer(format!("sftp: {}", e)))?;
            let mut local_file = std::fs::File::open(&local)
                .map_err(|e| RemoteError::Transfer(format!("open {}: {}", local.display(), e)))?;
            let mut remote_file = sftp
                .create(Path::new(&remote))
                .map_err(|e| RemoteError::Transfer(format!("create {}: {}", remote, e)))?;
            std::io::copy(&mut local_file, &mut remote_file)
                .map_err(|e| RemoteError::Transfer(format!("write {}: {}", remote, e)))?;
            Ok(())
        })
        .await
    }

    async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        delete_remote_after: &[String],
    ) -> Result<(), RemoteError> {
        let remote = remote_path.to_string();
        let local: PathBuf = local_path.to_path_buf();
        let delete_after = delete_remote_after.to_vec();
        debug!("Downloading {} -> {}", remote, local.display());

        self.with_session(RemoteError::Transfer, move |session| {
            let sftp = session
                .sftp()
                .map_err(|e| RemoteError::Transfer(format!("sftp: {}", e)))?;

            if let Err(e) = sftp.stat(Path::new(&remote)) {
                return Err(match e.code() {
                    ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => RemoteError::NotFound(remote),
                    _ => RemoteError::Transfer(format!("stat {}: {}", remote, e)),
                });
            }

            let mut remote_file = sftp
                .open(Path::new(&remote))
                .map_err(|e| RemoteError::Transfer(format!("open {}: {}", remote, e)))?;
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RemoteError::Transfer(format!("create {}: {}", parent.display(), e))
                })?;
            }
            let mut local_file = std::fs::File::create(&local)
                .map_err(|e| RemoteError::Transfer(format!("create {}: {}", local.display(), e)))?;
            std::io::copy(&mut remote_file, &mut local_file)
                .map_err(|e| RemoteError::Transfer(format!("read {}: {}", remote, e)))?;

            for path in &delete_after {
                sftp.unlink(Path::new(path))
                    .map_err(|e| RemoteError::Transfer(format!("delete {}: {}", path, e)))?;
                debug!("Deleted remote {}", path);
            }
            Ok(())
        })
        .await
    }

    async fn execute(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let command = command.to_string();

        self.with_session(RemoteError::Exec, move |session| {
            let exec_err = |e: ssh2::Error| RemoteError::Exec(format!("{}: {}", command, e));
            let mut channel = session.channel_session().map_err(exec_err)?;
            channel.exec(&command).map_err(exec_err)?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            session.set_blocking(false);
            let drained = drain_output(&mut channel, &mut stdout, &mut stderr);
            session.set_blocking(true);
            drained.map_err(|e| RemoteError::Exec(format!("read output: {}", e)))?;

            channel.wait_close().map_err(exec_err)?;
            let exit_status = channel.exit_status().map_err(exec_err)?;

            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_status,
            })
        })
        .await
    }

    async fn close(&self) {
        let inner = Arc::clone(&self.inner);
        let label = self.label.clone();
        let result = tokio::task::spawn_blocking(move || {
            let taken = match inner.lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            if let Some(session) = taken {
                if let Err(e) = session.disconnect(None, "session closed", None) {
                    debug!("Disconnect from {} reported: {}", label, e);
                }
                info!("SSH session closed: {}", label);
            }
        })
        .await;

        if let Err(e) = result {
            warn!("Close task for {} failed: {}", self.label, e);
        }
    }
}

/// Read stdout and stderr in turn until the remote end sends EOF
///
/// Expects a non-blocking session. Both streams are read in the same loop so
/// neither can fill the channel window while the other is pending.
fn drain_output(channel: &mut Channel, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let mut progressed = read_available(channel, &mut buf, stdout)?;
        progressed |= read_available(&mut channel.stderr(), &mut buf, stderr)?;

        if !progressed {
            if channel.eof() {
                return Ok(());
            }
            std::thread::sleep(DRAIN_IDLE);
        }
    }
}

/// One non-blocking read into `out`; `true` if any bytes arrived
fn read_available(stream: &mut impl Read, buf: &mut [u8], out: &mut Vec<u8>) -> std::io::Result<bool> {
    match stream.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}
