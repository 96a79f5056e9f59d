//! Job submission
//!
//! Every submission is a single remote command line:
//!
//! ```text
//! cd <run_dir> && source <conda.sh> && conda activate <env> && sbatch [--dependency=afterok:<id>] <script> [args...]
//! ```
//!
//! Submission is fire-and-forget. Ordering between dependent jobs is enforced
//! by the scheduler through `--dependency=afterok`, never by waiting locally.

use crate::remote::{shell_quote, RemoteError, RemoteSession};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, info};
use vcs_common::config::RemoteConfig;

/// Acknowledgment prefix printed by `sbatch` on success
const SUBMITTED_PREFIX: &str = "Submitted batch job";

/// Scheduler-assigned job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to enqueue: a batch script from the run directory plus its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub script: String,
    pub args: Vec<String>,
}

impl JobSpec {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// A submitted job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub command: String,
    pub depends_on: Option<JobId>,
    pub job_id: JobId,
}

/// Submission failures
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The command line could not be run at all
    #[error("Submission command failed: {0}")]
    Exec(#[from] RemoteError),

    /// The scheduler (or the shell before it) wrote a non-informational diagnostic
    #[error("Scheduler rejected job: {stderr}")]
    Rejected { stderr: String },

    /// No `Submitted batch job <id>` acknowledgment on stdout
    #[error("Unrecognized scheduler acknowledgment: {stdout:?}")]
    Unparsable { stdout: String },
}

/// Extract the job id from an `sbatch` acknowledgment
///
/// Looks for `Submitted batch job <integer>` anywhere in the text.
pub fn parse_job_id(stdout: &str) -> Option<JobId> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(SUBMITTED_PREFIX)?;
        let digits = rest.trim();
        let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u64>().ok().map(JobId)
    })
}

/// Builds and submits scheduler commands
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    run_dir: String,
    conda_sh: String,
    conda_env: String,
    informational_stderr: Vec<String>,
}

impl JobSubmitter {
    pub fn new(
        run_dir: impl Into<String>,
        conda_sh: impl Into<String>,
        conda_env: impl Into<String>,
        informational_stderr: Vec<String>,
    ) -> Self {
        Self {
            run_dir: run_dir.into(),
            conda_sh: conda_sh.into(),
            conda_env: conda_env.into(),
            informational_stderr,
        }
    }

    pub fn from_config(remote: &RemoteConfig) -> Self {
        Self::new(
            remote.run_dir.clone(),
            remote.conda_sh.clone(),
            remote.conda_env.clone(),
            remote.informational_stderr.clone(),
        )
    }

    /// Full remote command line for `spec`
    pub fn build_command(&self, spec: &JobSpec, depends_on: Option<JobId>) -> String {
        let mut sbatch = String::from("sbatch");
        if let Some(parent) = depends_on {
            sbatch.push_str(&format!(" --dependency=afterok:{}", parent));
        }
        sbatch.push(' ');
        sbatch.push_str(&shell_quote(&format!("{}/{}", self.run_dir, spec.script)));
        for arg in &spec.args {
            sbatch.push(' ');
            sbatch.push_str(&shell_quote(arg));
        }

        format!(
            "cd {} && source {} && conda activate {} && {}",
            shell_quote(&self.run_dir),
            shell_quote(&self.conda_sh),
            shell_quote(&self.conda_env),
            sbatch
        )
    }

    /// True if every non-empty stderr line is an allow-listed advisory
    fn is_informational(&self, stderr: &str) -> bool {
        stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .all(|line| {
                self.informational_stderr
                    .iter()
                    .any(|allowed| line.contains(allowed.as_str()))
            })
    }

    /// Enqueue `spec`, optionally after `depends_on` succeeds
    pub async fn submit(
        &self,
        session: &dyn RemoteSession,
        spec: &JobSpec,
        depends_on: Option<JobId>,
    ) -> Result<Job, SubmissionError> {
        let command = self.build_command(spec, depends_on);
        info!(script = %spec.script, depends_on = ?depends_on.map(|j| j.0), "Submitting batch job");

        let output = session.execute(&command).await?;
        let stdout = output.stdout.trim();
        let stderr = output.stderr.trim();

        if !stderr.is_empty() {
            if self.is_informational(stderr) {
                info!(script = %spec.script, "Scheduler advisory: {}", stderr);
            } else {
                error!(script = %spec.script, "Scheduler submission error: {}", stderr);
                return Err(SubmissionError::Rejected {
                    stderr: stderr.to_string(),
                });
            }
        }

        let job_id = parse_job_id(stdout).ok_or_else(|| SubmissionError::Unparsable {
            stdout: stdout.to_string(),
        })?;
        info!(script = %spec.script, job_id = %job_id, "Batch job submitted");

        Ok(Job {
            command,
            depends_on,
            job_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitter() -> JobSubmitter {
        JobSubmitter::new(
            "/data/vcstream/run",
            "/opt/conda/etc/profile.d/conda.sh",
            "rvc",
            vec!["AURORA: Job submitted".to_string()],
        )
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("Submitted batch job 4821"), Some(JobId(4821)));
        assert_eq!(parse_job_id("Submitted batch job 4821\n"), Some(JobId(4821)));
        assert_eq!(
            parse_job_id("sbatch: info\nSubmitted batch job 77 on cluster gpu"),
            Some(JobId(77))
        );
    }

    #[test]
    fn test_parse_job_id_absent() {
        assert_eq!(parse_job_id(""), None);
        assert_eq!(parse_job_id("sbatch: error: invalid partition"), None);
        assert_eq!(parse_job_id("Submitted batch job"), None);
        assert_eq!(parse_job_id("Submitted batch job abc"), None);
    }

    #[test]
    fn test_build_command_without_dependency() {
        let cmd = submitter().build_command(&JobSpec::new("separate.sh"), None);
        assert_eq!(
            cmd,
            "cd /data/vcstream/run && source /opt/conda/etc/profile.d/conda.sh && conda activate rvc && sbatch /data/vcstream/run/separate.sh"
        );
    }

    #[test]
    fn test_build_command_with_dependency_and_args() {
        let spec = JobSpec::new("batch_infer.sh").arg("new jeans");
        let cmd = submitter().build_command(&spec, Some(JobId(4821)));
        assert!(cmd.ends_with(
            "sbatch --dependency=afterok:4821 /data/vcstream/run/batch_infer.sh 'new jeans'"
        ));
    }

    #[test]
    fn test_informational_allow_list() {
        let s = submitter();
        assert!(s.is_informational("sbatch: AURORA: Job submitted"));
        assert!(!s.is_informational("sbatch: error: Batch job submission failed"));
        assert!(!s.is_informational(
            "sbatch: AURORA: Job submitted\nsbatch: error: QOSMaxJobsPerUserLimit"
        ));
    }
}
