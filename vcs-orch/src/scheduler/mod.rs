//! Batch scheduler interaction
//!
//! - `submitter`: enqueue jobs with `sbatch`, chained by after-success dependencies
//! - `watcher`: infer completion from the presence of a marker artifact

pub mod submitter;
pub mod watcher;

pub use submitter::{parse_job_id, Job, JobId, JobSpec, JobSubmitter, SubmissionError};
pub use watcher::{artifact_exists, CompletionWatcher, WatchError};
