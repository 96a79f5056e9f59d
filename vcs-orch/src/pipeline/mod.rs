//! Conversion pipeline
//!
//! separate → infer → combine → (await combined artifact, download) → cleanup

pub mod coordinator;
pub mod layout;

pub use coordinator::{
    ConversionRunner, PipelineCoordinator, PipelineError, PipelineRun, SourceTrack, Stage,
};
pub use layout::{sanitize_name, RemoteLayout, RemotePaths};
