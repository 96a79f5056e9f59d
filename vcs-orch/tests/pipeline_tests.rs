//! Pipeline coordinator integration tests
//!
//! Drives `PipelineCoordinator` against `MockSession` with paused tokio time.

mod helpers;

use helpers::{test_config, MockSession};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vcs_common::config::TomlConfig;
use vcs_common::events::{EventBus, VcsEvent};
use vcs_orch::pipeline::{
    PipelineCoordinator, PipelineError, RemoteLayout, SourceTrack, Stage,
};
use vcs_orch::remote::{RemoteError, RemoteSession};
use vcs_orch::scheduler::{CompletionWatcher, JobId, JobSubmitter};

const COMBINED: &str = "/r/combined/iu_ditto.wav";

fn coordinator(config: &TomlConfig, watcher: CompletionWatcher, bus: EventBus) -> PipelineCoordinator {
    PipelineCoordinator::new(
        JobSubmitter::from_config(&config.remote),
        watcher,
        RemoteLayout::new(config.remote.base_dir.clone()),
        config.remote.scripts.clone(),
        config.pipeline.output_dir.clone(),
        bus,
    )
}

fn unbounded() -> CompletionWatcher {
    CompletionWatcher::new(Duration::from_secs(5), None)
}

/// Value of `--dependency=afterok:<id>` in a submission, if any
fn dependency_of(command: &str) -> Option<u64> {
    let rest = command.split("--dependency=afterok:").nth(1)?;
    rest.split_whitespace().next()?.parse().ok()
}

#[tokio::test(start_paused = true)]
async fn test_successful_run_chains_four_jobs() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let coordinator = coordinator(&config, unbounded(), bus);

    let session = MockSession::new();
    session.artifact_after(COMBINED, 2);

    let (path, run) = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await
        .unwrap();

    let sbatch = session.sbatch_commands();
    assert_eq!(sbatch.len(), 4, "separate, infer, combine, cleanup: {:?}", sbatch);
    assert!(sbatch[0].contains("/run/separate.sh"));
    assert!(sbatch[1].contains("/run/batch_infer.sh iu"));
    assert!(sbatch[2].contains("/run/combine.sh iu"));
    assert!(sbatch[3].contains("/run/cleanup.sh"));

    // Each stage depends on the job submitted just before it
    assert_eq!(dependency_of(&sbatch[0]), None);
    assert_eq!(dependency_of(&sbatch[1]), Some(1));
    assert_eq!(dependency_of(&sbatch[2]), Some(2));
    assert_eq!(dependency_of(&sbatch[3]), Some(3));

    assert_eq!(
        run.stage_jobs,
        vec![
            (Stage::Separate, JobId(1)),
            (Stage::Infer, JobId(2)),
            (Stage::Combine, JobId(3)),
            (Stage::Cleanup, JobId(4)),
        ]
    );

    assert_eq!(session.checks_for(COMBINED), 3);
    assert_eq!(path, config.pipeline.output_dir.join("iu_ditto.wav"));
    assert_eq!(std::fs::read(&path).unwrap(), helpers::DOWNLOAD_PAYLOAD);

    let downloads = session.downloads();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].remote, COMBINED);
    assert!(downloads[0].deleted.is_empty(), "staged input must be kept");
    assert!(session.uploads().is_empty());

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.event_type().to_string());
    }
    assert_eq!(kinds.first().map(String::as_str), Some("PipelineStarted"));
    assert!(kinds.contains(&"PipelineCompleted".to_string()));
    assert_eq!(kinds.iter().filter(|k| *k == "StageSubmitted").count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_local_source_is_uploaded_and_removed_after_download() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let coordinator = coordinator(&config, unbounded(), EventBus::new(16));

    let local = dir.path().join("ditto.wav");
    std::fs::write(&local, b"RIFF").unwrap();

    let session = MockSession::new();
    session.artifact_present(COMBINED);

    coordinator
        .run_detailed(session.as_ref(), SourceTrack::Local(local.clone()), "iu")
        .await
        .unwrap();

    assert_eq!(session.uploads(), vec![(local, "/r/input/ditto.wav".to_string())]);
    let downloads = session.downloads();
    assert_eq!(downloads[0].deleted, vec!["/r/input/ditto.wav".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_submission_failure_aborts_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let coordinator = coordinator(&config, unbounded(), bus);

    let session = MockSession::new();
    session.reject_script("batch_infer.sh", "sbatch: error: invalid partition specified");

    let err = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await
        .unwrap_err();

    match err {
        PipelineError::Submission { stage, .. } => assert_eq!(stage, "infer"),
        other => panic!("unexpected error: {other}"),
    }

    // Nothing after the rejected stage is attempted
    assert_eq!(session.sbatch_commands().len(), 2);
    assert_eq!(session.checks_for(COMBINED), 0);
    assert!(session.downloads().is_empty());

    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        if let VcsEvent::PipelineFailed { error, .. } = event {
            assert!(error.contains("invalid partition"));
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn test_informational_stderr_is_not_a_failure() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let coordinator = coordinator(&config, unbounded(), EventBus::new(16));

    let session = MockSession::new();
    session.sbatch_stderr("sbatch: AURORA: Job submitted");
    session.artifact_present(COMBINED);

    let result = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await;
    assert!(result.is_ok(), "{:?}", result.err());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_is_ignored() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let coordinator = coordinator(&config, unbounded(), EventBus::new(16));

    let session = MockSession::new();
    session.artifact_present(COMBINED);
    session.reject_script("cleanup.sh", "sbatch: error: QOSMaxSubmitJobPerUserLimit");

    let (path, run) = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await
        .unwrap();

    assert!(path.exists());
    assert_eq!(run.stage_jobs.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_when_artifact_never_appears() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let watcher = CompletionWatcher::new(Duration::from_secs(5), Some(Duration::from_secs(12)));
    let coordinator = coordinator(&config, watcher, EventBus::new(16));

    let session = MockSession::new();

    let err = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Timeout(_)), "{err}");
    assert!(session.downloads().is_empty());
    // Cleanup is only submitted after a successful download
    assert_eq!(session.sbatch_commands().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_session_closed_during_wait_fails_without_waiting_out_deadline() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let watcher = CompletionWatcher::new(Duration::from_secs(5), Some(Duration::from_secs(7200)));
    let coordinator = Arc::new(coordinator(&config, watcher, EventBus::new(16)));

    let session = MockSession::new();
    session.reject_after_close();
    let run = {
        let coordinator = Arc::clone(&coordinator);
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            coordinator
                .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
                .await
        })
    };

    while session.checks_for(COMBINED) == 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let started = tokio::time::Instant::now();
    RemoteSession::close(session.as_ref()).await;

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Remote(RemoteError::Closed)), "{err}");
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert!(session.downloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_run_for_same_pair_is_refused() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let coordinator = Arc::new(coordinator(&config, unbounded(), EventBus::new(16)));

    let first_session = MockSession::new();
    let first = {
        let coordinator = Arc::clone(&coordinator);
        let session = Arc::clone(&first_session);
        tokio::spawn(async move {
            coordinator
                .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
                .await
        })
    };

    while first_session.checks_for(COMBINED) == 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let second_session = MockSession::new();
    let err = coordinator
        .run_detailed(second_session.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning { .. }));
    assert!(second_session.commands().is_empty());

    // A different track is independent
    second_session.artifact_present("/r/combined/iu_hype_boy.wav");
    coordinator
        .run_detailed(second_session.as_ref(), SourceTrack::Staged("hype boy".to_string()), "iu")
        .await
        .unwrap();

    // Once the first run finishes the pair can be converted again
    first_session.artifact_present(COMBINED);
    first.await.unwrap().unwrap();
    let third = MockSession::new();
    third.artifact_present(COMBINED);
    coordinator
        .run_detailed(third.as_ref(), SourceTrack::Staged("ditto".to_string()), "iu")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let coordinator = coordinator(&config, unbounded(), EventBus::new(16));
    let session = MockSession::new();

    let err = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("ditto".to_string()), "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));

    let err = coordinator
        .run_detailed(session.as_ref(), SourceTrack::Staged("..".to_string()), "iu")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert!(session.commands().is_empty());
}
