//! vcs-orch library interface
//!
//! Exposes the orchestration core and the HTTP router for integration testing.

pub mod api;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod scheduler;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use vcs_common::config::TomlConfig;
use vcs_common::events::EventBus;

use crate::mode::{ConversionModeController, PlaybackContextSource};
use crate::pipeline::{ConversionRunner, PipelineCoordinator, RemoteLayout};
use crate::registry::{SingerRegistry, TrainingLayout};
use crate::remote::{RemoteError, SessionConnector, SessionLease};
use crate::scheduler::{CompletionWatcher, JobSubmitter};

/// Capacity of the process-wide event bus
const EVENT_BUS_CAPACITY: usize = 256;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<TomlConfig>,
    /// Opens one-shot sessions for requests made while conversion mode is off
    pub connector: Arc<dyn SessionConnector>,
    pub submitter: JobSubmitter,
    pub coordinator: Arc<PipelineCoordinator>,
    pub registry: Arc<SingerRegistry>,
    pub mode: ConversionModeController,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire every component from config
    pub fn new(
        config: TomlConfig,
        connector: Arc<dyn SessionConnector>,
        context_source: Arc<dyn PlaybackContextSource>,
    ) -> Self {
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let submitter = JobSubmitter::from_config(&config.remote);

        let coordinator = Arc::new(PipelineCoordinator::new(
            submitter.clone(),
            CompletionWatcher::from_secs(
                config.pipeline.poll_interval_secs,
                config.pipeline.completion_timeout_secs,
            ),
            RemoteLayout::new(config.remote.base_dir.clone()),
            config.remote.scripts.clone(),
            config.pipeline.output_dir.clone(),
            event_bus.clone(),
        ));

        let registry = Arc::new(SingerRegistry::new(
            &config.registry.path,
            TrainingLayout::from_config(&config.remote),
            event_bus.clone(),
        ));

        let mode = ConversionModeController::new(
            Arc::clone(&coordinator) as Arc<dyn ConversionRunner>,
            context_source,
            Arc::clone(&connector),
            Duration::from_secs(config.mode.poll_interval_secs.max(1)),
            config.mode.watched_collections.iter().cloned(),
            event_bus.clone(),
        );

        Self {
            config: Arc::new(config),
            connector,
            submitter,
            coordinator,
            registry,
            mode,
            event_bus,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// The conversion-mode session if one is open, else a fresh one-shot session
    pub async fn lease_session(&self) -> Result<SessionLease, RemoteError> {
        let shared = self.mode.shared_session().await;
        SessionLease::acquire(shared, self.connector.as_ref()).await
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::convert_routes())
        .merge(api::upload_routes())
        .merge(api::singer_routes())
        .merge(api::conversion_mode_routes())
        .merge(api::event_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
