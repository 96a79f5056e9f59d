//! Conversion mode
//!
//! # State machine
//! ```text
//! Idle --enable--> Active --(watched track found, one run finished)--> Idle
//!                  Active --disable--> Idle
//! ```
//!
//! While active, one background task polls the playback context. The first
//! time the listener plays something from a watched collection, the task runs
//! the pipeline once for that track and the mode turns itself off.
//!
//! # Ownership
//! The shared session is opened by `enable`. Mode state, the loop it spawned
//! and every request leasing it each hold one `SharedSession` handle, and the
//! last handle released closes the connection. A loop only resets mode state
//! if its generation is still current, so a stale loop can never clobber a
//! newer `enable`. `disable` starts a new generation.
//!
//! The state lock is never held across the connect; `enable` marks the mode
//! as starting instead.

use crate::mode::context::PlaybackContextSource;
use crate::pipeline::{ConversionRunner, SourceTrack};
use crate::remote::{RemoteError, SessionConnector, SharedSession};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vcs_common::events::{EventBus, VcsEvent};

/// Snapshot returned by `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeStatus {
    pub active: bool,
    pub singer: Option<String>,
    pub loop_running: bool,
    /// `enable` is still connecting
    pub starting: bool,
}

struct PollingHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PollingHandle {
    fn is_live(&self) -> bool {
        !self.join.is_finished()
    }
}

#[derive(Default)]
struct ModeState {
    active: bool,
    singer: Option<String>,
    generation: u64,
    polling: Option<PollingHandle>,
    session: Option<Arc<SharedSession>>,
}

struct Inner {
    state: Mutex<ModeState>,
    starting: AtomicBool,
    runner: Arc<dyn ConversionRunner>,
    context_source: Arc<dyn PlaybackContextSource>,
    connector: Arc<dyn SessionConnector>,
    poll_interval: Duration,
    watched: HashSet<String>,
    event_bus: EventBus,
}

/// Everything one polling loop needs, moved into its task
struct LoopContext {
    session: Arc<SharedSession>,
    access_token: String,
    singer: String,
    cancel: CancellationToken,
    generation: u64,
}

/// Owns conversion-mode state and its polling task
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversionModeController {
    inner: Arc<Inner>,
}

impl ConversionModeController {
    pub fn new(
        runner: Arc<dyn ConversionRunner>,
        context_source: Arc<dyn PlaybackContextSource>,
        connector: Arc<dyn SessionConnector>,
        poll_interval: Duration,
        watched_collections: impl IntoIterator<Item = String>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ModeState::default()),
                starting: AtomicBool::new(false),
                runner,
                context_source,
                connector,
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                watched: watched_collections.into_iter().collect(),
                event_bus,
            }),
        }
    }

    /// Switch to `Active` and start polling
    ///
    /// Returns `Ok(false)` without side effects if a polling loop is already
    /// live or another `enable` is still connecting, and also if `disable` was
    /// called while this one was connecting. Fails if the shared session cannot
    /// be opened; state is left idle.
    pub async fn enable(&self, access_token: &str, singer: &str) -> Result<bool, RemoteError> {
        let (_starting, attempt) = {
            let state = self.inner.state.lock().await;
            if state.polling.as_ref().is_some_and(PollingHandle::is_live) {
                debug!("Conversion mode already running; enable ignored");
                return Ok(false);
            }
            if self.inner.starting.swap(true, Ordering::SeqCst) {
                debug!("Conversion mode already starting; enable ignored");
                return Ok(false);
            }
            (StartingMarker(&self.inner.starting), state.generation)
        };

        if self.inner.watched.is_empty() {
            warn!("No watched collections configured; conversion mode will never trigger");
        }

        let session = SharedSession::new(self.inner.connector.open().await?);

        let mut state = self.inner.state.lock().await;
        if state.generation != attempt {
            drop(state);
            info!("Conversion mode disabled while connecting; enable abandoned");
            session.release().await;
            return Ok(false);
        }

        state.generation += 1;
        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            session: Arc::clone(&session),
            access_token: access_token.to_string(),
            singer: singer.to_string(),
            cancel: cancel.clone(),
            generation: state.generation,
        };

        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move { inner.poll_loop(ctx).await });

        state.active = true;
        state.singer = Some(singer.to_string());
        state.session = Some(session);
        state.polling = Some(PollingHandle { cancel, join });

        info!(singer = %singer, generation = state.generation, "Conversion mode enabled");
        self.inner.event_bus.emit_lossy(VcsEvent::ConversionModeChanged {
            active: true,
            singer: Some(singer.to_string()),
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Switch to `Idle`
    ///
    /// Returns `true` if the mode was active. Safe to call at any time.
    /// The shared session stays open until its loop and every lease on it
    /// have let go.
    pub async fn disable(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        let was_active = state.active;

        if let Some(handle) = state.polling.take() {
            handle.cancel.cancel();
        }

        state.generation += 1;
        state.active = false;
        state.singer = None;
        let session = state.session.take();
        drop(state);

        if let Some(session) = session {
            session.release().await;
        }

        if was_active {
            info!("Conversion mode disabled");
            self.inner.event_bus.emit_lossy(VcsEvent::ConversionModeChanged {
                active: false,
                singer: None,
                timestamp: Utc::now(),
            });
        }
        was_active
    }

    pub async fn status(&self) -> ModeStatus {
        let state = self.inner.state.lock().await;
        ModeStatus {
            active: state.active,
            singer: state.singer.clone(),
            loop_running: state.polling.as_ref().is_some_and(PollingHandle::is_live),
            starting: self.inner.starting.load(Ordering::SeqCst),
        }
    }

    /// A handle on the session held open while the mode is active
    ///
    /// Callers must `release` the handle when done.
    pub async fn shared_session(&self) -> Option<Arc<SharedSession>> {
        let state = self.inner.state.lock().await;
        if state.active {
            state.session.clone()
        } else {
            None
        }
    }
}

impl Inner {
    async fn poll_loop(self: Arc<Self>, ctx: LoopContext) {
        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let lookup = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                lookup = self.context_source.current_context(&ctx.access_token) => lookup,
            };

            let playing = match lookup {
                Ok(Some(playing)) => playing,
                Ok(None) => {
                    debug!("Nothing playing");
                    continue;
                }
                Err(e) => {
                    warn!("Playback context lookup failed: {}", e);
                    continue;
                }
            };

            if !self.watched.contains(&playing.collection_id) || playing.track_name.trim().is_empty() {
                debug!(collection = %playing.collection_id, "Playing from an unwatched collection");
                continue;
            }

            if ctx.cancel.is_cancelled() {
                break;
            }

            info!(
                track = %playing.track_name,
                collection = %playing.collection_id,
                singer = %ctx.singer,
                "Watched collection detected, converting current track"
            );
            let source = SourceTrack::Staged(playing.track_name);
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    info!("Conversion mode cancelled during pipeline run");
                }
                result = self.runner.run(ctx.session.session(), source, &ctx.singer) => match result {
                    Ok(path) => info!("Conversion mode run finished: {}", path.display()),
                    Err(e) => error!("Conversion mode run failed: {}", e),
                },
            }
            break;
        }

        self.finish(ctx.generation, ctx.session).await;
    }

    async fn finish(&self, generation: u64, session: Arc<SharedSession>) {
        let mut state = self.state.lock().await;
        let current = state.generation == generation;
        let reset = current && state.active;
        let mut held = None;
        if current {
            state.active = false;
            state.singer = None;
            held = state.session.take();
            state.polling = None;
        }
        drop(state);

        if let Some(held) = held {
            held.release().await;
        }
        session.release().await;

        if reset {
            info!(generation, "Conversion mode returned to idle");
            self.event_bus.emit_lossy(VcsEvent::ConversionModeChanged {
                active: false,
                singer: None,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Clears `Inner::starting` when `enable` returns or is dropped mid-connect
struct StartingMarker<'a>(&'a AtomicBool);

impl Drop for StartingMarker<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
