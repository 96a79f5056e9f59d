//! Playback-triggered conversion mode

pub mod context;
pub mod controller;

pub use context::{ContextError, PlaybackContext, PlaybackContextSource, SpotifyContextSource};
pub use controller::{ConversionModeController, ModeStatus};
