//! # vcstream Common Library
//!
//! Shared code for the vcstream orchestration service:
//! - Config error type
//! - Bootstrap configuration loading (TOML + environment)
//! - Event types (VcsEvent enum) and the EventBus
//! - Server-Sent Events helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
