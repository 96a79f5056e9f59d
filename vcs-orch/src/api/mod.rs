//! HTTP API handlers for vcs-orch

pub mod conversion_mode;
pub mod convert;
pub mod health;
pub mod singers;
pub mod sse;
pub mod upload;

pub use conversion_mode::conversion_mode_routes;
pub use convert::convert_routes;
pub use health::health_routes;
pub use singers::singer_routes;
pub use sse::{event_routes, event_stream};
pub use upload::upload_routes;
