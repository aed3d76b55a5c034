//! # api-adapters
//!
//! The HTTP surface of the deliberation engine. Request and response bodies, the error mapping
//! and the metrics registry do not depend on a web framework; the axum router lives behind the
//! `web-axum` feature.

pub mod dto;
pub mod error;
#[cfg(feature = "web-axum")]
pub mod http;
pub mod metrics;
pub mod state;

// Re-exporting for easier access
pub use error::{ApiError, ErrorBody};
#[cfg(feature = "web-axum")]
pub use http::router;
pub use metrics::ApiMetrics;
pub use state::AppState;
