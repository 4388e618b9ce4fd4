#![deny(clippy::wildcard_imports)]
#![cfg_attr(test, allow(clippy::wildcard_imports))]

pub mod config;
pub mod error;
pub mod errors;
pub mod extractors;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod trace_ctx;

pub use config::ServerSettings;
pub use error::AppError;
pub use errors::ErrorCode;
pub use extractors::AdminIdentity;
pub use middleware::{RequestTrace, StructuredLogger};
pub use state::AppState;

// Auto-initialize logging for unit tests
#[cfg(test)]
#[ctor::ctor]
fn init_test_logging() {
    backend_test_support::logging::init();
}
