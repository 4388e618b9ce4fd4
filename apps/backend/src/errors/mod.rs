//! Error codes for the administrative API.

pub mod error_code;

pub use error_code::ErrorCode;
