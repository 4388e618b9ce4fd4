pub mod connector;
pub mod core;
pub mod diagnostics;
pub mod locking;
