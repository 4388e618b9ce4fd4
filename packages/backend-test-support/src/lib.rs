//! Test support for the tenancy workspace
//!
//! Logging bootstrap, SQLite-backed fixtures, an instrumented pool connector
//! and scripted migrations shared by the integration suites.

pub mod connector;
pub mod fixtures;
pub mod logging;
pub mod problem_details;
pub mod scripted;

pub use connector::CountingConnector;
pub use fixtures::{seed_tenant, TenancyFixture};
pub use scripted::{scripted_catalog, ScriptedMigration};
