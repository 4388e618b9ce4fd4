use std::sync::Arc;

use db_infra::TenancyCore;

/// Shared handler state: the tenancy core, built once at start-up.
#[derive(Clone)]
pub struct AppState {
    core: Arc<TenancyCore>,
}

impl AppState {
    pub fn new(core: Arc<TenancyCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &TenancyCore {
        &self.core
    }
}
