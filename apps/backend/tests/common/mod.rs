#![allow(dead_code)]

use std::sync::Arc;

use actix_web::web;
use backend::AppState;
use db_infra::TenancyCore;

// Logging is auto-installed for every test binary
#[ctor::ctor]
fn init_logging() {
    backend_test_support::logging::init();
}

pub const ADMIN: (&str, &str) = ("x-admin-subject", "ops@example.com");

pub fn app_state(core: TenancyCore) -> (Arc<TenancyCore>, web::Data<AppState>) {
    let core = Arc::new(core);
    let data = web::Data::new(AppState::new(Arc::clone(&core)));
    (core, data)
}

/// The production middleware stack and routes around `data`.
macro_rules! admin_app {
    ($data:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .wrap(backend::StructuredLogger)
                .wrap(backend::RequestTrace)
                .app_data($data.clone())
                .configure(backend::routes::configure),
        )
        .await
    };
}
