use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use backend::middleware::{RequestTrace, StructuredLogger};
use backend::{routes, AppState, ServerSettings};
use db_infra::{build_tenancy, CloseOutcome, DatabaseSettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod telemetry;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    telemetry::init_tracing();

    // Environment variables must be set by the runtime environment
    // (docker env_file, or `set -a; . ./.env; set +a` locally).
    let server = match ServerSettings::from_env() {
        Ok(server) => server,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };
    let settings = match DatabaseSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    let core = match build_tenancy(settings).build().await {
        Ok(core) => Arc::new(core),
        Err(e) => {
            eprintln!("❌ Failed to bootstrap tenancy core: {e}");
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    let background = core.spawn_background(token.clone());

    let data = web::Data::new(AppState::new(Arc::clone(&core)));
    info!(host = %server.host, port = server.port, "server=starting");

    // actix stops accepting on SIGINT/SIGTERM and lets in-flight requests finish
    let result = HttpServer::new(move || {
        App::new()
            .wrap(StructuredLogger)
            .wrap(RequestTrace)
            .app_data(data.clone())
            .configure(routes::configure)
    })
    .bind((server.host.as_str(), server.port))?
    .run()
    .await;

    token.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    let outcomes = core.shutdown().await;
    let forced = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, CloseOutcome::ForcedTermination { .. }))
        .count();
    info!(pools = outcomes.len(), forced, "server=stopped");

    result
}
