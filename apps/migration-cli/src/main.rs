use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand, ValueEnum};
use db_infra::{build_tenancy, DatabaseSettings, DbInfraError, DbKind, TenancyCore, TenantStatus};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Db {
    Postgres,
    SqliteFile,
}

impl Db {
    fn as_env(self) -> &'static str {
        match self {
            Db::Postgres => "postgres",
            Db::SqliteFile => "sqlite-file",
        }
    }
}

#[derive(Parser)]
#[command(name = "tenant-migrate")]
#[command(about = "Tenant registry and schema migration tool")]
struct Args {
    /// Overrides ERP_DB_KIND
    #[arg(short, long, value_enum, global = true)]
    db: Option<Db>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Applied and pending migrations for one tenant (code or id)
    Status { tenant: String },
    /// Apply pending migrations to one tenant
    Run { tenant: String },
    /// Apply pending migrations to every tenant with the given status (or ALL)
    RunAll {
        #[arg(long, default_value = "ACTIVE")]
        status: String,
    },
    /// Apply the shared-store catalog
    SyncShared,
    /// Register a tenant in PROVISIONING
    Register { code: String, display_name: String },
    /// Move a tenant to another lifecycle status
    Transition { tenant: String, status: String },
    /// List tenants, optionally filtered by status
    Tenants {
        #[arg(long)]
        status: Option<String>,
    },
    /// Registry and shared-store statistics
    Stats,
}

/// `Partial` output is printed but still exits non-zero.
enum Outcome {
    Complete(Value),
    Partial(Value),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the JSON report; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("db_infra=info,sqlx=warn")),
        )
        .init();

    let args = Args::parse();

    let settings = match DatabaseSettings::from_lookup(|name| match (name, args.db) {
        ("ERP_DB_KIND", Some(db)) => Some(db.as_env().to_string()),
        _ => std::env::var(name).ok(),
    }) {
        Ok(settings) => settings,
        Err(e) => return report_error(&e),
    };

    if settings.db_kind == DbKind::SqliteMemory {
        eprintln!("❌ SQLite in-memory stores are not supported for CLI operations.");
        eprintln!("Every invocation would start from an empty store and discard it on exit.");
        eprintln!("Use --db postgres or --db sqlite-file.");
        return ExitCode::from(2);
    }

    match execute(settings, args.command).await {
        Ok(Outcome::Complete(report)) => {
            print_json(&report);
            ExitCode::SUCCESS
        }
        Ok(Outcome::Partial(report)) => {
            print_json(&report);
            ExitCode::FAILURE
        }
        Err(e) => report_error(&e),
    }
}

async fn execute(mut settings: DatabaseSettings, command: Command) -> Result<Outcome, DbInfraError> {
    // sync-shared reports what it applied, so bootstrap must not apply it first
    if matches!(command, Command::SyncShared) {
        settings.sync_shared_on_startup = false;
    }
    info!(db_kind = ?settings.db_kind, shared_db = %settings.shared_db, "cli=start");
    let core = build_tenancy(settings).build().await?;
    let result = dispatch(&core, command).await;
    core.shutdown().await;
    result
}

async fn dispatch(core: &TenancyCore, command: Command) -> Result<Outcome, DbInfraError> {
    let registry = core.registry();
    match command {
        Command::Status { tenant } => {
            let tenant = registry.resolve(&tenant).await?;
            complete(&core.migrations().status(tenant.id).await?)
        }
        Command::Run { tenant } => {
            let tenant = registry.resolve(&tenant).await?;
            complete(&core.migrations().run(tenant.id).await?)
        }
        Command::RunAll { status } => {
            let filter = status_filter(Some(&status))?;
            let results = core.migrations().run_all(filter).await?;
            let failed = results.values().filter(|r| !r.is_success()).count();
            let report = json!({
                "succeeded": results.len() - failed,
                "failed": failed,
                "results": to_value(&results)?,
            });
            Ok(if failed == 0 {
                Outcome::Complete(report)
            } else {
                Outcome::Partial(report)
            })
        }
        Command::SyncShared => complete(&core.shared_sync().synchronize().await?),
        Command::Register { code, display_name } => {
            complete(&registry.register(&code, &display_name).await?)
        }
        Command::Transition { tenant, status } => {
            let next = parse_status(&status)?;
            let tenant = registry.resolve(&tenant).await?;
            complete(&registry.transition_status(tenant.id, next).await?)
        }
        Command::Tenants { status } => {
            let filter = status_filter(status.as_deref())?;
            complete(&registry.list(filter).await?)
        }
        Command::Stats => complete(&core.stats().snapshot().await),
    }
}

fn status_filter(raw: Option<&str>) -> Result<Option<TenantStatus>, DbInfraError> {
    match raw {
        None => Ok(None),
        Some(all) if all.eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => parse_status(value).map(Some),
    }
}

fn parse_status(raw: &str) -> Result<TenantStatus, DbInfraError> {
    TenantStatus::from_str(raw).map_err(DbInfraError::config)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, DbInfraError> {
    serde_json::to_value(value).map_err(|e| DbInfraError::config(format!("unserializable report: {e}")))
}

fn complete<T: serde::Serialize>(value: &T) -> Result<Outcome, DbInfraError> {
    to_value(value).map(Outcome::Complete)
}

fn print_json(value: &Value) {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{text}");
}

fn report_error(e: &DbInfraError) -> ExitCode {
    let body = json!({
        "error": e.code(),
        "message": e.to_string(),
        "migration": e.migration(),
    });
    eprintln!("{body}");
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn run_all_defaults_to_active() {
        let args = Args::try_parse_from(["tenant-migrate", "run-all"]).unwrap();
        match args.command {
            Command::RunAll { status } => {
                assert_eq!(status_filter(Some(&status)).unwrap(), Some(TenantStatus::Active));
            }
            _ => panic!("expected run-all"),
        }
        assert_eq!(status_filter(Some("all")).unwrap(), None);
        assert!(status_filter(Some("dormant")).is_err());
    }

    #[test]
    fn db_flag_is_global() {
        let args =
            Args::try_parse_from(["tenant-migrate", "status", "ACME", "--db", "sqlite-file"])
                .unwrap();
        assert!(matches!(args.db, Some(Db::SqliteFile)));
    }
}
