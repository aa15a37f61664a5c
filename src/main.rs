use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod aggregate;
mod api;
mod config;
mod db;
mod error;
mod gradebook;
mod models;
mod report;
mod store;
mod sync;

use config::{Settings, StoreBackend};
use gradebook::PgGradebook;
use store::{AverageFilter, AverageStore, MemoryStore, PgAverageStore};

#[derive(Parser)]
#[command(name = "classroom-averages")]
#[command(about = "Classroom grade averages for Group Scholar schools", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "classroom-averages.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import progress records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Recalculate every classroom average and store the result
    Recalculate,
    /// Serve the HTTP API
    Serve {
        /// Overrides the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Generate a markdown report of stored averages for one school
    Report {
        #[arg(long)]
        school_id: Uuid,
        #[arg(long)]
        period: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let database_url = settings.database_url()?;
    PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn build_store(settings: &Settings, pool: &PgPool) -> Arc<dyn AverageStore> {
    match settings.store.backend {
        StoreBackend::Postgres => Arc::new(PgAverageStore::new(pool.clone())),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    }
}

/// The memory store does not outlive a one-shot command.
fn require_persistent_store(settings: &Settings, command: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        settings.store.backend != StoreBackend::Memory,
        "`{command}` needs store.backend = \"postgres\"; the memory backend only lives inside `serve`"
    );
    Ok(())
}

fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    Settings::load(path).with_context(|| format!("failed to load {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli.config)?;
    let pool = connect(&settings).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} progress records from {}.", csv.display());
        }
        Commands::Recalculate => {
            require_persistent_store(&settings, "recalculate")?;
            let gradebook = PgGradebook::new(pool.clone());
            let store = build_store(&settings, &pool);
            let outcome = sync::recalculate(
                &gradebook,
                store.as_ref(),
                settings.store.replace,
                Utc::now(),
            )
            .await?;

            println!("{} (period {}).", outcome.message(), outcome.period);
            if let Some(latest) = outcome.latest_report_date {
                println!("Latest progress report: {latest}.");
            }
            for summary in outcome.summary() {
                println!(
                    "- {}: {:.2} across {} reports from {} students",
                    summary.classroom, summary.average, summary.reports, summary.students
                );
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(settings.server.port);
            let addr = format!("{}:{}", settings.server.host, port);
            let state = Arc::new(api::AppState {
                gradebook: Arc::new(PgGradebook::new(pool.clone())),
                store: build_store(&settings, &pool),
                settings: settings.clone(),
            });

            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!("Starting server on {}", addr);

            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            info!("Server shut down gracefully");
        }
        Commands::Report {
            school_id,
            period,
            out,
        } => {
            if let Some(period) = period.as_deref() {
                anyhow::ensure!(
                    aggregate::is_valid_period(period),
                    "period must be YYYY-MM, got '{period}'"
                );
            }

            require_persistent_store(&settings, "report")?;
            let store = build_store(&settings, &pool);
            let filter = AverageFilter {
                period: period.clone(),
                ..AverageFilter::school(school_id)
            };
            let averages = store.find(&filter).await?;
            let stats = store.school_statistics(school_id, period.as_deref()).await?;
            let report = report::build_report(school_id, period.as_deref(), &averages, &stats);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_report_command() {
        let cli = Cli::try_parse_from([
            "classroom-averages",
            "report",
            "--school-id",
            "7b1c2a9e-0f43-4d55-9a61-0d8a5e3c6f10",
            "--period",
            "2026-02",
        ])
        .unwrap();

        match cli.command {
            Commands::Report { period, out, .. } => {
                assert_eq!(period.as_deref(), Some("2026-02"));
                assert_eq!(out, PathBuf::from("report.md"));
            }
            _ => panic!("expected report command"),
        }
    }

    #[test]
    fn serve_port_is_optional() {
        let cli = Cli::try_parse_from(["classroom-averages", "--config", "x.toml", "serve"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(cli.command, Commands::Serve { port: None }));
    }

    #[test]
    fn one_shot_commands_refuse_the_memory_store() {
        let mut settings = Settings::default();
        assert!(require_persistent_store(&settings, "report").is_ok());

        settings.store.backend = StoreBackend::Memory;
        let err = require_persistent_store(&settings, "recalculate").unwrap_err();
        assert!(err.to_string().contains("recalculate"));
    }
}
