use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod assessment;
mod clean;
mod columns;
mod config;
mod courses;
mod db;
mod error;
mod merge;
mod models;
mod recalc;
mod report;
mod reshape;
mod roster;
mod sheet;
mod store;
mod writer;

use assessment::AssessmentKind;
use config::Config;
use courses::Course;
use db::PgStore;
use store::CachedStore;
use writer::WriteMode;

#[derive(Parser)]
#[command(name = "dataculture-grades")]
#[command(about = "Grade reconciliation and roster tooling for the digital culture programme", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Derive transfer and exam-credit grades from an exam sheet
    Recalc {
        #[arg(long)]
        input: PathBuf,
        /// Block rows whose competency grade regresses between stages
        #[arg(long)]
        dynamics: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Process a competency test export into retake rows
    External {
        #[arg(long)]
        input: PathBuf,
        /// Only join students of this course, e.g. "Курс 4"
        #[arg(long)]
        course: Option<String>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Write the processed rows to the retake table
        #[arg(long)]
        save: bool,
        /// Skip rows already stored instead of updating them
        #[arg(long, requires = "save")]
        insert_only: bool,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Process a project export and update final grades
    Projects {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        course: Option<String>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Fold project scores into the final grade table
        #[arg(long)]
        save: bool,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Upsert a student roster export
    Students {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Compute course completion percentages
    Courses {
        #[arg(long)]
        cg: PathBuf,
        #[arg(long)]
        python: PathBuf,
        #[arg(long)]
        analysis: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

async fn open_store(config: &Config) -> anyhow::Result<CachedStore<PgStore>> {
    let pool = db::connect(config).await?;
    Ok(CachedStore::new(PgStore::new(pool), config.cache_ttl))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let today = Local::now().date_naive();

    match cli.command {
        Commands::InitDb => {
            let pool = db::connect(&config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Recalc {
            input,
            dynamics,
            out,
        } => {
            let table = sheet::read_table(&input)?;
            let result = recalc::process_grade_recalculation(&table, dynamics)?;
            let out = out.unwrap_or_else(|| {
                let stem = input
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("upload");
                PathBuf::from(recalc::result_file_name(stem, today))
            });
            sheet::write_table(&result, &out, recalc::RESULT_SHEET)?;
            println!("Recalculated {} rows into {}.", result.len(), out.display());
        }
        Commands::External {
            input,
            course,
            out_dir,
            save,
            insert_only,
            report,
        } => {
            let table = sheet::read_table(&input)?;
            let store = open_store(&config).await?;
            let outcome = assessment::run_assessment(
                &store,
                &config,
                &table,
                AssessmentKind::CompetencyTest,
                course.as_deref(),
            )
            .await?;
            for line in &outcome.log {
                println!("{line}");
            }

            let (full, fresh) = assessment::export_outcome(
                &outcome,
                &out_dir,
                today,
                AssessmentKind::CompetencyTest,
            )?;
            println!("Exported {} rows to {}.", outcome.rows.len(), full.display());
            if let Some(fresh) = fresh {
                println!(
                    "Exported {} new rows to {}.",
                    outcome.new_rows.len(),
                    fresh.display()
                );
            }

            if save {
                let mode = if insert_only {
                    WriteMode::Insert
                } else {
                    WriteMode::Upsert
                };
                let written =
                    assessment::save_retakes(&store, &config, &outcome.rows, mode).await?;
                println!(
                    "Saved {} rows to {} ({} already stored).",
                    written.written,
                    assessment::PERESDACHI_TABLE,
                    written.skipped_duplicates
                );
            }

            if let Some(path) = report {
                let markdown = report::build_report("External Assessment", today, &outcome);
                fs::write(&path, markdown)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
                println!("Report written to {}.", path.display());
            }
        }
        Commands::Projects {
            input,
            course,
            out_dir,
            save,
            report,
        } => {
            let table = sheet::read_table(&input)?;
            let store = open_store(&config).await?;
            let outcome = assessment::run_assessment(
                &store,
                &config,
                &table,
                AssessmentKind::Project,
                course.as_deref(),
            )
            .await?;
            for line in &outcome.log {
                println!("{line}");
            }

            let (full, _) =
                assessment::export_outcome(&outcome, &out_dir, today, AssessmentKind::Project)?;
            println!("Exported {} project rows to {}.", outcome.rows.len(), full.display());

            if save {
                let update = assessment::update_final_grades(&store, &config, &outcome.rows).await?;
                println!(
                    "Final grades: {} updated, {} created.",
                    update.updated, update.created
                );
            }

            if let Some(path) = report {
                let markdown = report::build_report("Project Assessment", today, &outcome);
                fs::write(&path, markdown)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
                println!("Report written to {}.", path.display());
            }
        }
        Commands::Students { input, dry_run } => {
            let table = sheet::read_table(&input)?;
            let students = roster::parse_roster(&table, &config.corporate_domain)?;
            if dry_run {
                println!("Parsed {} students (dry run, nothing written).", students.len());
                return Ok(());
            }
            let store = open_store(&config).await?;
            let written = roster::upload_roster(&store, &config, &students).await?;
            println!(
                "Upserted {} students in {} batches.",
                written.written, written.batches
            );
        }
        Commands::Courses {
            cg,
            python,
            analysis,
            dry_run,
        } => {
            let mut results = Vec::new();
            for (course, path) in Course::ALL.into_iter().zip([cg, python, analysis]) {
                let table = sheet::read_table(&path)?;
                let progress =
                    courses::completion_percentages(&table, course, &config.corporate_domain)
                        .with_context(|| format!("failed to process course {course}"))?;
                results.push((course, progress));
            }

            if !dry_run {
                let store = open_store(&config).await?;
                for (course, progress) in &results {
                    courses::upload_progress(&store, &config, *course, progress).await?;
                    info!(course = %course, table = course.table(), "course progress uploaded");
                }
            }

            println!("Course completion:");
            for (course, progress) in &results {
                let summary = courses::summarize(*course, progress);
                println!(
                    "- {}: {} students, mean {:.1}%, {} at 100%, {} at 0%",
                    summary.course,
                    summary.students,
                    summary.mean,
                    summary.complete,
                    summary.not_started
                );
            }
        }
    }

    Ok(())
}
