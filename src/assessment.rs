//! External assessment processing: wide test exports and project exports are
//! melted, joined with the roster, overlaid with stored grades and written to
//! the retake and final-grade tables.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::clean::{clean_email_column, clean_string_column, filter_valid_grades, normalize_email};
use crate::columns::{COL_DISCIPLINE, COL_EMAIL, COL_FIO, COL_GRADE};
use crate::config::Config;
use crate::error::PipelineError;
use crate::merge::{apply_priority, dedupe_rows, new_records, GradeSource};
use crate::models::{rows_to_table, AssessmentRow, Cell, GradeObservation, StudentRecord, Table};
use crate::reshape::{into_observations, melt_stages, project_maximum};
use crate::roster::{index_by_email, load_roster};
use crate::sheet::write_table;
use crate::store::{fetch_all, Query, Record, Store, StoreError};
use crate::writer::{WriteError, WriteMode, WriteReport, Writer};

pub const STUDENT_IO_TABLE: &str = "student_io";
pub const PERESDACHI_TABLE: &str = "peresdachi";
pub const FINAL_GRADES_TABLE: &str = "final_grades";
pub const RETAKE_KEY: [&str; 2] = [COL_EMAIL, COL_DISCIPLINE];

const COL_TEST_SCORE: &str = "Оценка за тест";
const COL_PROJECT_SCORE: &str = "Оценка за проект";
const COL_FINAL_SCORE: &str = "Итоговая оценка";
const COL_SURNAME: &str = "Фамилия";
const COL_NAME: &str = "Имя";

const EXPORT_SHEET: &str = "Пересдачи";
const PROJECT_SHEET: &str = "Проекты";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentKind {
    /// Three competency test stages per student.
    CompetencyTest,
    /// Best project category score, credited to the final stage.
    Project,
}

/// The processed result handed back to the caller.
#[derive(Debug, Clone, Default)]
pub struct AssessmentOutcome {
    pub rows: Vec<AssessmentRow>,
    /// Rows whose key the retake table did not hold when processing started.
    pub new_rows: Vec<AssessmentRow>,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalGradeUpdate {
    pub updated: usize,
    pub created: usize,
}

/// Melts a wide competency-test export and overlays the stored grades.
pub fn process_external_assessment(
    grades: &Table,
    roster: &[StudentRecord],
    sources: &[GradeSource],
) -> Result<(Vec<AssessmentRow>, Vec<String>), PipelineError> {
    let long = melt_stages(grades)?;
    Ok(assemble(long, roster, sources))
}

/// Same pipeline for project exports: one best score per student.
pub fn process_project_assessment(
    grades: &Table,
    roster: &[StudentRecord],
    sources: &[GradeSource],
) -> Result<(Vec<AssessmentRow>, Vec<String>), PipelineError> {
    let long = project_maximum(grades)?;
    Ok(assemble(long, roster, sources))
}

fn assemble(
    mut long: Table,
    roster: &[StudentRecord],
    sources: &[GradeSource],
) -> (Vec<AssessmentRow>, Vec<String>) {
    let mut log = Vec::new();

    clean_email_column(&mut long, COL_EMAIL);
    let dropped = filter_valid_grades(&mut long, COL_GRADE);
    if dropped > 0 {
        warn!(dropped, "dropped uploaded rows with blank grades");
        log.push(format!("Dropped {dropped} uploaded rows with blank grades."));
    }

    let students = index_by_email(roster);
    let mut unmatched = 0;
    let rows: Vec<AssessmentRow> = into_observations(&long)
        .into_iter()
        .map(|obs| {
            let student = students.get(&obs.email).copied();
            if student.is_none() {
                unmatched += 1;
            }
            AssessmentRow::from_observation(obs, student)
        })
        .collect();
    if unmatched > 0 {
        log.push(format!("{unmatched} rows have no matching student in the roster."));
    }

    let (rows, duplicates) = dedupe_rows(rows);
    if duplicates > 0 {
        log.push(format!("Collapsed {duplicates} duplicate (email, discipline) rows."));
    }

    let rows = apply_priority(rows, sources, &mut log);
    info!(rows = rows.len(), "assessment rows ready");
    (rows, log)
}

/// Reads an external grade table as cleaned observations.
pub async fn load_grade_table(
    store: &dyn Store,
    config: &Config,
    table: &str,
) -> Result<Vec<GradeObservation>, StoreError> {
    let query = Query::table(table).select(&[COL_EMAIL, COL_DISCIPLINE, COL_GRADE]);
    let records = fetch_all(store, &query, config.read_page_size).await?;

    let mut grades = Table::new([COL_EMAIL, COL_DISCIPLINE, COL_GRADE]);
    for record in &records {
        grades.push_row(
            [COL_EMAIL, COL_DISCIPLINE, COL_GRADE]
                .iter()
                .map(|c| record.get(*c).map(Cell::from_json).unwrap_or_default())
                .collect(),
        );
    }
    clean_email_column(&mut grades, COL_EMAIL);
    clean_string_column(&mut grades, COL_DISCIPLINE);
    clean_string_column(&mut grades, COL_GRADE);
    Ok(into_observations(&grades))
}

/// Loads the roster and both grade tables, then runs the pipeline for `kind`.
/// A failed read aborts the run rather than silently skipping an overlay.
pub async fn run_assessment(
    store: &dyn Store,
    config: &Config,
    grades: &Table,
    kind: AssessmentKind,
    course: Option<&str>,
) -> anyhow::Result<AssessmentOutcome> {
    if grades.is_empty() {
        warn!("uploaded sheet has no data rows");
    }
    let roster = load_roster(store, config, course)
        .await
        .context("failed to load the student roster")?;
    if roster.is_empty() {
        warn!(course, "roster is empty, rows will carry no student attributes");
    }

    let mut sources = Vec::new();
    for table in [STUDENT_IO_TABLE, PERESDACHI_TABLE] {
        let observations = load_grade_table(store, config, table)
            .await
            .with_context(|| format!("failed to load grades from {table}"))?;
        sources.push(GradeSource {
            name: table.to_string(),
            observations,
        });
    }

    let (rows, log) = match kind {
        AssessmentKind::CompetencyTest => process_external_assessment(grades, &roster, &sources)?,
        AssessmentKind::Project => process_project_assessment(grades, &roster, &sources)?,
    };
    let new_rows = new_records(&rows, &sources[1].observations);

    Ok(AssessmentOutcome {
        rows,
        new_rows,
        log,
    })
}

pub async fn save_retakes(
    store: &dyn Store,
    config: &Config,
    rows: &[AssessmentRow],
    mode: WriteMode,
) -> Result<WriteReport, WriteError> {
    Writer::new(store, config)
        .write_rows(PERESDACHI_TABLE, rows, &RETAKE_KEY, mode)
        .await
}

/// Writes the exports for one run into `dir`. Competency tests also get a
/// new-only sheet; project runs never touch the retake table and get one file.
pub fn export_outcome(
    outcome: &AssessmentOutcome,
    dir: &Path,
    date: NaiveDate,
    kind: AssessmentKind,
) -> anyhow::Result<(PathBuf, Option<PathBuf>)> {
    let stamp = date.format("%d-%m-%Y");
    match kind {
        AssessmentKind::CompetencyTest => {
            let full = dir.join(format!("peresdachi_{stamp}.xlsx"));
            let fresh = dir.join(format!("peresdachi_new_{stamp}.xlsx"));
            write_table(&rows_to_table(&outcome.rows), &full, EXPORT_SHEET)?;
            write_table(&rows_to_table(&outcome.new_rows), &fresh, EXPORT_SHEET)?;
            Ok((full, Some(fresh)))
        }
        AssessmentKind::Project => {
            let full = dir.join(format!("proekty_{stamp}.xlsx"));
            write_table(&rows_to_table(&outcome.rows), &full, PROJECT_SHEET)?;
            Ok((full, None))
        }
    }
}

fn score(record: Option<&Record>, column: &str) -> f64 {
    record
        .and_then(|r| r.get(column))
        .and_then(|v| Cell::from_json(v).as_number())
        .unwrap_or(0.0)
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Folds project scores into the final-grade summary. The final score is the
/// maximum of the test score, the project score and the previous final score,
/// so it never decreases.
pub async fn update_final_grades(
    store: &dyn Store,
    config: &Config,
    rows: &[AssessmentRow],
) -> anyhow::Result<FinalGradeUpdate> {
    let mut seen = HashSet::new();
    let scored: Vec<(String, f64, Option<&str>)> = rows
        .iter()
        .filter_map(|row| {
            let email = normalize_email(&row.email);
            let project = row.grade.as_number()?;
            (!email.is_empty() && seen.insert(email.clone()))
                .then(|| (email, project, row.full_name.as_deref()))
        })
        .collect();
    if scored.is_empty() {
        return Ok(FinalGradeUpdate::default());
    }

    let emails: Vec<String> = scored.iter().map(|(email, _, _)| email.clone()).collect();
    let mut existing: HashMap<String, Record> = HashMap::new();
    for chunk in emails.chunks(config.write_batch_size.max(1)) {
        let records = store
            .select_in(FINAL_GRADES_TABLE, COL_EMAIL, chunk)
            .await
            .context("failed to read existing final grades")?;
        for record in records {
            let email = record
                .get(COL_EMAIL)
                .and_then(Value::as_str)
                .map(normalize_email)
                .unwrap_or_default();
            if !email.is_empty() {
                existing.insert(email, record);
            }
        }
    }

    let mut updates = Vec::new();
    let mut creations = Vec::new();
    for (email, project, full_name) in scored {
        let previous = existing.get(&email);
        let final_score = score(previous, COL_TEST_SCORE)
            .max(project)
            .max(score(previous, COL_FINAL_SCORE));

        let mut payload = Map::new();
        payload.insert(COL_EMAIL.to_string(), Value::String(email));
        payload.insert(COL_PROJECT_SCORE.to_string(), number(project));
        payload.insert(COL_FINAL_SCORE.to_string(), number(final_score));

        if previous.is_some() {
            updates.push(payload);
            continue;
        }
        payload.insert(
            COL_FIO.to_string(),
            full_name.map_or(Value::Null, |n| Value::String(n.to_string())),
        );
        let mut parts = full_name.unwrap_or_default().split_whitespace();
        if let Some(surname) = parts.next() {
            payload.insert(COL_SURNAME.to_string(), Value::String(surname.to_string()));
        }
        if let Some(name) = parts.next() {
            payload.insert(COL_NAME.to_string(), Value::String(name.to_string()));
        }
        creations.push(payload);
    }

    let summary = FinalGradeUpdate {
        updated: updates.len(),
        created: creations.len(),
    };
    let writer = Writer::new(store, config);
    for batch in [updates, creations] {
        if !batch.is_empty() {
            writer
                .write_records(FINAL_GRADES_TABLE, batch, &[COL_EMAIL], WriteMode::Upsert)
                .await?;
        }
    }
    info!(updated = summary.updated, created = summary.created, "final grades updated");
    Ok(summary)
}
