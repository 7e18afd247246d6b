use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{info, warn};

use crate::clean::normalize_email;
use crate::columns::{
    resolve_columns, ResolvedColumns, STUDENT_CAMPUS, STUDENT_COLUMNS, STUDENT_COURSE,
    STUDENT_EDUCATION_LEVEL, STUDENT_EMAIL, STUDENT_FACULTY, STUDENT_FIO, STUDENT_GROUP,
    STUDENT_PROGRAM, STUDENT_PROGRAM_VERSION,
};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{StudentRecord, Table};
use crate::store::{fetch_all, Query, Store, StoreError};
use crate::writer::{WriteError, WriteMode, WriteReport, Writer};

pub const STUDENTS_TABLE: &str = "students";
pub const STUDENTS_KEY: &str = "корпоративная_почта";
const COURSE_FILTER_COLUMN: &str = "курс";

const USER_DATA_COLUMN: &str = "Данные о пользователе";
const UNKNOWN_NAME: &str = "Неизвестно";

/// Turns a roster export into unique student records.
///
/// Rows outside the corporate domain are dropped and duplicates by email keep
/// their first occurrence.
pub fn parse_roster(table: &Table, domain: &str) -> Result<Vec<StudentRecord>, PipelineError> {
    let resolved = resolve_columns(STUDENT_COLUMNS, &table.columns);
    let email_column = resolved.require(STUDENT_EMAIL)?;
    let email_idx = table
        .column_index(email_column)
        .ok_or_else(|| PipelineError::MissingColumn(STUDENT_EMAIL.to_string()))?;

    let user_data = user_data_parts(table);
    let domain = domain.to_lowercase();
    let mut seen = HashSet::new();
    let mut students = Vec::new();
    let mut outside_domain = 0;

    for (row, cells) in table.rows.iter().enumerate() {
        let email = cells[email_idx]
            .as_text()
            .map(|e| normalize_email(&e))
            .unwrap_or_default();
        if email.is_empty() || !email.contains(&domain) {
            outside_domain += 1;
            continue;
        }
        if !seen.insert(email.clone()) {
            continue;
        }

        let field = |name: &str| attribute(table, &resolved, row, name);
        let mut student = StudentRecord {
            email,
            full_name: field(STUDENT_FIO).unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            campus: field(STUDENT_CAMPUS),
            faculty: field(STUDENT_FACULTY),
            program: field(STUDENT_PROGRAM),
            program_version: field(STUDENT_PROGRAM_VERSION),
            group: field(STUDENT_GROUP),
            course: field(STUDENT_COURSE),
            education_level: field(STUDENT_EDUCATION_LEVEL),
        };
        if let Some(parts) = &user_data {
            let part = |i: usize| parts[row].get(i).cloned().flatten();
            student.faculty = part(0);
            student.program = part(1);
            student.course = part(2);
            student.group = part(3);
        }
        students.push(student);
    }

    if outside_domain > 0 {
        warn!(dropped = outside_domain, domain = %domain, "skipped rows outside the corporate domain");
    }
    info!(students = students.len(), "parsed roster");
    Ok(students)
}

fn attribute(table: &Table, resolved: &ResolvedColumns, row: usize, field: &str) -> Option<String> {
    let idx = table.column_index(resolved.get(field)?)?;
    let text = table.cell(row, idx).as_text()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Splits the `;`-separated user-data column into per-row parts, but only when
/// some row carries at least four of them.
fn user_data_parts(table: &Table) -> Option<Vec<Vec<Option<String>>>> {
    let idx = table.column_index(USER_DATA_COLUMN)?;
    let parts: Vec<Vec<Option<String>>> = table
        .rows
        .iter()
        .map(|row| match row[idx].as_text() {
            Some(text) => text
                .split(';')
                .map(|p| Some(p.trim().to_string()).filter(|p| !p.is_empty()))
                .collect(),
            None => Vec::new(),
        })
        .collect();
    parts.iter().any(|p| p.len() >= 4).then_some(parts)
}

pub async fn upload_roster(
    store: &dyn Store,
    config: &Config,
    students: &[StudentRecord],
) -> Result<WriteReport, WriteError> {
    if students.is_empty() {
        info!("no roster rows to upload");
        return Ok(WriteReport::default());
    }
    Writer::new(store, config)
        .write_rows(STUDENTS_TABLE, students, &[STUDENTS_KEY], WriteMode::Upsert)
        .await
}

/// Reads the stored roster, optionally limited to one course.
pub async fn load_roster(
    store: &dyn Store,
    config: &Config,
    course: Option<&str>,
) -> Result<Vec<StudentRecord>, StoreError> {
    let mut query = Query::table(STUDENTS_TABLE);
    if let Some(course) = course {
        query = query.eq(COURSE_FILTER_COLUMN, course);
    }
    let records = fetch_all(store, &query, config.read_page_size).await?;
    let total = records.len();
    let students: Vec<StudentRecord> = records
        .into_iter()
        .filter_map(|record| serde_json::from_value(Value::Object(record)).ok())
        .collect();
    if students.len() < total {
        warn!(skipped = total - students.len(), "skipped malformed roster rows");
    }
    Ok(students)
}

/// Indexes the roster by normalized email, keeping the first entry.
pub fn index_by_email(students: &[StudentRecord]) -> HashMap<String, &StudentRecord> {
    let mut index = HashMap::new();
    for student in students {
        index.entry(normalize_email(&student.email)).or_insert(student);
    }
    index
}
