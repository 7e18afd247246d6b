use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::clean::normalize_email;
use crate::columns::{resolve_columns, COL_EMAIL, EMAIL_COLUMNS};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::Table;
use crate::store::Store;
use crate::writer::{WriteError, WriteMode, WriteReport, Writer};

const PROGRESS_KEY: &str = "корпоративная_почта";

const SERVICE_COLUMNS: [&str; 4] = [
    "Unnamed: 0",
    "Данные о пользователе",
    "User information",
    "Страна",
];

/// Material and survey columns of the digital literacy course that are not
/// graded tasks.
const CG_EXCLUDED_KEYWORDS: &[&str] = &[
    "take away",
    "шпаргалка",
    "консультация",
    "общая информация",
    "промо-ролик",
    "поддержка студентов",
    "пояснение",
    "случайный вариант для студентов с овз",
    "материалы по модулю",
    "копия",
    "демонстрационный вариант",
    "спецификация",
    "демо-версия",
    "правила проведения независимого экзамена",
    "порядок организации и проведения независимых экзаменов",
    "интерактивный тренажер правил нэ",
    "пересдачи в сентябре",
    "незрячих и слабовидящих",
    "проекты с использование tei",
    "тренировочный тест",
    "ключевые принципы tei",
    "базовые возможности tie",
    "специальные модули tei",
    "будут идентичными",
    "опрос",
    "тест по модулю",
    "анкета",
    "user information",
    "страна",
    "user_id",
    "данные о пользователе",
];

const STATUS_SAMPLE: usize = 100;
const TIMESTAMP_SAMPLE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Course {
    DigitalLiteracy,
    Python,
    DataAnalysis,
}

impl Course {
    pub const ALL: [Course; 3] = [Course::DigitalLiteracy, Course::Python, Course::DataAnalysis];

    pub fn table(self) -> &'static str {
        match self {
            Course::DigitalLiteracy => "course_cg",
            Course::Python => "course_python",
            Course::DataAnalysis => "course_analysis",
        }
    }

    fn excluded_keywords(self) -> &'static [&'static str] {
        match self {
            Course::DigitalLiteracy => CG_EXCLUDED_KEYWORDS,
            _ => &[],
        }
    }
}

impl fmt::Display for Course {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Course::DigitalLiteracy => write!(f, "ЦГ"),
            Course::Python => write!(f, "Питон"),
            Course::DataAnalysis => write!(f, "Андан"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseProgress {
    #[serde(rename = "корпоративная_почта")]
    pub email: String,
    #[serde(rename = "процент_завершения")]
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseSummary {
    pub course: Course,
    pub students: usize,
    pub mean: f64,
    pub complete: usize,
    pub not_started: usize,
}

/// True for text such as `2024-10-01 12:00:00` or `1 октября 2024, 12:00`.
fn looks_like_timestamp(value: &str) -> bool {
    if !value.contains(':') {
        return false;
    }
    let digits: Vec<char> = value.chars().collect();
    digits.windows(4).any(|w| {
        w[0] == '2' && w[1] == '0' && w[2].is_ascii_digit() && w[3].is_ascii_digit()
    })
}

fn is_completed(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower.contains("выполнено") && !lower.contains("не выполнено")
}

#[derive(Debug, PartialEq)]
enum TaskColumns {
    Timestamps(Vec<usize>),
    Statuses(Vec<usize>),
}

fn sample(table: &Table, idx: usize, limit: usize) -> Vec<String> {
    table
        .rows
        .iter()
        .filter_map(|row| row[idx].as_text())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .take(limit)
        .collect()
}

fn detect_task_columns(table: &Table, course: Course, email_idx: usize) -> Option<TaskColumns> {
    let mut timestamps = Vec::new();
    let mut statuses = Vec::new();

    for (idx, name) in table.columns.iter().enumerate() {
        if idx == email_idx || SERVICE_COLUMNS.contains(&name.as_str()) {
            continue;
        }
        let lower = name.trim().to_lowercase();
        if course.excluded_keywords().iter().any(|k| lower.contains(k)) {
            continue;
        }

        if name.starts_with("Unnamed:") {
            if sample(table, idx, TIMESTAMP_SAMPLE)
                .iter()
                .any(|v| looks_like_timestamp(v))
            {
                timestamps.push(idx);
            }
        } else if !lower.is_empty() {
            let values = sample(table, idx, STATUS_SAMPLE);
            let mentions = values.iter().any(|v| v.to_lowercase().contains("выполнено"));
            let all_pending = values.iter().all(|v| v == "Не выполнено");
            if mentions && !all_pending {
                statuses.push(idx);
            }
        }
    }

    if !timestamps.is_empty() {
        Some(TaskColumns::Timestamps(timestamps))
    } else if !statuses.is_empty() {
        Some(TaskColumns::Statuses(statuses))
    } else {
        None
    }
}

/// Per-student completion percentage for one course export.
///
/// Timestamp task columns take precedence over status columns. For status
/// columns only answered cells count toward the total.
pub fn completion_percentages(
    table: &Table,
    course: Course,
    domain: &str,
) -> Result<Vec<CourseProgress>, PipelineError> {
    let resolved = resolve_columns(EMAIL_COLUMNS, &table.columns);
    let email_idx = resolved
        .require(COL_EMAIL)
        .ok()
        .and_then(|header| table.column_index(header))
        .ok_or_else(|| PipelineError::MissingColumn(COL_EMAIL.to_string()))?;

    let tasks = detect_task_columns(table, course, email_idx)
        .ok_or_else(|| PipelineError::NoValueColumns(format!("{course} completion")))?;

    let domain = domain.to_lowercase();
    let mut seen = HashSet::new();
    let mut progress = Vec::new();
    for row in &table.rows {
        let email = row[email_idx]
            .as_text()
            .map(|e| normalize_email(&e))
            .unwrap_or_default();
        if !email.contains(&domain) || !seen.insert(email.clone()) {
            continue;
        }

        let cell = |idx: usize| row[idx].as_text().map(|v| v.trim().to_string()).unwrap_or_default();
        let (done, total) = match &tasks {
            TaskColumns::Timestamps(columns) => {
                let done = columns.iter().filter(|&&idx| looks_like_timestamp(&cell(idx))).count();
                (done, columns.len())
            }
            TaskColumns::Statuses(columns) => {
                let answered: Vec<String> = columns
                    .iter()
                    .map(|&idx| cell(idx))
                    .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("nan"))
                    .collect();
                let done = answered.iter().filter(|v| is_completed(v)).count();
                (done, answered.len())
            }
        };
        let percent = if total > 0 {
            done as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        progress.push(CourseProgress { email, percent });
    }

    info!(course = %course, students = progress.len(), "computed course completion");
    Ok(progress)
}

pub fn summarize(course: Course, progress: &[CourseProgress]) -> CourseSummary {
    let students = progress.len();
    let mean = if students > 0 {
        progress.iter().map(|p| p.percent).sum::<f64>() / students as f64
    } else {
        0.0
    };
    CourseSummary {
        course,
        students,
        mean,
        complete: progress.iter().filter(|p| p.percent >= 100.0).count(),
        not_started: progress.iter().filter(|p| p.percent == 0.0).count(),
    }
}

pub async fn upload_progress(
    store: &dyn Store,
    config: &Config,
    course: Course,
    progress: &[CourseProgress],
) -> Result<WriteReport, WriteError> {
    if progress.is_empty() {
        warn!(course = %course, "no completion rows to upload");
        return Ok(WriteReport::default());
    }
    Writer::new(store, config)
        .write_rows(course.table(), progress, &[PROGRESS_KEY], WriteMode::Upsert)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cell;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    const DOMAIN: &str = "@edu.hse.ru";

    fn status_export() -> Table {
        let mut table = Table::new([
            "Unnamed: 0",
            "Адрес электронной почты",
            "Задание 1",
            "Задание 2",
            "Опрос",
            "Страна",
        ]);
        table.push_row(vec![
            Cell::Number(1.0),
            Cell::text("A@edu.hse.ru"),
            Cell::text("Выполнено"),
            Cell::text("Не выполнено"),
            Cell::text("Выполнено"),
            Cell::text("Россия"),
        ]);
        table.push_row(vec![
            Cell::Number(2.0),
            Cell::text("b@edu.hse.ru"),
            Cell::text("Выполнено"),
            Cell::Empty,
            Cell::Empty,
            Cell::text("Россия"),
        ]);
        table.push_row(vec![
            Cell::Number(3.0),
            Cell::text("guest@gmail.com"),
            Cell::text("Выполнено"),
            Cell::text("Выполнено"),
            Cell::Empty,
            Cell::Empty,
        ]);
        table
    }

    #[test]
    fn pending_status_is_not_counted_as_done() {
        let progress =
            completion_percentages(&status_export(), Course::DigitalLiteracy, DOMAIN).unwrap();
        assert_eq!(
            progress,
            vec![
                CourseProgress {
                    email: "a@edu.hse.ru".to_string(),
                    percent: 50.0
                },
                CourseProgress {
                    email: "b@edu.hse.ru".to_string(),
                    percent: 100.0
                },
            ]
        );
    }

    #[test]
    fn survey_columns_only_count_outside_the_literacy_course() {
        let progress = completion_percentages(&status_export(), Course::Python, DOMAIN).unwrap();
        let a = &progress[0];
        assert!((a.percent - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn timestamp_columns_take_precedence() {
        let mut table = Table::new(["Email", "Unnamed: 1", "Unnamed: 2", "Задание"]);
        table.push_row(vec![
            Cell::text("a@edu.hse.ru"),
            Cell::text("1 октября 2024, 12:00"),
            Cell::text("-"),
            Cell::text("Выполнено"),
        ]);
        table.push_row(vec![
            Cell::text("b@edu.hse.ru"),
            Cell::text("2025-03-02 09:15:00"),
            Cell::text("2025-03-09 10:00:00"),
            Cell::text("Выполнено"),
        ]);
        let progress = completion_percentages(&table, Course::Python, DOMAIN).unwrap();
        assert_eq!(progress[0].percent, 50.0);
        assert_eq!(progress[1].percent, 100.0);
    }

    #[test]
    fn export_without_tasks_is_rejected() {
        let mut table = Table::new(["Email", "Страна"]);
        table.push_row(vec![Cell::text("a@edu.hse.ru"), Cell::text("Россия")]);
        assert!(matches!(
            completion_percentages(&table, Course::DataAnalysis, DOMAIN),
            Err(PipelineError::NoValueColumns(_))
        ));
    }

    #[test]
    fn summary_counts_extremes() {
        let progress = vec![
            CourseProgress { email: "a".into(), percent: 100.0 },
            CourseProgress { email: "b".into(), percent: 0.0 },
            CourseProgress { email: "c".into(), percent: 50.0 },
        ];
        let summary = summarize(Course::Python, &progress);
        assert_eq!(summary.students, 3);
        assert_eq!(summary.mean, 50.0);
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.not_started, 1);
    }

    #[tokio::test]
    async fn progress_is_upserted_per_course_table() {
        let store = MemoryStore::new().with_unique("course_cg", &[PROGRESS_KEY]);
        let config = Config::default();
        let progress =
            completion_percentages(&status_export(), Course::DigitalLiteracy, DOMAIN).unwrap();
        upload_progress(&store, &config, Course::DigitalLiteracy, &progress)
            .await
            .unwrap();
        upload_progress(&store, &config, Course::DigitalLiteracy, &progress)
            .await
            .unwrap();

        let rows = store.rows("course_cg");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["процент_завершения"], json!(50.0));
    }
}
