use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::assessment::AssessmentOutcome;
use crate::models::AssessmentRow;

#[derive(Debug, Clone, PartialEq)]
pub struct DisciplineSummary {
    pub discipline: String,
    pub count: usize,
    pub avg_grade: Option<f64>,
}

pub fn summarize_by_discipline(rows: &[AssessmentRow]) -> Vec<DisciplineSummary> {
    let mut map: HashMap<String, (usize, f64, usize)> = HashMap::new();

    for row in rows {
        let entry = map.entry(row.discipline.clone()).or_insert((0, 0.0, 0));
        entry.0 += 1;
        if let Some(grade) = row.grade.as_number() {
            entry.1 += grade;
            entry.2 += 1;
        }
    }

    let mut summaries: Vec<DisciplineSummary> = map
        .into_iter()
        .map(|(discipline, (count, total, numeric))| DisciplineSummary {
            discipline,
            count,
            avg_grade: (numeric > 0).then(|| total / numeric as f64),
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then(a.discipline.cmp(&b.discipline)));
    summaries
}

/// Row counts per campus, largest first. Rows without a roster match are
/// grouped under "unknown campus".
pub fn campus_counts(rows: &[AssessmentRow]) -> Vec<(String, usize)> {
    let mut map: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let campus = row
            .campus
            .clone()
            .unwrap_or_else(|| "unknown campus".to_string());
        *map.entry(campus).or_insert(0) += 1;
    }
    let mut counts: Vec<(String, usize)> = map.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    counts
}

pub fn build_report(title: &str, generated: NaiveDate, outcome: &AssessmentOutcome) -> String {
    let summaries = summarize_by_discipline(&outcome.rows);
    let campuses = campus_counts(&outcome.rows);

    let mut output = String::new();

    let _ = writeln!(output, "# {title}");
    let _ = writeln!(
        output,
        "Generated {} with {} rows ({} not yet in the retake table)",
        generated,
        outcome.rows.len(),
        outcome.new_rows.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Disciplines");

    if summaries.is_empty() {
        let _ = writeln!(output, "No graded rows in this upload.");
    } else {
        for summary in summaries.iter() {
            match summary.avg_grade {
                Some(avg) => {
                    let _ = writeln!(
                        output,
                        "- {}: {} rows (avg grade {:.1})",
                        summary.discipline, summary.count, avg
                    );
                }
                None => {
                    let _ = writeln!(output, "- {}: {} rows", summary.discipline, summary.count);
                }
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Campuses");

    if campuses.is_empty() {
        let _ = writeln!(output, "No rows to group.");
    } else {
        for (campus, count) in campuses.iter().take(10) {
            let _ = writeln!(output, "- {campus}: {count} rows");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Operation Log");

    if outcome.log.is_empty() {
        let _ = writeln!(output, "Nothing to report.");
    } else {
        for line in &outcome.log {
            let _ = writeln!(output, "- {line}");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cell;

    fn row(discipline: &str, campus: Option<&str>, grade: Cell) -> AssessmentRow {
        AssessmentRow {
            email: "a@edu.hse.ru".to_string(),
            discipline: discipline.to_string(),
            campus: campus.map(str::to_string),
            grade,
            ..Default::default()
        }
    }

    #[test]
    fn disciplines_are_ordered_by_count() {
        let rows = vec![
            row("B", None, Cell::text("6")),
            row("A", None, Cell::Number(4.0)),
            row("B", None, Cell::Number(8.0)),
            row("C", None, Cell::text("зачтено")),
        ];
        let summaries = summarize_by_discipline(&rows);
        assert_eq!(summaries[0].discipline, "B");
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].avg_grade, Some(7.0));
        assert_eq!(summaries[2].avg_grade, None);
    }

    #[test]
    fn report_lists_campuses_and_log() {
        let outcome = AssessmentOutcome {
            rows: vec![
                row("A", Some("Москва"), Cell::Number(5.0)),
                row("A", Some("Пермь"), Cell::Number(7.0)),
                row("A", Some("Москва"), Cell::Number(9.0)),
            ],
            new_rows: Vec::new(),
            log: vec!["Dropped 2 uploaded rows with blank grades.".to_string()],
        };
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let report = build_report("External Assessment", date, &outcome);

        assert!(report.starts_with("# External Assessment\n"));
        assert!(report.contains("- A: 3 rows (avg grade 7.0)"));
        assert!(report.contains("- Москва: 2 rows\n- Пермь: 1 rows"));
        assert!(report.contains("- Dropped 2 uploaded rows with blank grades."));
    }
}
