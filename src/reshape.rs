use crate::columns::{
    resolve_columns, COL_DISCIPLINE, COL_EMAIL, COL_GRADE, DISCIPLINE_FINAL, DISCIPLINE_INPUT,
    DISCIPLINE_MID, GRADE_FILE_COLUMNS,
};
use crate::error::PipelineError;
use crate::models::{Cell, GradeObservation, Table};

/// Stage columns in melt order; each stage label is also its discipline name.
pub const STAGE_DISCIPLINES: [&str; 3] = [DISCIPLINE_INPUT, DISCIPLINE_MID, DISCIPLINE_FINAL];

/// Project exports name each category column `Задание:<name> (Значение)`.
pub const PROJECT_COLUMN_PREFIX: &str = "задание:";

/// Melts the stage score columns of a wide test export into
/// `(email, discipline, grade)` rows, one block per stage.
///
/// Dashes in score cells mark a missing attempt and are stripped, leaving a
/// blank grade for the validity filter to drop.
pub fn melt_stages(table: &Table) -> Result<Table, PipelineError> {
    let resolved = resolve_columns(GRADE_FILE_COLUMNS, &table.columns);
    let email_idx = identity_index(table, resolved.require(COL_EMAIL)?)?;

    let stages: Vec<(&str, usize)> = STAGE_DISCIPLINES
        .iter()
        .filter_map(|discipline| {
            let header = resolved.get(discipline)?;
            table.column_index(header).map(|idx| (*discipline, idx))
        })
        .collect();
    if stages.is_empty() {
        return Err(PipelineError::NoValueColumns("competency test".to_string()));
    }

    let mut long = Table::new([COL_EMAIL, COL_DISCIPLINE, COL_GRADE]);
    for (discipline, idx) in stages {
        for row in 0..table.len() {
            long.push_row(vec![
                table.cell(row, email_idx).clone(),
                Cell::text(discipline),
                strip_dashes(table.cell(row, idx)),
            ]);
        }
    }
    Ok(long)
}

/// Collapses the project category columns into a single score per student:
/// the best numeric result across every category offered. Rows without a
/// positive score get a blank grade.
pub fn project_maximum(table: &Table) -> Result<Table, PipelineError> {
    let project_columns: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| name.trim().to_lowercase().starts_with(PROJECT_COLUMN_PREFIX))
        .map(|(idx, _)| idx)
        .collect();
    if project_columns.is_empty() {
        return Err(PipelineError::NoValueColumns(
            "project score (Задание:...)".to_string(),
        ));
    }

    let resolved = resolve_columns(GRADE_FILE_COLUMNS, &table.columns);
    let email_idx = identity_index(table, resolved.require(COL_EMAIL)?)?;

    let mut long = Table::new([COL_EMAIL, COL_DISCIPLINE, COL_GRADE]);
    for row in 0..table.len() {
        let best = project_columns
            .iter()
            .filter_map(|&idx| table.cell(row, idx).as_number())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        let grade = match best {
            Some(score) if score > 0.0 => Cell::Number(score),
            _ => Cell::Empty,
        };
        long.push_row(vec![
            table.cell(row, email_idx).clone(),
            Cell::text(DISCIPLINE_FINAL),
            grade,
        ]);
    }
    Ok(long)
}

/// Reads a long `(email, discipline, grade)` table back into observations.
/// Rows without an email are skipped.
pub fn into_observations(table: &Table) -> Vec<GradeObservation> {
    let (Some(email), Some(discipline), Some(grade)) = (
        table.column_index(COL_EMAIL),
        table.column_index(COL_DISCIPLINE),
        table.column_index(COL_GRADE),
    ) else {
        return Vec::new();
    };

    table
        .rows
        .iter()
        .filter_map(|row| {
            Some(GradeObservation {
                email: row[email].as_text().filter(|e| !e.is_empty())?,
                discipline: row[discipline].as_text().unwrap_or_default(),
                grade: row[grade].clone(),
            })
        })
        .collect()
}

fn identity_index(table: &Table, header: &str) -> Result<usize, PipelineError> {
    table
        .column_index(header)
        .ok_or_else(|| PipelineError::MissingColumn(COL_EMAIL.to_string()))
}

fn strip_dashes(cell: &Cell) -> Cell {
    match cell {
        Cell::Text(s) => Cell::Text(s.replace('-', "").trim().to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::filter_valid_grades;

    fn wide_export() -> Table {
        let mut table = Table::new([
            "Адрес электронной почты",
            "Тест:Входное тестирование (Значение)",
            "Тест:Промежуточное тестирование (Значение)",
            "Тест:Итоговое тестирование (Значение)",
        ]);
        table.push_row(vec![
            Cell::text("a@edu.hse.ru"),
            Cell::Number(5.0),
            Cell::text("-"),
            Cell::Number(7.0),
        ]);
        table
    }

    #[test]
    fn melts_one_row_per_stage_and_drops_dash_cells() {
        let mut long = melt_stages(&wide_export()).unwrap();
        assert_eq!(long.len(), 3);

        filter_valid_grades(&mut long, COL_GRADE);
        let observations = into_observations(&long);
        assert_eq!(
            observations,
            vec![
                GradeObservation {
                    email: "a@edu.hse.ru".to_string(),
                    discipline: DISCIPLINE_INPUT.to_string(),
                    grade: Cell::Number(5.0),
                },
                GradeObservation {
                    email: "a@edu.hse.ru".to_string(),
                    discipline: DISCIPLINE_FINAL.to_string(),
                    grade: Cell::Number(7.0),
                },
            ]
        );
    }

    #[test]
    fn melt_without_identity_column_fails() {
        let mut table = Table::new(["Тест:Входное тестирование (Значение)"]);
        table.push_row(vec![Cell::Number(5.0)]);
        assert_eq!(
            melt_stages(&table),
            Err(PipelineError::MissingColumn(COL_EMAIL.to_string()))
        );
    }

    #[test]
    fn melt_without_stage_columns_fails() {
        let table = Table::new(["Адрес электронной почты", "Фамилия"]);
        assert!(matches!(
            melt_stages(&table),
            Err(PipelineError::NoValueColumns(_))
        ));
    }

    #[test]
    fn infinite_project_score_is_not_a_grade() {
        let mut table = Table::new([
            "Адрес электронной почты",
            "Задание:Проект А (Значение)",
            "Задание:Проект Б (Значение)",
        ]);
        table.push_row(vec![Cell::text("a@edu.hse.ru"), Cell::text("inf"), Cell::Number(6.0)]);
        table.push_row(vec![Cell::text("b@edu.hse.ru"), Cell::text("infinity"), Cell::text("-")]);

        let mut long = project_maximum(&table).unwrap();
        assert_eq!(filter_valid_grades(&mut long, COL_GRADE), 1);
        let observations = into_observations(&long);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].grade, Cell::Number(6.0));
    }

    #[test]
    fn project_score_is_the_best_category() {
        let mut table = Table::new([
            "Адрес электронной почты",
            "Задание:Проект А (Значение)",
            "Задание:Проект Б (Значение)",
            "Задание:Проект В (Значение)",
        ]);
        table.push_row(vec![
            Cell::text("a@edu.hse.ru"),
            Cell::text("-"),
            Cell::Number(6.0),
            Cell::text("8,5"),
        ]);
        table.push_row(vec![
            Cell::text("b@edu.hse.ru"),
            Cell::text("-"),
            Cell::Number(0.0),
            Cell::Empty,
        ]);

        let mut long = project_maximum(&table).unwrap();
        assert_eq!(filter_valid_grades(&mut long, COL_GRADE), 1);
        let observations = into_observations(&long);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].discipline, DISCIPLINE_FINAL);
        assert_eq!(observations[0].grade, Cell::Number(8.5));
    }

    #[test]
    fn project_without_category_columns_fails() {
        let table = Table::new(["Адрес электронной почты"]);
        assert!(matches!(
            project_maximum(&table),
            Err(PipelineError::NoValueColumns(_))
        ));
    }
}
