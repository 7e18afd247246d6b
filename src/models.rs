use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::columns;

/// A single spreadsheet or store value.
///
/// Grades travel through the pipeline as cells and are only formatted to text
/// when they are serialized for storage or export.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Numeric view of the cell. Text is trimmed and accepts a decimal comma.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Empty => None,
            Cell::Number(n) if !n.is_finite() => None,
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                trimmed
                    .replace(',', ".")
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
            }
        }
    }

    /// Text view of the cell; `Empty` becomes `None`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            other => Some(other.to_string()),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Empty,
            Value::String(s) => Cell::Text(s.clone()),
            Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
            Value::Bool(b) => Cell::Text(b.to_string()),
            other => Cell::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Text(s) => f.write_str(s),
            Cell::Number(n) => f.write_str(&format_number(*n)),
        }
    }
}

/// Integral values print without a fractional part (`7`, not `7.0`).
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Serializes a grade cell as text, or null when it is missing.
pub fn cell_as_text<S: Serializer>(cell: &Cell, serializer: S) -> Result<S::Ok, S::Error> {
    match cell {
        Cell::Number(n) if !n.is_finite() => serializer.serialize_none(),
        other => match other.as_text() {
            Some(text) => serializer.serialize_str(&text),
            None => serializer.serialize_none(),
        },
    }
}

/// Row-oriented in-memory sheet: a header row plus rows padded to its width.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), Cell::Empty);
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&EMPTY)
    }

    /// Appends a column, replacing an existing one with the same name.
    pub fn set_column(&mut self, name: &str, values: Vec<Cell>) {
        let idx = match self.column_index(name) {
            Some(idx) => idx,
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(Cell::Empty);
                }
                self.columns.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> bool
    where
        F: FnMut(&Cell) -> Cell,
    {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        true
    }

    /// Keeps rows for which `keep` returns true, returning how many were removed.
    pub fn retain_rows<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&[Cell]) -> bool,
    {
        let before = self.rows.len();
        self.rows.retain(|row| keep(row));
        before - self.rows.len()
    }
}

/// One (email, discipline, grade) triple, either melted from an upload or read
/// from an external grade table.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeObservation {
    pub email: String,
    pub discipline: String,
    pub grade: Cell,
}

impl GradeObservation {
    pub fn key(&self) -> (String, String) {
        (self.email.clone(), self.discipline.clone())
    }
}

/// Roster entry keyed by the corporate email. Field names follow the storage
/// schema of the `students` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    #[serde(rename = "корпоративная_почта")]
    pub email: String,
    #[serde(rename = "фио")]
    pub full_name: String,
    #[serde(rename = "филиал_кампус", default)]
    pub campus: Option<String>,
    #[serde(rename = "факультет", default)]
    pub faculty: Option<String>,
    #[serde(rename = "образовательная_программа", default)]
    pub program: Option<String>,
    #[serde(rename = "версия_образовательной_программы", default)]
    pub program_version: Option<String>,
    #[serde(rename = "группа", default)]
    pub group: Option<String>,
    #[serde(rename = "курс", default)]
    pub course: Option<String>,
    #[serde(rename = "уровень_образования", default)]
    pub education_level: Option<String>,
}

/// A processed grade row as exported and stored in the retake table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssessmentRow {
    #[serde(rename = "ФИО")]
    pub full_name: Option<String>,
    #[serde(rename = "Адрес электронной почты")]
    pub email: String,
    #[serde(rename = "Кампус")]
    pub campus: Option<String>,
    #[serde(rename = "Факультет")]
    pub faculty: Option<String>,
    #[serde(rename = "Образовательная программа")]
    pub program: Option<String>,
    #[serde(rename = "Группа")]
    pub group: Option<String>,
    #[serde(rename = "Курс")]
    pub course: Option<String>,
    #[serde(rename = "ID дисциплины")]
    pub discipline_id: String,
    #[serde(rename = "Наименование дисциплины")]
    pub discipline: String,
    #[serde(rename = "Период аттестации")]
    pub period: String,
    #[serde(rename = "Оценка", serialize_with = "cell_as_text")]
    pub grade: Cell,
}

impl AssessmentRow {
    pub fn from_observation(obs: GradeObservation, student: Option<&StudentRecord>) -> Self {
        let mut row = AssessmentRow {
            email: obs.email,
            discipline: obs.discipline,
            grade: obs.grade,
            ..Default::default()
        };
        if let Some(student) = student {
            row.full_name = Some(student.full_name.clone());
            row.campus = student.campus.clone();
            row.faculty = student.faculty.clone();
            row.program = student.program.clone();
            row.group = student.group.clone();
            row.course = student.course.clone();
        }
        row
    }

    pub fn key(&self) -> (String, String) {
        (self.email.clone(), self.discipline.clone())
    }

    fn cells(&self) -> Vec<Cell> {
        let opt = |v: &Option<String>| v.clone().map(Cell::Text).unwrap_or_default();
        vec![
            opt(&self.full_name),
            Cell::text(&self.email),
            opt(&self.campus),
            opt(&self.faculty),
            opt(&self.program),
            opt(&self.group),
            opt(&self.course),
            Cell::text(&self.discipline_id),
            Cell::text(&self.discipline),
            Cell::text(&self.period),
            self.grade.clone(),
        ]
    }
}

/// Lays processed rows out in the export column order.
pub fn rows_to_table(rows: &[AssessmentRow]) -> Table {
    let mut table = Table::new(columns::OUTPUT_COLUMNS.iter().copied());
    for row in rows {
        table.push_row(row.cells());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_without_trailing_zero() {
        assert_eq!(Cell::Number(7.0).to_string(), "7");
        assert_eq!(Cell::Number(7.5).to_string(), "7.5");
        assert_eq!(Cell::Empty.to_string(), "");
    }

    #[test]
    fn text_parses_as_number_with_decimal_comma() {
        assert_eq!(Cell::text(" 8,5 ").as_number(), Some(8.5));
        assert_eq!(Cell::text("nan").as_number(), None);
        assert_eq!(Cell::text("-").as_number(), None);
        assert_eq!(Cell::text("inf").as_number(), None);
        assert_eq!(Cell::Number(f64::NEG_INFINITY).as_number(), None);
    }

    #[test]
    fn set_column_appends_and_pads() {
        let mut table = Table::new(["a"]);
        table.push_row(vec![Cell::text("x")]);
        table.push_row(vec![]);
        table.set_column("b", vec![Cell::Number(1.0), Cell::Number(2.0)]);
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.cell(1, 0), &Cell::Empty);
        assert_eq!(table.cell(1, 1), &Cell::Number(2.0));
    }

    #[test]
    fn assessment_row_serializes_grade_as_text() {
        let row = AssessmentRow {
            email: "a@edu.hse.ru".to_string(),
            discipline: "d".to_string(),
            grade: Cell::Number(7.0),
            ..Default::default()
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["Оценка"], Value::String("7".to_string()));
        assert_eq!(value["ФИО"], Value::Null);
    }
}
