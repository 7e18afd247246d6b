use crate::models::{Cell, Table};

/// Trims and lowercases an email column. Numbers are cast to text; missing
/// cells stay missing.
pub fn clean_email_column(table: &mut Table, column: &str) {
    table.map_column(column, |cell| match cell.as_text() {
        Some(text) => Cell::Text(normalize_email(&text)),
        None => Cell::Empty,
    });
}

/// Trims a text column without changing case.
pub fn clean_string_column(table: &mut Table, column: &str) {
    table.map_column(column, |cell| match cell.as_text() {
        Some(text) => Cell::Text(text.trim().to_string()),
        None => Cell::Empty,
    });
}

/// Drops rows whose grade is missing, blank, or the literal text `nan`.
/// Returns the number of rows removed.
pub fn filter_valid_grades(table: &mut Table, column: &str) -> usize {
    let Some(idx) = table.column_index(column) else {
        return 0;
    };
    table.retain_rows(|row| is_valid_grade(&row[idx]))
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Stringified nulls from upstream exports show up as `nan`, so the textual
/// check is case-insensitive. Infinite values are never a grade.
pub fn is_valid_grade(cell: &Cell) -> bool {
    match cell {
        Cell::Empty => false,
        Cell::Number(n) => n.is_finite(),
        Cell::Text(s) => {
            let trimmed = s.trim();
            !trimmed.is_empty()
                && !trimmed.eq_ignore_ascii_case("nan")
                && !trimmed.parse::<f64>().is_ok_and(|n| !n.is_finite())
        }
    }
}
