//! Canonical column vocabulary and header resolution.
//!
//! The Russian names below double as storage column names, so they must not
//! be translated or reworded.

use std::collections::HashMap;

use crate::error::PipelineError;

pub const COL_EMAIL: &str = "Адрес электронной почты";
pub const COL_DISCIPLINE: &str = "Наименование дисциплины";
pub const COL_GRADE: &str = "Оценка";
pub const COL_FIO: &str = "ФИО";
pub const COL_CAMPUS: &str = "Кампус";
pub const COL_FACULTY: &str = "Факультет";
pub const COL_PROGRAM: &str = "Образовательная программа";
pub const COL_GROUP: &str = "Группа";
pub const COL_COURSE: &str = "Курс";
pub const COL_ID_DISCIPLINE: &str = "ID дисциплины";
pub const COL_PERIOD: &str = "Период аттестации";

pub const DISCIPLINE_INPUT: &str = "Внешнее измерение цифровых компетенций. Входной контроль";
pub const DISCIPLINE_MID: &str = "Внешнее измерение цифровых компетенций. Промежуточный контроль";
pub const DISCIPLINE_FINAL: &str = "Внешнее измерение цифровых компетенций. Итоговый контроль";

pub const STUDENT_FIO: &str = "ФИО";
pub const STUDENT_EMAIL: &str = "Корпоративная почта";
pub const STUDENT_CAMPUS: &str = "Филиал (кампус)";
pub const STUDENT_FACULTY: &str = "Факультет";
pub const STUDENT_PROGRAM: &str = "Образовательная программа";
pub const STUDENT_PROGRAM_VERSION: &str = "Версия образовательной программы";
pub const STUDENT_GROUP: &str = "Группа";
pub const STUDENT_COURSE: &str = "Курс";
pub const STUDENT_EDUCATION_LEVEL: &str = "Уровень образования";

/// Export and retake-table column order.
pub const OUTPUT_COLUMNS: [&str; 11] = [
    COL_FIO,
    COL_EMAIL,
    COL_CAMPUS,
    COL_FACULTY,
    COL_PROGRAM,
    COL_GROUP,
    COL_COURSE,
    COL_ID_DISCIPLINE,
    COL_DISCIPLINE,
    COL_PERIOD,
    COL_GRADE,
];

/// A canonical field and the lowercase substrings that identify it in a header.
#[derive(Debug, Clone, Copy)]
pub struct FieldSynonyms {
    pub field: &'static str,
    pub patterns: &'static [&'static str],
}

const EMAIL_PATTERNS: &[&str] = &[
    "адрес электронной почты",
    "корпоративная почта",
    "email",
    "e-mail",
    "почта",
];

pub const STUDENT_COLUMNS: &[FieldSynonyms] = &[
    FieldSynonyms {
        field: STUDENT_FIO,
        patterns: &["фио", "учащийся", "полное имя"],
    },
    FieldSynonyms {
        field: STUDENT_EMAIL,
        patterns: EMAIL_PATTERNS,
    },
    FieldSynonyms {
        field: STUDENT_CAMPUS,
        patterns: &["филиал", "кампус"],
    },
    FieldSynonyms {
        field: STUDENT_FACULTY,
        patterns: &["факультет"],
    },
    FieldSynonyms {
        field: STUDENT_PROGRAM,
        patterns: &["образовательная программа", "программа обучения"],
    },
    FieldSynonyms {
        field: STUDENT_PROGRAM_VERSION,
        patterns: &["версия образовательной программы", "версия программы"],
    },
    FieldSynonyms {
        field: STUDENT_GROUP,
        patterns: &["группа"],
    },
    FieldSynonyms {
        field: STUDENT_COURSE,
        patterns: &["курс"],
    },
    FieldSynonyms {
        field: STUDENT_EDUCATION_LEVEL,
        patterns: &["уровень образования"],
    },
];

/// Wide competency-test export: the identity column plus the three stages.
pub const GRADE_FILE_COLUMNS: &[FieldSynonyms] = &[
    FieldSynonyms {
        field: COL_EMAIL,
        patterns: EMAIL_PATTERNS,
    },
    FieldSynonyms {
        field: DISCIPLINE_INPUT,
        patterns: &["тест:входное тестирование (значение)", "входной контроль"],
    },
    FieldSynonyms {
        field: DISCIPLINE_MID,
        patterns: &[
            "тест:промежуточное тестирование (значение)",
            "промежуточный контроль",
        ],
    },
    FieldSynonyms {
        field: DISCIPLINE_FINAL,
        patterns: &["тест:итоговое тестирование (значение)", "итоговый контроль"],
    },
];

pub const EMAIL_COLUMNS: &[FieldSynonyms] = &[FieldSynonyms {
    field: COL_EMAIL,
    patterns: EMAIL_PATTERNS,
}];

/// Maps canonical fields to the headers they were found under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedColumns {
    found: HashMap<&'static str, String>,
}

impl ResolvedColumns {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.found.get(field).map(String::as_str)
    }

    pub fn require(&self, field: &str) -> Result<&str, PipelineError> {
        self.get(field)
            .ok_or_else(|| PipelineError::MissingColumn(field.to_string()))
    }
}

/// Resolves canonical fields against a header row.
///
/// Patterns are tried in order and the first one contained in a lowercased,
/// trimmed header wins. Fields with no match are left out.
///
/// Pattern order takes precedence over header order: a later header matching
/// an earlier pattern beats an earlier header matching a later pattern.
pub fn resolve_columns(synonyms: &[FieldSynonyms], headers: &[String]) -> ResolvedColumns {
    let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
    let mut found = HashMap::new();

    for entry in synonyms {
        let hit = entry.patterns.iter().find_map(|pattern| {
            normalized
                .iter()
                .position(|header| header.contains(pattern))
        });
        if let Some(idx) = hit {
            found.insert(entry.field, headers[idx].clone());
        }
    }

    ResolvedColumns { found }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_roster_synonyms() {
        let resolved = resolve_columns(
            STUDENT_COLUMNS,
            &headers(&["ФИО студента", "Email", "Кампус", "Версия образовательной программы"]),
        );
        assert_eq!(resolved.get(STUDENT_FIO), Some("ФИО студента"));
        assert_eq!(resolved.get(STUDENT_EMAIL), Some("Email"));
        assert_eq!(resolved.get(STUDENT_CAMPUS), Some("Кампус"));
        assert_eq!(
            resolved.get(STUDENT_PROGRAM_VERSION),
            Some("Версия образовательной программы")
        );
        assert_eq!(resolved.get(STUDENT_PROGRAM), None);
    }

    #[test]
    fn earlier_pattern_beats_earlier_header() {
        let resolved = resolve_columns(
            STUDENT_COLUMNS,
            &headers(&["Почта личная", "  Корпоративная почта "]),
        );
        assert_eq!(resolved.get(STUDENT_EMAIL), Some("  Корпоративная почта "));
    }

    #[test]
    fn missing_mandatory_field_is_reported_by_name() {
        let resolved = resolve_columns(GRADE_FILE_COLUMNS, &headers(&["ФИО"]));
        assert_eq!(
            resolved.require(COL_EMAIL),
            Err(PipelineError::MissingColumn(COL_EMAIL.to_string()))
        );
    }

    #[test]
    fn resolves_wide_test_export() {
        let resolved = resolve_columns(
            GRADE_FILE_COLUMNS,
            &headers(&[
                "Адрес электронной почты",
                "Тест:Входное тестирование (Значение)",
                "Тест:Итоговое тестирование (Значение)",
            ]),
        );
        assert_eq!(resolved.get(COL_EMAIL), Some("Адрес электронной почты"));
        assert_eq!(
            resolved.get(DISCIPLINE_FINAL),
            Some("Тест:Итоговое тестирование (Значение)")
        );
        assert_eq!(resolved.get(DISCIPLINE_MID), None);
    }
}
