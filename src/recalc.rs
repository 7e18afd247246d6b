//! Grade transfer decision table.
//!
//! Each row pairs an external exam grade with a prerequisite-course grade and
//! three staged competency-test grades, and yields two derived grades: the
//! prerequisite transfer grade and the exam credit grade.

use chrono::NaiveDate;
use tracing::info;

use crate::error::PipelineError;
use crate::models::{Cell, Table};

pub const COL_EXAM_NAME: &str = "Наименование НЭ";
pub const COL_EXAM_GRADE: &str = "Оценка НЭ";
pub const COL_PREREQUISITE: &str = "Оценка дисциплины-пререквизита";
pub const COL_STAGE: &str = "Этап";
pub const COL_TRANSFER: &str = "ДПР_итог";
pub const COL_EXAM_CREDIT: &str = "НЭ_итог";

const REQUIRED_COLUMNS: [&str; 6] = [
    COL_EXAM_NAME,
    COL_EXAM_GRADE,
    COL_PREREQUISITE,
    crate::columns::DISCIPLINE_INPUT,
    crate::columns::DISCIPLINE_MID,
    crate::columns::DISCIPLINE_FINAL,
];

const PASSING: f64 = 4.0;
const PREREQUISITE_CAP: f64 = 8.0;
const MAX_STAGE_DROP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input = 1,
    Mid = 2,
    Final = 3,
}

impl Stage {
    /// Programming exams read the mid-control grade, data-analysis exams the
    /// final-control grade, everything else the input-control grade.
    pub fn for_exam(name: &str) -> Stage {
        let name = name.to_lowercase();
        if name.contains("программированию") {
            Stage::Mid
        } else if name.contains("анализу данных") {
            Stage::Final
        } else {
            Stage::Input
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecalcInput {
    pub exam: Option<f64>,
    pub prerequisite: Option<f64>,
    pub input_control: Option<f64>,
    pub mid_control: Option<f64>,
    pub final_control: Option<f64>,
}

impl RecalcInput {
    fn competency(&self, stage: Stage) -> Option<f64> {
        match stage {
            Stage::Input => self.input_control,
            Stage::Mid => self.mid_control,
            Stage::Final => self.final_control,
        }
    }

    /// True when the competency grade regresses by more than a point between
    /// any two stages. Missing stages never count as a regression.
    fn regressed(&self) -> bool {
        let dropped = |earlier: Option<f64>, later: Option<f64>| match (earlier, later) {
            (Some(a), Some(b)) => a - b > MAX_STAGE_DROP,
            _ => false,
        };
        dropped(self.input_control, self.mid_control)
            || dropped(self.input_control, self.final_control)
            || dropped(self.mid_control, self.final_control)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecalcOutcome {
    pub transfer: Option<f64>,
    pub exam_credit: Option<f64>,
}

/// 9 and 10 on the prerequisite count as 8.
pub fn cap_prerequisite(grade: f64) -> f64 {
    if grade >= 9.0 {
        PREREQUISITE_CAP
    } else {
        grade
    }
}

pub fn recalculate(input: &RecalcInput, stage: Stage, use_dynamics: bool) -> RecalcOutcome {
    if use_dynamics && input.regressed() {
        return RecalcOutcome::default();
    }

    let exam = input.exam.unwrap_or(0.0);
    let prereq = cap_prerequisite(input.prerequisite.unwrap_or(0.0));
    let competency = input.competency(stage).unwrap_or(0.0);

    if exam < PASSING {
        return RecalcOutcome::default();
    }

    let top = exam.max(prereq).max(competency);
    if top == competency && competency > 3.0 && competency != prereq && competency != exam {
        return RecalcOutcome {
            transfer: Some(competency),
            exam_credit: Some(competency),
        };
    }
    if exam == prereq {
        return RecalcOutcome::default();
    }

    let prereq_on_top = top == prereq && prereq >= PASSING;

    let transfer = if prereq < PASSING || !prereq_on_top {
        Some(exam)
    } else {
        None
    };

    let exam_credit = if prereq_on_top {
        if exam >= 8.0 {
            None
        } else {
            Some(prereq.min(PREREQUISITE_CAP))
        }
    } else {
        None
    };

    RecalcOutcome {
        transfer,
        exam_credit,
    }
}

/// Runs the decision table over every row of an uploaded sheet.
///
/// Adds the stage number and both derived grades as new columns, and writes
/// the capped prerequisite grade back into its column.
pub fn process_grade_recalculation(
    table: &Table,
    use_dynamics: bool,
) -> Result<Table, PipelineError> {
    let mut idx = [0usize; REQUIRED_COLUMNS.len()];
    for (slot, name) in idx.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = table
            .column_index(name)
            .ok_or_else(|| PipelineError::MissingColumn(name.to_string()))?;
    }
    let [name_idx, exam_idx, prereq_idx, input_idx, mid_idx, final_idx] = idx;

    let mut output = table.clone();
    let mut stages = Vec::with_capacity(table.len());
    let mut transfers = Vec::with_capacity(table.len());
    let mut credits = Vec::with_capacity(table.len());

    for row in 0..table.len() {
        let stage = Stage::for_exam(&table.cell(row, name_idx).to_string());
        let input = RecalcInput {
            exam: table.cell(row, exam_idx).as_number(),
            prerequisite: table.cell(row, prereq_idx).as_number(),
            input_control: table.cell(row, input_idx).as_number(),
            mid_control: table.cell(row, mid_idx).as_number(),
            final_control: table.cell(row, final_idx).as_number(),
        };
        let outcome = recalculate(&input, stage, use_dynamics);

        if let Some(prereq) = input.prerequisite {
            output.rows[row][prereq_idx] = Cell::Number(cap_prerequisite(prereq));
        }
        stages.push(Cell::Number(f64::from(stage.number())));
        transfers.push(outcome.transfer.map(Cell::Number).unwrap_or_default());
        credits.push(outcome.exam_credit.map(Cell::Number).unwrap_or_default());
    }

    let transferred = transfers.iter().filter(|c| !c.is_empty()).count();
    let credited = credits.iter().filter(|c| !c.is_empty()).count();
    info!(rows = table.len(), transferred, credited, use_dynamics, "recalculated grades");

    output.set_column(COL_STAGE, stages);
    output.set_column(COL_TRANSFER, transfers);
    output.set_column(COL_EXAM_CREDIT, credits);
    Ok(output)
}

pub const RESULT_SHEET: &str = "Результат";

pub fn result_file_name(stem: &str, date: NaiveDate) -> String {
    format!("Результат_{stem}_{}.xlsx", date.format("%d-%m-%y"))
}
