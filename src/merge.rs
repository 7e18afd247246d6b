//! Layering of institutional grade tables over freshly computed rows.
//!
//! The row set always comes from the upload; an external table can only
//! overwrite the grade of a row whose `(email, discipline)` key it holds.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::clean::is_valid_grade;
use crate::models::{AssessmentRow, Cell, GradeObservation};

/// An external grade table in override order.
#[derive(Debug, Clone)]
pub struct GradeSource {
    pub name: String,
    pub observations: Vec<GradeObservation>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayStats {
    pub replaced: usize,
    pub dropped: usize,
}

/// Collapses repeated keys, keeping the first occurrence.
pub fn dedupe_rows(rows: Vec<AssessmentRow>) -> (Vec<AssessmentRow>, usize) {
    let mut seen = HashSet::new();
    let before = rows.len();
    let kept: Vec<AssessmentRow> = rows.into_iter().filter(|row| seen.insert(row.key())).collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Drops rows whose grade is blank, missing, or `nan`.
pub fn retain_valid(rows: &mut Vec<AssessmentRow>) -> usize {
    let before = rows.len();
    rows.retain(|row| is_valid_grade(&row.grade));
    before - rows.len()
}

/// Left-joins `source` onto `rows` and coalesces the grade.
///
/// A source entry with a missing grade leaves the row untouched; a blank or
/// `nan` text grade replaces it and the row is then filtered out. Repeated
/// keys in the source resolve to their first entry.
pub fn overlay_grades(
    rows: Vec<AssessmentRow>,
    source: &[GradeObservation],
) -> (Vec<AssessmentRow>, OverlayStats) {
    let mut lookup: HashMap<(String, String), &Cell> = HashMap::new();
    for obs in source {
        lookup.entry(obs.key()).or_insert(&obs.grade);
    }

    let mut stats = OverlayStats::default();
    let mut merged: Vec<AssessmentRow> = rows
        .into_iter()
        .map(|mut row| {
            if let Some(grade) = lookup.get(&row.key()) {
                if !grade.is_empty() {
                    if **grade != row.grade {
                        stats.replaced += 1;
                    }
                    row.grade = (*grade).clone();
                }
            }
            row
        })
        .collect();

    stats.dropped = retain_valid(&mut merged);
    (merged, stats)
}

/// Applies each source in order, so a later source wins over an earlier one
/// and every source wins over the upload. Progress goes to `log`.
pub fn apply_priority(
    mut rows: Vec<AssessmentRow>,
    sources: &[GradeSource],
    log: &mut Vec<String>,
) -> Vec<AssessmentRow> {
    for source in sources {
        if source.observations.is_empty() {
            log.push(format!(
                "Table {} is empty, keeping current grades.",
                source.name
            ));
            continue;
        }

        let (merged, stats) = overlay_grades(rows, &source.observations);
        rows = merged;
        info!(
            source = %source.name,
            replaced = stats.replaced,
            dropped = stats.dropped,
            "applied grade overlay"
        );
        if stats.dropped > 0 {
            warn!(source = %source.name, dropped = stats.dropped, "overlay left blank grades");
        }
        log.push(format!(
            "Checked {} ({} records): {} grades replaced, {} rows dropped with blank grades.",
            source.name,
            source.observations.len(),
            stats.replaced,
            stats.dropped
        ));
    }
    rows
}

/// Rows whose key is not yet present in `existing`.
pub fn new_records(rows: &[AssessmentRow], existing: &[GradeObservation]) -> Vec<AssessmentRow> {
    let known: HashSet<(String, String)> = existing.iter().map(GradeObservation::key).collect();
    rows.iter()
        .filter(|row| !known.contains(&row.key()))
        .cloned()
        .collect()
}
