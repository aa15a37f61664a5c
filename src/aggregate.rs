use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::models::{ClassroomAverage, ClassroomRef, GradeDistribution, ProgressRecord, SchoolStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeBand {
    Excellent,
    Good,
    Satisfactory,
    NeedsImprovement,
}

pub fn grade_band(grade: f64) -> GradeBand {
    if grade >= 90.0 {
        GradeBand::Excellent
    } else if grade >= 80.0 {
        GradeBand::Good
    } else if grade >= 70.0 {
        GradeBand::Satisfactory
    } else {
        GradeBand::NeedsImprovement
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `YYYY-MM` bucket a calculation at `at` belongs to.
pub fn period_for(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub fn is_valid_period(period: &str) -> bool {
    period.len() == 7
        && chrono::NaiveDate::parse_from_str(&format!("{period}-01"), "%Y-%m-%d").is_ok()
}

struct ClassroomGroup<'a> {
    classroom: &'a ClassroomRef,
    grades: Vec<f64>,
    students: HashSet<Uuid>,
}

fn grade_problem(grade: f64) -> Option<&'static str> {
    if !grade.is_finite() {
        Some("not a finite number")
    } else if !(0.0..=100.0).contains(&grade) {
        Some("outside 0-100")
    } else {
        None
    }
}

fn usable_grade(record: &ProgressRecord) -> Option<f64> {
    let grade = record.grade?;
    let Some(reason) = grade_problem(grade) else {
        return Some(grade);
    };
    warn!(
        classroom_id = %record.classroom_id,
        student_id = %record.student_id,
        grade,
        reason,
        "skipping progress record with unusable grade"
    );
    None
}

/// Group progress records by classroom and compute one average per
/// classroom that has at least one usable grade. Records without a grade or
/// without a resolved classroom are ignored.
pub fn calculate_averages(
    records: &[ProgressRecord],
    calculated_at: DateTime<Utc>,
) -> Vec<ClassroomAverage> {
    let period = period_for(calculated_at);
    let mut groups: BTreeMap<Uuid, ClassroomGroup<'_>> = BTreeMap::new();

    for record in records {
        let Some(classroom) = record.classroom.as_ref() else {
            continue;
        };
        let Some(grade) = usable_grade(record) else {
            continue;
        };

        let entry = groups
            .entry(record.classroom_id)
            .or_insert_with(|| ClassroomGroup {
                classroom,
                grades: Vec::new(),
                students: HashSet::new(),
            });
        entry.grades.push(grade);
        entry.students.insert(record.student_id);
    }

    groups
        .into_iter()
        .filter(|(_, group)| !group.grades.is_empty())
        .map(|(classroom_id, group)| {
            let mut distribution = GradeDistribution::default();
            for grade in &group.grades {
                match grade_band(*grade) {
                    GradeBand::Excellent => distribution.excellent += 1,
                    GradeBand::Good => distribution.good += 1,
                    GradeBand::Satisfactory => distribution.satisfactory += 1,
                    GradeBand::NeedsImprovement => distribution.needs_improvement += 1,
                }
            }

            let total: f64 = group.grades.iter().sum();
            ClassroomAverage {
                classroom_id,
                classroom_name: group.classroom.name.clone(),
                school_id: group.classroom.school_id,
                average_grade: round2(total / group.grades.len() as f64),
                total_students: group.students.len() as i64,
                total_reports: group.grades.len() as i64,
                grade_distribution: distribution,
                last_updated: calculated_at,
                period: period.clone(),
            }
        })
        .collect()
}

/// Check a precomputed average against the aggregation invariants.
pub fn validate_average(average: &ClassroomAverage) -> Result<(), String> {
    if !average.average_grade.is_finite() || !(0.0..=100.0).contains(&average.average_grade) {
        return Err(format!(
            "classroom {}: average_grade {} is outside 0-100",
            average.classroom_id, average.average_grade
        ));
    }
    if average.total_reports < 1 {
        return Err(format!(
            "classroom {}: total_reports must be positive",
            average.classroom_id
        ));
    }
    if average.total_students < 1 {
        return Err(format!(
            "classroom {}: total_students must be positive",
            average.classroom_id
        ));
    }
    if let Some(band) = average.grade_distribution.negative_band() {
        return Err(format!(
            "classroom {}: {band} count is negative",
            average.classroom_id
        ));
    }
    if average.total_students > average.total_reports {
        return Err(format!(
            "classroom {}: total_students exceeds total_reports",
            average.classroom_id
        ));
    }
    if average.grade_distribution.checked_total() != Some(average.total_reports) {
        return Err(format!(
            "classroom {}: grade distribution does not sum to total_reports",
            average.classroom_id
        ));
    }
    if !is_valid_period(&average.period) {
        return Err(format!(
            "classroom {}: period '{}' is not YYYY-MM",
            average.classroom_id, average.period
        ));
    }
    Ok(())
}

pub fn school_statistics(averages: &[ClassroomAverage]) -> SchoolStatistics {
    if averages.is_empty() {
        return SchoolStatistics::default();
    }

    let mut stats = SchoolStatistics {
        total_classrooms: averages.len() as i64,
        ..SchoolStatistics::default()
    };
    let mut grade_sum = 0.0;

    for average in averages {
        grade_sum += average.average_grade;
        let dist = average.grade_distribution;
        stats.total_students = stats.total_students.saturating_add(average.total_students);
        stats.total_reports = stats.total_reports.saturating_add(average.total_reports);
        stats.excellent_total = stats.excellent_total.saturating_add(dist.excellent);
        stats.good_total = stats.good_total.saturating_add(dist.good);
        stats.satisfactory_total = stats.satisfactory_total.saturating_add(dist.satisfactory);
        stats.needs_improvement_total =
            stats.needs_improvement_total.saturating_add(dist.needs_improvement);
    }

    stats.overall_average = round2(grade_sum / averages.len() as f64);
    stats
}
