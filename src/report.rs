use std::fmt::Write;

use uuid::Uuid;

use crate::models::{ClassroomAverage, SchoolStatistics};

fn share(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Classrooms where at least a third of reports fall below 70, worst first.
pub fn needs_attention(averages: &[ClassroomAverage]) -> Vec<&ClassroomAverage> {
    let mut flagged: Vec<&ClassroomAverage> = averages
        .iter()
        .filter(|a| share(a.grade_distribution.needs_improvement, a.total_reports) >= 100.0 / 3.0)
        .collect();

    flagged.sort_by(|a, b| {
        share(b.grade_distribution.needs_improvement, b.total_reports)
            .partial_cmp(&share(a.grade_distribution.needs_improvement, a.total_reports))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    flagged
}

pub fn build_report(
    school_id: Uuid,
    period: Option<&str>,
    averages: &[ClassroomAverage],
    stats: &SchoolStatistics,
) -> String {
    let mut output = String::new();
    let period_label = period.unwrap_or("all periods");

    let _ = writeln!(output, "# Classroom Averages Report");
    let _ = writeln!(output, "Generated for school {} ({})", school_id, period_label);
    let _ = writeln!(output);
    let _ = writeln!(output, "## School Overview");

    if stats.total_classrooms == 0 {
        let _ = writeln!(output, "No class averages calculated yet.");
        return output;
    }

    let _ = writeln!(
        output,
        "- {} classrooms, overall average {:.2}",
        stats.total_classrooms, stats.overall_average
    );
    let _ = writeln!(
        output,
        "- {} students across {} progress reports",
        stats.total_students, stats.total_reports
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Grade Bands");
    for (label, count) in [
        ("Excellent (90+)", stats.excellent_total),
        ("Good (80-89)", stats.good_total),
        ("Satisfactory (70-79)", stats.satisfactory_total),
        ("Needs improvement (<70)", stats.needs_improvement_total),
    ] {
        let _ = writeln!(
            output,
            "- {}: {} ({:.1}%)",
            label,
            count,
            share(count, stats.total_reports)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Classrooms");
    for average in averages {
        let _ = writeln!(
            output,
            "- {} [{}]: {:.2} across {} reports from {} students",
            average.classroom_name,
            average.period,
            average.average_grade,
            average.total_reports,
            average.total_students
        );
    }

    let flagged = needs_attention(averages);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Attention");

    if flagged.is_empty() {
        let _ = writeln!(output, "No classrooms with a high share of low grades.");
    } else {
        for average in flagged {
            let _ = writeln!(
                output,
                "- {}: {} of {} reports below 70",
                average.classroom_name,
                average.grade_distribution.needs_improvement,
                average.total_reports
            );
        }
    }

    output
}
