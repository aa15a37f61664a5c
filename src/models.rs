use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classroom metadata joined onto a progress row. `None` on the record means
/// the classroom relation did not resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassroomRef {
    pub name: String,
    pub school_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub student_id: Uuid,
    pub classroom_id: Uuid,
    pub grade: Option<f64>,
    pub report_date: NaiveDate,
    pub classroom: Option<ClassroomRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeDistribution {
    pub excellent: i64,
    pub good: i64,
    pub satisfactory: i64,
    pub needs_improvement: i64,
}

impl GradeDistribution {
    /// Sum of all bands, `None` on overflow.
    pub fn checked_total(&self) -> Option<i64> {
        self.excellent
            .checked_add(self.good)?
            .checked_add(self.satisfactory)?
            .checked_add(self.needs_improvement)
    }

    fn counts(&self) -> [(&'static str, i64); 4] {
        [
            ("excellent", self.excellent),
            ("good", self.good),
            ("satisfactory", self.satisfactory),
            ("needs_improvement", self.needs_improvement),
        ]
    }

    /// First band holding a negative count.
    pub fn negative_band(&self) -> Option<&'static str> {
        self.counts()
            .into_iter()
            .find(|(_, count)| *count < 0)
            .map(|(band, _)| band)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassroomAverage {
    pub classroom_id: Uuid,
    pub classroom_name: String,
    pub school_id: Uuid,
    pub average_grade: f64,
    pub total_students: i64,
    pub total_reports: i64,
    pub grade_distribution: GradeDistribution,
    pub last_updated: DateTime<Utc>,
    pub period: String,
}

/// Shape of a classroom average as kept in the document collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AverageDocument {
    pub classroom_id: Uuid,
    pub classroom_name: String,
    pub school_id: Uuid,
    pub average_grade: f64,
    pub total_students: i64,
    pub total_reports: i64,
    pub excellent_count: i64,
    pub good_count: i64,
    pub satisfactory_count: i64,
    pub needs_improvement_count: i64,
    pub last_updated: DateTime<Utc>,
    pub period: String,
    pub created_at: DateTime<Utc>,
}

impl AverageDocument {
    pub fn from_average(average: &ClassroomAverage, created_at: DateTime<Utc>) -> Self {
        let dist = average.grade_distribution;
        Self {
            classroom_id: average.classroom_id,
            classroom_name: average.classroom_name.clone(),
            school_id: average.school_id,
            average_grade: average.average_grade,
            total_students: average.total_students,
            total_reports: average.total_reports,
            excellent_count: dist.excellent,
            good_count: dist.good,
            satisfactory_count: dist.satisfactory,
            needs_improvement_count: dist.needs_improvement,
            last_updated: average.last_updated,
            period: average.period.clone(),
            created_at,
        }
    }
}

impl From<AverageDocument> for ClassroomAverage {
    fn from(doc: AverageDocument) -> Self {
        Self {
            classroom_id: doc.classroom_id,
            classroom_name: doc.classroom_name,
            school_id: doc.school_id,
            average_grade: doc.average_grade,
            total_students: doc.total_students,
            total_reports: doc.total_reports,
            grade_distribution: GradeDistribution {
                excellent: doc.excellent_count,
                good: doc.good_count,
                satisfactory: doc.satisfactory_count,
                needs_improvement: doc.needs_improvement_count,
            },
            last_updated: doc.last_updated,
            period: doc.period,
        }
    }
}

/// School-wide rollup over cached classroom averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolStatistics {
    pub total_classrooms: i64,
    pub overall_average: f64,
    pub total_students: i64,
    pub total_reports: i64,
    pub excellent_total: i64,
    pub good_total: i64,
    pub satisfactory_total: i64,
    pub needs_improvement_total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AverageSummary {
    pub classroom: String,
    pub average: f64,
    pub students: i64,
    pub reports: i64,
}

impl From<&ClassroomAverage> for AverageSummary {
    fn from(average: &ClassroomAverage) -> Self {
        Self {
            classroom: average.classroom_name.clone(),
            average: average.average_grade,
            students: average.total_students,
            reports: average.total_reports,
        }
    }
}
