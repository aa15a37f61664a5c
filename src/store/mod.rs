//! Document collection holding the computed classroom averages.
//!
//! The collection is a read cache: every recalculation replaces some slice of
//! it (selected by [`ReplaceScope`]) and readers only ever see what the last
//! replace left behind.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate;
use crate::config::ReplaceMode;
use crate::error::Result;
use crate::models::{ClassroomAverage, SchoolStatistics};

pub use memory::MemoryStore;
pub use postgres::PgAverageStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceScope {
    All,
    Period(String),
    Classrooms {
        period: String,
        classroom_ids: Vec<Uuid>,
    },
}

impl ReplaceScope {
    pub fn for_averages(mode: ReplaceMode, period: &str, averages: &[ClassroomAverage]) -> Self {
        match mode {
            ReplaceMode::All => Self::All,
            ReplaceMode::Period => Self::Period(period.to_string()),
            ReplaceMode::Classrooms => Self::Classrooms {
                period: period.to_string(),
                classroom_ids: averages.iter().map(|a| a.classroom_id).collect(),
            },
        }
    }

    pub fn covers(&self, average: &ClassroomAverage) -> bool {
        match self {
            Self::All => true,
            Self::Period(period) => &average.period == period,
            Self::Classrooms {
                period,
                classroom_ids,
            } => &average.period == period && classroom_ids.contains(&average.classroom_id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AverageFilter {
    pub school_id: Option<Uuid>,
    pub classroom_ids: Vec<Uuid>,
    pub period: Option<String>,
}

impl AverageFilter {
    pub fn school(school_id: Uuid) -> Self {
        Self {
            school_id: Some(school_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, average: &ClassroomAverage) -> bool {
        self.school_id.map_or(true, |id| id == average.school_id)
            && (self.classroom_ids.is_empty() || self.classroom_ids.contains(&average.classroom_id))
            && self
                .period
                .as_deref()
                .map_or(true, |period| period == average.period)
    }
}

#[async_trait]
pub trait AverageStore: Send + Sync {
    /// Remove every stored average covered by `scope`, then insert
    /// `averages`. Returns the number of documents inserted.
    async fn replace(&self, averages: &[ClassroomAverage], scope: &ReplaceScope) -> Result<usize>;

    /// Stored averages matching `filter`, highest average first.
    async fn find(&self, filter: &AverageFilter) -> Result<Vec<ClassroomAverage>>;

    async fn school_statistics(
        &self,
        school_id: Uuid,
        period: Option<&str>,
    ) -> Result<SchoolStatistics> {
        let filter = AverageFilter {
            period: period.map(str::to_string),
            ..AverageFilter::school(school_id)
        };
        let averages = self.find(&filter).await?;
        Ok(aggregate::school_statistics(&averages))
    }
}

pub(crate) fn sort_by_average_desc(averages: &mut [ClassroomAverage]) {
    averages.sort_by(|a, b| {
        b.average_grade
            .partial_cmp(&a.average_grade)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
