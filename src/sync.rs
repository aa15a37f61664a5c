use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::aggregate;
use crate::config::ReplaceMode;
use crate::error::Result;
use crate::gradebook::Gradebook;
use crate::models::{AverageSummary, ClassroomAverage};
use crate::store::{AverageStore, ReplaceScope};

#[derive(Debug, Clone)]
pub struct Recalculation {
    pub period: String,
    pub records_read: usize,
    pub latest_report_date: Option<NaiveDate>,
    pub averages: Vec<ClassroomAverage>,
    /// Whether the averages reached the document store. Always false when
    /// nothing was calculated.
    pub saved: bool,
    pub calculated_at: DateTime<Utc>,
}

impl Recalculation {
    pub fn message(&self) -> &'static str {
        if self.records_read == 0 {
            "No progress data to calculate averages from"
        } else if self.averages.is_empty() {
            "No valid class averages could be calculated"
        } else if self.saved {
            "Successfully calculated and saved class averages"
        } else {
            "Calculated class averages but failed to save them"
        }
    }

    pub fn summary(&self) -> Vec<AverageSummary> {
        self.averages.iter().map(AverageSummary::from).collect()
    }
}

/// Recompute every classroom average from scratch and push the result into
/// `store`. A failed read aborts the run; a failed store write is reported
/// through [`Recalculation::saved`].
pub async fn recalculate(
    gradebook: &dyn Gradebook,
    store: &dyn AverageStore,
    mode: ReplaceMode,
    now: DateTime<Utc>,
) -> Result<Recalculation> {
    let period = aggregate::period_for(now);
    info!(%period, "starting class averages calculation");

    let records = gradebook.fetch_progress().await?;
    let averages = aggregate::calculate_averages(&records, now);

    let mut outcome = Recalculation {
        period,
        records_read: records.len(),
        latest_report_date: records.iter().map(|r| r.report_date).max(),
        averages,
        saved: false,
        calculated_at: now,
    };

    if outcome.averages.is_empty() {
        warn!(records = outcome.records_read, "no class averages calculated");
        return Ok(outcome);
    }

    for average in &outcome.averages {
        info!(
            classroom = %average.classroom_name,
            average = average.average_grade,
            reports = average.total_reports,
            students = average.total_students,
            "calculated classroom average"
        );
    }

    let scope = ReplaceScope::for_averages(mode, &outcome.period, &outcome.averages);
    match store.replace(&outcome.averages, &scope).await {
        Ok(inserted) => {
            info!(inserted, "saved class averages");
            outcome.saved = true;
        }
        Err(e) => error!(error = %e, "failed to save class averages"),
    }

    gradebook.write_cache(&outcome.averages).await;

    Ok(outcome)
}
