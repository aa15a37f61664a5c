use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

use crate::db;
use crate::error::{AppError, Result};
use crate::models::{ClassroomAverage, ProgressRecord};

/// Source of progress records, plus the relational summary cache that sits
/// next to them.
#[async_trait]
pub trait Gradebook: Send + Sync {
    async fn fetch_progress(&self) -> Result<Vec<ProgressRecord>>;

    /// Mirror freshly computed averages into the relational cache. Returns
    /// how many classrooms failed to update.
    async fn write_cache(&self, averages: &[ClassroomAverage]) -> usize;
}

#[derive(Debug, Clone)]
pub struct PgGradebook {
    pool: PgPool,
}

impl PgGradebook {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Gradebook for PgGradebook {
    async fn fetch_progress(&self) -> Result<Vec<ProgressRecord>> {
        db::fetch_progress(&self.pool)
            .await
            .map_err(|e| AppError::ProgressRead(e.to_string()))
    }

    async fn write_cache(&self, averages: &[ClassroomAverage]) -> usize {
        let failures = db::upsert_cache(&self.pool, averages).await;
        if failures > 0 {
            warn!(failures, "averages cache partially updated");
        }
        failures
    }
}
