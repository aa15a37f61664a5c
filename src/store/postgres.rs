use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AverageFilter, AverageStore, ReplaceScope};
use crate::error::{AppError, Result};
use crate::models::{AverageDocument, ClassroomAverage};

/// JSONB document collection in Postgres. Filter columns are duplicated out
/// of the document so reads and scoped deletes can use indexes.
#[derive(Debug, Clone)]
pub struct PgAverageStore {
    pool: PgPool,
}

impl PgAverageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AverageStore for PgAverageStore {
    async fn replace(&self, averages: &[ClassroomAverage], scope: &ReplaceScope) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let deleted = match scope {
            ReplaceScope::All => {
                sqlx::query("DELETE FROM school_progress.class_average_documents")
                    .execute(&mut *tx)
                    .await?
            }
            ReplaceScope::Period(period) => {
                sqlx::query("DELETE FROM school_progress.class_average_documents WHERE period = $1")
                    .bind(period)
                    .execute(&mut *tx)
                    .await?
            }
            ReplaceScope::Classrooms {
                period,
                classroom_ids,
            } => {
                sqlx::query(
                    "DELETE FROM school_progress.class_average_documents \
                     WHERE period = $1 AND classroom_id = ANY($2)",
                )
                .bind(period)
                .bind(classroom_ids)
                .execute(&mut *tx)
                .await?
            }
        };
        debug!(deleted = deleted.rows_affected(), ?scope, "cleared stored averages");

        let created_at = Utc::now();
        let mut inserted = 0usize;

        for average in averages {
            let document = AverageDocument::from_average(average, created_at);
            sqlx::query(
                r#"
                INSERT INTO school_progress.class_average_documents
                (id, classroom_id, school_id, period, average_grade, document, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(document.classroom_id)
            .bind(document.school_id)
            .bind(&document.period)
            .bind(document.average_grade)
            .bind(Json(&document))
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
            inserted += 1;
        }

        tx.commit().await?;
        info!(inserted, "stored classroom averages");
        Ok(inserted)
    }

    async fn find(&self, filter: &AverageFilter) -> Result<Vec<ClassroomAverage>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT document FROM school_progress.class_average_documents WHERE TRUE",
        );

        if let Some(school_id) = filter.school_id {
            query.push(" AND school_id = ").push_bind(school_id);
        }
        if !filter.classroom_ids.is_empty() {
            query
                .push(" AND classroom_id = ANY(")
                .push_bind(filter.classroom_ids.clone())
                .push(")");
        }
        if let Some(period) = &filter.period {
            query.push(" AND period = ").push_bind(period.clone());
        }
        query.push(" ORDER BY average_grade DESC, created_at DESC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut averages = Vec::with_capacity(rows.len());

        for row in rows {
            let Json(document): Json<AverageDocument> = row
                .try_get("document")
                .map_err(|e| AppError::Store(format!("malformed average document: {e}")))?;
            averages.push(ClassroomAverage::from(document));
        }

        Ok(averages)
    }
}
