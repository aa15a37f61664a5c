use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{ClassroomAverage, ClassroomRef, ProgressRecord};

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> Result<()> {
    let school_id = Uuid::parse_str("7b1c2a9e-0f43-4d55-9a61-0d8a5e3c6f10")
        .map_err(|e| AppError::Config(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO school_progress.schools (id, name)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
        "#,
    )
    .bind(school_id)
    .bind("Northside Academy")
    .execute(pool)
    .await?;

    let classrooms = vec![
        ("2f0d3c57-8d8a-4b8f-a9c4-5a3f1b6e7d21", "Algebra I"),
        ("9e4b6a12-3c5d-4e7f-8a9b-0c1d2e3f4a5b", "Biology"),
        ("c8a7b6d5-e4f3-4a2b-9c1d-0e9f8a7b6c5d", "World History"),
    ];

    for (id, name) in &classrooms {
        sqlx::query(
            r#"
            INSERT INTO school_progress.classrooms (id, name, school_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, school_id = EXCLUDED.school_id
            "#,
        )
        .bind(Uuid::parse_str(id).map_err(|e| AppError::Config(e.to_string()))?)
        .bind(*name)
        .bind(school_id)
        .execute(pool)
        .await?;
    }

    let students = vec![
        ("Avery Lee", "avery.lee@northside.edu"),
        ("Jules Moreno", "jules.moreno@northside.edu"),
        ("Kiara Patel", "kiara.patel@northside.edu"),
    ];

    let mut student_ids = Vec::new();
    for (name, email) in students {
        student_ids.push(upsert_student(pool, name, email).await?);
    }

    let progress = vec![
        ("seed-001", 0, 0, 95.0, (2026, 2, 2)),
        ("seed-002", 1, 0, 85.0, (2026, 2, 2)),
        ("seed-003", 2, 0, 78.0, (2026, 2, 3)),
        ("seed-004", 0, 1, 91.0, (2026, 2, 5)),
        ("seed-005", 1, 1, 64.0, (2026, 2, 5)),
        ("seed-006", 2, 2, 88.5, (2026, 2, 9)),
        ("seed-007", 2, 2, 72.0, (2026, 2, 16)),
    ];

    for (source_key, student, classroom, grade, (y, m, d)) in progress {
        let report_date = NaiveDate::from_ymd_opt(y, m, d)
            .ok_or_else(|| AppError::Config(format!("invalid seed date {y}-{m}-{d}")))?;
        let classroom_id =
            Uuid::parse_str(classrooms[classroom].0).map_err(|e| AppError::Config(e.to_string()))?;
        insert_progress(
            pool,
            student_ids[student],
            classroom_id,
            Some(grade),
            report_date,
            source_key,
        )
        .await?;
    }

    Ok(())
}

async fn upsert_student(pool: &PgPool, full_name: &str, email: &str) -> Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO school_progress.students (id, full_name, email)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(full_name)
    .bind(email)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Returns whether a new row was written; rows with a known source key are
/// left alone.
async fn insert_progress(
    pool: &PgPool,
    student_id: Uuid,
    classroom_id: Uuid,
    grade: Option<f64>,
    report_date: NaiveDate,
    source_key: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO school_progress.progress
        (id, student_id, classroom_id, grade, report_date, source_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(classroom_id)
    .bind(grade)
    .bind(report_date)
    .bind(source_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Progress rows with a grade, joined with their classroom. The join is a
/// LEFT JOIN so rows pointing at a missing classroom come back unresolved.
pub async fn fetch_progress(pool: &PgPool) -> Result<Vec<ProgressRecord>> {
    let rows = sqlx::query(
        "SELECT p.student_id, p.classroom_id, p.grade::float8 AS grade, p.report_date, \
         c.name AS classroom_name, c.school_id \
         FROM school_progress.progress p \
         LEFT JOIN school_progress.classrooms c ON c.id = p.classroom_id \
         WHERE p.grade IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let classroom_name: Option<String> = row.try_get("classroom_name")?;
        let school_id: Option<Uuid> = row.try_get("school_id")?;
        let classroom = match (classroom_name, school_id) {
            (Some(name), Some(school_id)) => Some(ClassroomRef { name, school_id }),
            _ => None,
        };

        records.push(ProgressRecord {
            student_id: row.try_get("student_id")?,
            classroom_id: row.try_get("classroom_id")?,
            grade: row.try_get("grade")?,
            report_date: row.try_get("report_date")?,
            classroom,
        });
    }

    Ok(records)
}

/// Upsert the relational summary cache. Failures are logged per classroom
/// and counted; they never abort the batch.
pub async fn upsert_cache(pool: &PgPool, averages: &[ClassroomAverage]) -> usize {
    let mut failures = 0usize;

    for average in averages {
        let result = sqlx::query(
            r#"
            INSERT INTO school_progress.class_averages_cache
            (classroom_id, period, average_grade, total_students, total_reports, last_calculated)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (classroom_id, period) DO UPDATE
            SET average_grade = EXCLUDED.average_grade,
                total_students = EXCLUDED.total_students,
                total_reports = EXCLUDED.total_reports,
                last_calculated = EXCLUDED.last_calculated
            "#,
        )
        .bind(average.classroom_id)
        .bind(&average.period)
        .bind(average.average_grade)
        .bind(average.total_students)
        .bind(average.total_reports)
        .bind(average.last_updated)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(classroom_id = %average.classroom_id, error = %e, "failed to update averages cache");
            failures += 1;
        }
    }

    failures
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        email: String,
        classroom_id: Uuid,
        grade: Option<f64>,
        report_date: NaiveDate,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let student_id = upsert_student(pool, &row.full_name, &row.email).await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if insert_progress(
            pool,
            student_id,
            row.classroom_id,
            row.grade,
            row.report_date,
            &source_key,
        )
        .await?
        {
            inserted += 1;
        }
    }

    info!(inserted, path = %csv_path.display(), "imported progress rows");
    Ok(inserted)
}
