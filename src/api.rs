//! HTTP entrypoints for triggering a recalculation and reading cached
//! classroom averages.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate;
use crate::config::Settings;
use crate::error::AppError;
use crate::gradebook::Gradebook;
use crate::models::{AverageSummary, ClassroomAverage, SchoolStatistics};
use crate::store::{AverageFilter, AverageStore, ReplaceScope};
use crate::sync;

/// Shared state for all routes. The pool-backed collaborators are built once
/// at startup and handed in here.
pub struct AppState {
    pub gradebook: Arc<dyn Gradebook>,
    pub store: Arc<dyn AverageStore>,
    pub settings: Settings,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/api/recalculate", post(recalculate))
        .route("/api/class-averages", post(class_averages))
        .route("/api/class-averages/save", post(save_averages))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = match &self {
            AppError::InvalidRequest(message) => message.clone(),
            other => other.to_string(),
        };
        (
            status,
            Json(json!({
                "success": false,
                "error": error,
                "timestamp": Utc::now(),
            })),
        )
            .into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    trigger: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    success: bool,
    message: &'static str,
    calculated_averages: usize,
    period: String,
    summary: Vec<AverageSummary>,
    saved: bool,
    timestamp: chrono::DateTime<Utc>,
}

async fn recalculate(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<TriggerRequest>>,
) -> Result<Json<TriggerResponse>, AppError> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    info!(
        trigger = request.trigger.as_deref().unwrap_or("api"),
        "recalculation requested"
    );

    let outcome = sync::recalculate(
        state.gradebook.as_ref(),
        state.store.as_ref(),
        state.settings.store.replace,
        Utc::now(),
    )
    .await?;

    Ok(Json(TriggerResponse {
        success: true,
        message: outcome.message(),
        calculated_averages: outcome.averages.len(),
        summary: outcome.summary(),
        period: outcome.period,
        saved: outcome.saved,
        timestamp: outcome.calculated_at,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AveragesRequest {
    #[serde(default)]
    school_id: Option<Uuid>,
    #[serde(default)]
    classroom_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    include_stats: bool,
    #[serde(default)]
    period: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AveragesResponse {
    success: bool,
    averages: Vec<ClassroomAverage>,
    school_stats: Option<SchoolStatistics>,
}

async fn class_averages(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AveragesRequest>, JsonRejection>,
) -> Result<Json<AveragesResponse>, AppError> {
    let Json(request) =
        payload.map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))?;
    let school_id = request
        .school_id
        .ok_or_else(|| AppError::InvalidRequest("School ID is required".into()))?;

    if let Some(period) = request.period.as_deref() {
        if !aggregate::is_valid_period(period) {
            return Err(AppError::InvalidRequest(format!(
                "period must be YYYY-MM, got '{period}'"
            )));
        }
    }

    let filter = AverageFilter {
        school_id: Some(school_id),
        classroom_ids: request.classroom_ids.unwrap_or_default(),
        period: request.period.clone(),
    };

    let mut averages = state.store.find(&filter).await?;

    if averages.is_empty() && state.settings.sync.auto_sync_on_empty_read {
        info!(%school_id, "no cached averages, running one-time sync");
        match sync::recalculate(
            state.gradebook.as_ref(),
            state.store.as_ref(),
            state.settings.store.replace,
            Utc::now(),
        )
        .await
        {
            Ok(_) => averages = state.store.find(&filter).await?,
            Err(e) => warn!(error = %e, "auto-sync failed"),
        }
    }

    let school_stats = if request.include_stats {
        Some(
            state
                .store
                .school_statistics(school_id, request.period.as_deref())
                .await?,
        )
    } else {
        None
    };

    info!(%school_id, averages = averages.len(), "returning class averages");

    Ok(Json(AveragesResponse {
        success: true,
        averages,
        school_stats,
    }))
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    #[serde(default)]
    calculated_averages: Option<Vec<ClassroomAverage>>,
}

async fn save_averages(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let averages = payload
        .ok()
        .and_then(|Json(request)| request.calculated_averages)
        .ok_or_else(|| AppError::InvalidRequest("Invalid calculated averages data".into()))?;

    for average in &averages {
        aggregate::validate_average(average).map_err(AppError::InvalidRequest)?;
    }

    let Some(period) = averages.first().map(|a| a.period.clone()) else {
        return Ok(Json(json!({
            "success": true,
            "message": "No class averages to save",
            "inserted_count": 0,
        })));
    };
    if averages.iter().any(|a| a.period != period) {
        return Err(AppError::InvalidRequest(
            "calculated averages must all belong to one period".into(),
        ));
    }

    let scope = ReplaceScope::for_averages(state.settings.store.replace, &period, &averages);
    let inserted = state.store.replace(&averages, &scope).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Successfully saved {inserted} class averages"),
        "inserted_count": inserted,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::tests::{sample_progress, StaticGradebook, SCHOOL};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state(records: Vec<crate::models::ProgressRecord>, settings: Settings) -> Arc<AppState> {
        Arc::new(AppState {
            gradebook: Arc::new(StaticGradebook::new(records)),
            store: Arc::new(MemoryStore::new()),
            settings,
        })
    }

    async fn get_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(get_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn trigger_with_empty_body_recalculates() {
        let app = router(test_state(sample_progress(), Settings::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/recalculate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = get_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["calculatedAverages"], 2);
        assert_eq!(json["saved"], true);
        assert_eq!(json["summary"][0]["classroom"], "Algebra");
        assert_eq!(json["summary"][0]["average"], 90.0);
        assert_eq!(json["summary"][1]["reports"], 1);
    }

    #[tokio::test]
    async fn trigger_with_no_data_succeeds() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json("/api/recalculate", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = get_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["calculatedAverages"], 0);
        assert_eq!(json["saved"], false);
    }

    #[tokio::test]
    async fn trigger_reports_read_failure() {
        let state = Arc::new(AppState {
            gradebook: Arc::new(StaticGradebook::unreachable()),
            store: Arc::new(MemoryStore::new()),
            settings: Settings::default(),
        });
        let response = router(state)
            .oneshot(post_json("/api/recalculate", json!({ "trigger": "manual" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = get_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn read_requires_school_id() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json("/api/class-averages", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(get_json(response).await["error"], "School ID is required");
    }

    #[tokio::test]
    async fn read_rejects_malformed_period() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json(
                "/api/class-averages",
                json!({ "schoolId": SCHOOL, "period": "March" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn read_returns_cached_averages_with_stats() {
        let state = test_state(sample_progress(), Settings::default());
        router(state.clone())
            .oneshot(post_json("/api/recalculate", json!({})))
            .await
            .unwrap();

        let response = router(state)
            .oneshot(post_json(
                "/api/class-averages",
                json!({ "schoolId": SCHOOL, "includeStats": true }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = get_json(response).await;
        let averages = json["averages"].as_array().unwrap();
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0]["average_grade"], 90.0);
        assert_eq!(averages[0]["grade_distribution"]["excellent"], 1);
        assert_eq!(json["schoolStats"]["total_classrooms"], 2);
        assert_eq!(json["schoolStats"]["overall_average"], 75.0);
        assert_eq!(json["schoolStats"]["needs_improvement_total"], 1);
    }

    #[tokio::test]
    async fn read_filters_by_classroom() {
        let state = test_state(sample_progress(), Settings::default());
        router(state.clone())
            .oneshot(post_json("/api/recalculate", json!({})))
            .await
            .unwrap();

        let response = router(state)
            .oneshot(post_json(
                "/api/class-averages",
                json!({ "schoolId": SCHOOL, "classroomIds": [Uuid::from_u128(0xb)] }),
            ))
            .await
            .unwrap();

        let json = get_json(response).await;
        let averages = json["averages"].as_array().unwrap();
        assert_eq!(averages.len(), 1);
        assert_eq!(averages[0]["classroom_name"], "Biology");
        assert!(json["schoolStats"].is_null());
    }

    #[tokio::test]
    async fn empty_read_stays_empty_without_auto_sync() {
        let app = router(test_state(sample_progress(), Settings::default()));
        let response = app
            .oneshot(post_json("/api/class-averages", json!({ "schoolId": SCHOOL })))
            .await
            .unwrap();
        let json = get_json(response).await;
        assert!(json["averages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_read_triggers_auto_sync_when_enabled() {
        let mut settings = Settings::default();
        settings.sync.auto_sync_on_empty_read = true;
        let app = router(test_state(sample_progress(), settings));

        let response = app
            .oneshot(post_json("/api/class-averages", json!({ "schoolId": SCHOOL })))
            .await
            .unwrap();
        let json = get_json(response).await;
        assert_eq!(json["averages"].as_array().unwrap().len(), 2);
    }

    fn saved_average(excellent: i64, total_reports: i64) -> Value {
        json!({
            "classroom_id": Uuid::from_u128(0xc),
            "classroom_name": "Chemistry",
            "school_id": SCHOOL,
            "average_grade": 93.5,
            "total_students": 1,
            "total_reports": total_reports,
            "grade_distribution": {
                "excellent": excellent,
                "good": 0,
                "satisfactory": 0,
                "needs_improvement": 0
            },
            "last_updated": "2026-03-20T12:00:00Z",
            "period": "2026-03"
        })
    }

    #[tokio::test]
    async fn save_stores_precomputed_averages() {
        let state = test_state(Vec::new(), Settings::default());
        let response = router(state.clone())
            .oneshot(post_json(
                "/api/class-averages/save",
                json!({ "calculated_averages": [saved_average(2, 2)] }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(get_json(response).await["inserted_count"], 1);

        let stored = state.store.find(&AverageFilter::school(SCHOOL)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].classroom_name, "Chemistry");
    }

    #[tokio::test]
    async fn save_rejects_inconsistent_distribution() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json(
                "/api/class-averages/save",
                json!({ "calculated_averages": [saved_average(1, 2)] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn save_requires_payload() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json("/api/class-averages/save", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            get_json(response).await["error"],
            "Invalid calculated averages data"
        );
    }

    #[tokio::test]
    async fn save_rejects_negative_counts() {
        let state = test_state(Vec::new(), Settings::default());
        let mut average = saved_average(3, 1);
        average["total_students"] = json!(-7);
        average["grade_distribution"]["good"] = json!(-2);

        let response = router(state.clone())
            .oneshot(post_json(
                "/api/class-averages/save",
                json!({ "calculated_averages": [average] }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(get_json(response).await["success"], false);
        let stored = state.store.find(&AverageFilter::school(SCHOOL)).await.unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn save_rejects_malformed_averages_as_json() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json(
                "/api/class-averages/save",
                json!({ "calculated_averages": "nope" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = get_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Invalid calculated averages data");
    }

    #[tokio::test]
    async fn read_rejects_malformed_school_id_as_json() {
        let app = router(test_state(Vec::new(), Settings::default()));
        let response = app
            .oneshot(post_json(
                "/api/class-averages",
                json!({ "schoolId": "school-1" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = get_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().is_some_and(|e| !e.is_empty()));
    }
}
