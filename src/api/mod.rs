//! Thin `axum` wrapper over the core engines (component C and D). Handlers
//! take `State<AppState>` plus `Json`/`Query`/`Path` extractors and return
//! `Result<(StatusCode, Json<T>), ApiError>`, so every taxonomy-to-status
//! mapping lives in one place (`ApiError::into_response`) instead of being
//! scattered across handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::errors::PipelineError;
use crate::ingest::IngestionEngine;
use crate::middleware::logging::request_logging;
use crate::models::{
    Allocation, BatchResult, CandidateExecution, ExecutionsPage, Pagination, SendResult,
    SendStatus,
};
use crate::send::SendEngine;
use crate::store::AllocationStore;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AllocationStore>,
    pub ingestion: Arc<IngestionEngine>,
    pub send_engine: Arc<SendEngine>,
}

/// Maps the core error taxonomy (design doc §7) to an HTTP status, one arm
/// per variant instead of a `match` repeated in every handler.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound => StatusCode::NOT_FOUND,
            PipelineError::AlreadyExists => StatusCode::CONFLICT,
            PipelineError::WindowContended => StatusCode::CONFLICT,
            PipelineError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Transient(_)
            | PipelineError::PermanentRemote(_)
            | PipelineError::NotResolvable(_)
            | PipelineError::Decode(_)
            | PipelineError::CliFailure(_)
            | PipelineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/executions", get(list_executions).post(post_executions))
        .route("/executions/send", post(post_send))
        .route("/executions/:id", get(get_execution))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub fn router_with_request_logging(state: AppState) -> Router {
    build_router(state).layer(axum::middleware::from_fn(request_logging))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<(StatusCode, Json<ExecutionsPage>), ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(PipelineError::Validation(format!(
            "limit must be in [1, {MAX_LIST_LIMIT}]"
        ))
        .into());
    }
    if offset < 0 {
        return Err(PipelineError::Validation("offset must be >= 0".to_string()).into());
    }

    let (executions, total) = state.store.list_paged(limit, offset).await?;
    Ok((
        StatusCode::OK,
        Json(ExecutionsPage {
            executions,
            pagination: Pagination {
                limit,
                offset,
                total,
            },
        }),
    ))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Allocation>), ApiError> {
    let allocation = state.store.find_by_id(id).await?;
    Ok((StatusCode::OK, Json(allocation)))
}

async fn post_executions(
    State(state): State<AppState>,
    Json(batch): Json<Vec<CandidateExecution>>,
) -> Result<(StatusCode, Json<BatchResult>), ApiError> {
    let cancel = CancellationToken::new();
    let results = state.ingestion.ingest(batch, &cancel).await?;
    let result = BatchResult::from_results(results);

    let status = if result.errored == 0 {
        StatusCode::CREATED
    } else if result.processed > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(result)))
}

async fn post_send(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SendResult>), ApiError> {
    let result = state.send_engine.send_batch().await?;
    let status = match result.status {
        SendStatus::Success | SendStatus::Empty => StatusCode::OK,
        SendStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Ok((status, Json(result)))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> StatusCode {
    match state.store.get_max_batch_start().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::invoker::StubCliInvoker;
    use crate::lookup::stub::{StubOutcome, StubTradeLookupClient};
    use crate::store::memory::InMemoryAllocationStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store: Arc<dyn AllocationStore> = Arc::new(InMemoryAllocationStore::new());
        let lookup = Arc::new(StubTradeLookupClient::with_default(StubOutcome::Portfolio(
            "PORTFOLIO123456789012".into(),
        )));
        let ingestion = Arc::new(IngestionEngine::new(store.clone(), lookup));
        let send_engine = Arc::new(SendEngine::new(
            store.clone(),
            Arc::new(StubCliInvoker::new()),
            std::env::temp_dir().join("api-tests-output"),
            true,
        ));
        AppState {
            store,
            ingestion,
            send_engine,
        }
    }

    #[tokio::test]
    async fn healthz_is_always_200() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_is_200_when_store_reachable() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_executions_happy_path_returns_201() {
        let app = build_router(test_state());
        let body = json!([{
            "externalExecutionId": 123,
            "isOpen": false,
            "status": "FILLED",
            "side": "BUY",
            "destination": "NYSE",
            "securityId": "SEC000000000000000000ABCD",
            "ticker": "AAPL",
            "quantity": "100.5",
            "receivedTimestamp": "2024-01-15T10:00:00Z",
            "sentTimestamp": "2024-01-15T10:01:00Z",
            "quantityFilled": "100.5",
            "totalAmount": "15075.0",
            "averagePrice": "150.0"
        }]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/executions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn post_executions_empty_batch_returns_400() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/executions")
                    .header("content-type", "application/json")
                    .body(Body::from("[]"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_execution_missing_id_returns_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/executions/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_executions_rejects_limit_out_of_range() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/executions?limit=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn post_send_on_empty_store_returns_200_empty() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/executions/send")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn concurrent_post_send_yields_one_conflict() {
        let state = test_state();
        let app1 = build_router(state.clone());
        let app2 = build_router(state);

        let (r1, r2) = tokio::join!(
            app1.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/executions/send")
                    .body(Body::empty())
                    .unwrap(),
            ),
            app2.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/executions/send")
                    .body(Body::empty())
                    .unwrap(),
            ),
        );
        let statuses = [r1.unwrap().status(), r2.unwrap().status()];
        let conflicts = statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count();
        let oks = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        assert_eq!(conflicts + oks, 2);
        assert!(oks >= 1);
    }
}
