//! HTTP/JSON surface of a queue.
//!
//! Child queues reach their parent through `getwork` and `synchronize`;
//! operators use the remaining routes. Paths are shared with
//! [`crate::remote::HttpQueueClient`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::WorkQueueError;
use crate::queue::WorkQueue;
use crate::remote::http::endpoints;
use crate::remote::{
    ErrorBody, GetWorkRequest, MatchedWork, QueueWorkRequest, QueueWorkResponse,
    SetPriorityRequest, SetStatusRequest, SynchronizeRequest, UpdatedResponse,
};
use crate::scheduler::{ElementFilter, ElementStatus, ForcedStatus, WorkQueueElement};

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<WorkQueue>,
}

/// Error body plus the status code its kind maps to.
pub struct ApiError(WorkQueueError);

impl From<WorkQueueError> for ApiError {
    fn from(e: WorkQueueError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            WorkQueueError::NoMatch { .. } => StatusCode::NOT_FOUND,
            WorkQueueError::Configuration(_) | WorkQueueError::Spec(_) => StatusCode::BAD_REQUEST,
            WorkQueueError::RemoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
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

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ElementsQuery {
    pub status: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(endpoints::GET_WORK, post(get_work_handler))
        .route(endpoints::SYNCHRONIZE, post(synchronize_handler))
        .route(endpoints::QUEUE_WORK, post(queue_work_handler))
        .route(endpoints::STATUS, post(set_status_handler))
        .route(endpoints::PRIORITY, post(set_priority_handler))
        .route(endpoints::ELEMENTS, get(elements_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting work queue API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn get_work_handler(
    State(state): State<ApiState>,
    Json(request): Json<GetWorkRequest>,
) -> ApiResult<Vec<MatchedWork>> {
    let work = state
        .queue
        .get_work(&request.site_capacity, request.caller_url.as_deref())
        .await?;
    Ok(Json(work))
}

async fn synchronize_handler(
    State(state): State<ApiState>,
    Json(request): Json<SynchronizeRequest>,
) -> ApiResult<ForcedStatus> {
    let forced = state
        .queue
        .synchronize(&request.child_url, &request.reports)
        .await?;
    Ok(Json(forced))
}

async fn queue_work_handler(
    State(state): State<ApiState>,
    Json(request): Json<QueueWorkRequest>,
) -> ApiResult<QueueWorkResponse> {
    let units = state
        .queue
        .queue_work(&request.url, request.parent_queue_id)
        .await?;
    Ok(Json(QueueWorkResponse { units }))
}

async fn set_status_handler(
    State(state): State<ApiState>,
    Json(request): Json<SetStatusRequest>,
) -> ApiResult<UpdatedResponse> {
    let updated = state
        .queue
        .set_status(request.status, &request.selector, request.source.as_deref())
        .await?;
    Ok(Json(UpdatedResponse { updated }))
}

async fn set_priority_handler(
    State(state): State<ApiState>,
    Json(request): Json<SetPriorityRequest>,
) -> ApiResult<UpdatedResponse> {
    let updated = state
        .queue
        .set_priority(request.priority, &request.workflows)
        .await?;
    Ok(Json(UpdatedResponse { updated }))
}

async fn elements_handler(
    State(state): State<ApiState>,
    Query(query): Query<ElementsQuery>,
) -> ApiResult<Vec<WorkQueueElement>> {
    let mut filter = ElementFilter::default();
    if let Some(ref status) = query.status {
        let status: ElementStatus = status
            .parse()
            .map_err(WorkQueueError::Configuration)?;
        filter.status = Some(status);
    }
    Ok(Json(state.queue.status(&filter).await))
}
