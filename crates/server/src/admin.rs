//! Admin endpoints for queue inspection and manual retry.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use kazari_common::AppResult;
use kazari_db::entities::job;
use kazari_queue::{QueueOrchestrator, QueueStatus};

/// Build the admin router.
pub fn router(orchestrator: Arc<QueueOrchestrator>) -> Router {
    Router::new()
        .route("/admin/queue", get(list_queues))
        .route("/admin/queue/{name}", get(queue_detail))
        .route("/admin/queue/jobs/{id}/retry", post(retry_job))
        .with_state(orchestrator)
}

/// GET /admin/queue: snapshot of every queue.
async fn list_queues(
    State(orchestrator): State<Arc<QueueOrchestrator>>,
) -> AppResult<Json<Vec<QueueStatus>>> {
    Ok(Json(orchestrator.status().await?))
}

/// GET /admin/queue/{name}: snapshot of one queue.
async fn queue_detail(
    State(orchestrator): State<Arc<QueueOrchestrator>>,
    Path(name): Path<String>,
) -> AppResult<Json<QueueStatus>> {
    Ok(Json(orchestrator.queue_status(&name).await?))
}

/// POST /admin/queue/jobs/{id}/retry: requeue a Failed job.
async fn retry_job(
    State(orchestrator): State<Arc<QueueOrchestrator>>,
    Path(id): Path<String>,
) -> AppResult<Json<job::Model>> {
    Ok(Json(orchestrator.retry(&id).await?))
}
